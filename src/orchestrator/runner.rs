use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::OrchestratorError;
use crate::executor::PhaseExecutor;
use crate::ledger::FailureLedger;
use crate::markers::MarkerStore;
use crate::orchestrator::summary::{PhaseResult, PhaseStatus, RunRecord, RunSummary, SkipReason};
use crate::phase::{Phase, RunContext};
use crate::pipeline_config::FailurePolicy;
use crate::process::ProcessRegistry;
use crate::util::validate_phase_id;
use crate::state::{
    CURRENT_PHASE_KEY, LAST_COMPLETED_PHASE_KEY, LAST_PHASE_KEY, LAST_PHASE_STATUS_KEY,
    RUN_STATUS_KEY, StateStore,
};

/// Per-run switches, resolved from config and CLI flags.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Skip phases that already have a `completed` marker
    pub resume: bool,
    pub policy: FailurePolicy,
    /// Take a checkpoint after every N executed phases; 0 disables
    pub checkpoint_every: usize,
    /// How long an interrupted phase may take to wind down
    pub drain_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: false,
            policy: FailurePolicy::default(),
            checkpoint_every: 1,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Progress callbacks, used by the terminal UI.
pub trait RunObserver: Send + Sync {
    fn phase_started(&self, _phase: &Phase) {}
    fn phase_finished(&self, _phase: &Phase, _result: &PhaseResult) {}
}

/// Drives the ordered phase list for one target.
///
/// Phases run strictly in sequence; phase N+1 never starts before phase N's
/// executor has returned. Every run ends through the same path, whether it
/// finished, halted or was interrupted.
pub struct Orchestrator {
    phases: Vec<Phase>,
    executor: PhaseExecutor,
    state: Arc<StateStore>,
    ledger: Arc<FailureLedger>,
    registry: Arc<ProcessRegistry>,
    options: RunOptions,
    runs_dir: Option<PathBuf>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl Orchestrator {
    pub fn new(
        mut phases: Vec<Phase>,
        markers: Arc<MarkerStore>,
        state: Arc<StateStore>,
        ledger: Arc<FailureLedger>,
        registry: Arc<ProcessRegistry>,
        options: RunOptions,
    ) -> Result<Self, OrchestratorError> {
        let mut seen = std::collections::HashSet::new();
        for (index, phase) in phases.iter_mut().enumerate() {
            validate_phase_id(&phase.id)?;
            if !seen.insert(phase.id.clone()) {
                return Err(OrchestratorError::DuplicatePhase(phase.id.clone()));
            }
            phase.index = index;
        }

        Ok(Self {
            phases,
            executor: PhaseExecutor::new(markers, ledger.clone()),
            state,
            ledger,
            registry,
            options,
            runs_dir: None,
            observer: None,
        })
    }

    /// Persist a run record under `dir` when the run ends.
    pub fn with_runs_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.runs_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run the pipeline until it finishes or `shutdown` resolves.
    ///
    /// On shutdown every registered process is cancelled and the in-flight
    /// phase gets `drain_timeout` to record its outcome before the run is
    /// closed. A phase still running after that is reported as failed.
    pub async fn run<F>(&self, ctx: &mut RunContext, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let mut summary = RunSummary::default();
        self.save_state(RUN_STATUS_KEY, "running");
        tracing::info!(
            scan_target = %ctx.target,
            phases = self.phases.len(),
            resume = self.options.resume,
            policy = %self.options.policy,
            run_id = %self.ledger.run_id(),
            "run started"
        );

        let mut in_flight: Option<(usize, Instant)> = None;
        let interrupted = {
            let drive = self.drive(ctx, &mut summary, &mut in_flight);
            tokio::pin!(drive);
            tokio::pin!(shutdown);

            let interrupted = tokio::select! {
                _ = &mut drive => false,
                _ = &mut shutdown => true,
            };
            if interrupted {
                tracing::warn!("shutdown requested, cancelling running tools");
                self.registry.cancel_all().await;
                if tokio::time::timeout(self.options.drain_timeout, &mut drive)
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        drain_timeout_secs = self.options.drain_timeout.as_secs(),
                        "in-flight phase did not finish before the drain timeout"
                    );
                }
            }
            interrupted
        };
        summary.interrupted = interrupted;
        if let Some((index, started)) = in_flight {
            self.abandon(&self.phases[index], started, &mut summary);
        }

        self.finish(&summary, started_at).await;
        summary
    }

    async fn drive(
        &self,
        ctx: &mut RunContext,
        summary: &mut RunSummary,
        in_flight: &mut Option<(usize, Instant)>,
    ) {
        let mut executed = 0usize;

        for phase in &self.phases {
            if self.registry.is_cancelled() {
                tracing::warn!(phase = %phase.id, "run cancelled, not starting phase");
                break;
            }
            ctx.current_phase_index = phase.index;

            if !phase.enabled {
                tracing::info!(phase = %phase.id, "phase disabled, skipping");
                let result = PhaseResult::skipped(&phase.id, SkipReason::Disabled);
                self.notify_finished(phase, &result);
                summary.push(result);
                continue;
            }

            if let Some(observer) = &self.observer {
                observer.phase_started(phase);
            }
            self.save_state(CURRENT_PHASE_KEY, &phase.id);

            *in_flight = Some((phase.index, Instant::now()));
            let result = self.executor.execute(phase, ctx, self.options.resume).await;
            *in_flight = None;
            self.notify_finished(phase, &result);

            if matches!(result.status, PhaseStatus::Skipped(_)) {
                summary.push(result);
                continue;
            }

            self.save_state(LAST_PHASE_KEY, &phase.id);
            self.save_state(LAST_PHASE_STATUS_KEY, result.status.as_str());
            if result.status == PhaseStatus::Completed {
                self.save_state(LAST_COMPLETED_PHASE_KEY, &phase.id);
            }

            executed += 1;
            if self.options.checkpoint_every > 0 && executed % self.options.checkpoint_every == 0 {
                self.take_checkpoint(phase, &result);
            }

            let failed = result.is_failed();
            summary.push(result);
            if failed && self.options.policy == FailurePolicy::FailFast {
                tracing::warn!(phase = %phase.id, "fail-fast: halting run");
                summary.halted = true;
                break;
            }
        }
    }

    /// End-of-run path: stop every process, flush final state, write the run record.
    async fn finish(&self, summary: &RunSummary, started_at: chrono::DateTime<Utc>) {
        let report = self.registry.cancel_all().await;
        if report.signalled > 0 {
            tracing::warn!(
                signalled = report.signalled,
                forced = report.forced,
                "terminated leftover processes"
            );
        }

        let status = summary.status_label();
        self.save_state(RUN_STATUS_KEY, status);

        if let Some(runs_dir) = &self.runs_dir {
            let record = RunRecord {
                run_id: self.ledger.run_id(),
                target: self.state.target().to_string(),
                started_at,
                finished_at: Utc::now(),
                resume: self.options.resume,
                policy: self.options.policy,
                status: status.to_string(),
                exit_code: summary.exit_code(),
                summary: summary.clone(),
            };
            match record.save(runs_dir) {
                Ok(path) => tracing::debug!(path = %path.display(), "run record written"),
                Err(e) => tracing::warn!(error = %e, "could not write run record"),
            }
        }

        tracing::info!(
            status,
            completed = summary.completed().len(),
            failed = summary.failed().len(),
            skipped = summary.skipped().len(),
            "run finished"
        );
    }

    /// Account for a phase dropped by the drain timeout. Its started marker
    /// stays without a terminal marker, so a resumed run retries it.
    fn abandon(&self, phase: &Phase, started: Instant, summary: &mut RunSummary) {
        let reason = "interrupted before the phase finished";
        tracing::warn!(phase = %phase.id, "{}", reason);
        if let Err(e) = self.ledger.record(&phase.id, &phase.group, reason) {
            tracing::warn!(phase = %phase.id, error = %e, "could not record failure");
        }
        let result = PhaseResult::failed(&phase.id, reason, started.elapsed());
        self.notify_finished(phase, &result);
        summary.push(result);
    }

    fn take_checkpoint(&self, phase: &Phase, result: &PhaseResult) {
        let name = format!("after-{}", phase.id);
        let description = format!("{} {}", phase.id, result.status.as_str());
        match self.state.checkpoint(Some(&name), Some(&description)) {
            Ok(id) => tracing::debug!(checkpoint = %id, "checkpoint created"),
            Err(e) => tracing::warn!(phase = %phase.id, error = %e, "checkpoint failed"),
        }
    }

    /// State writes between phases never abort the run.
    fn save_state(&self, key: &str, value: &str) {
        if let Err(e) = self.state.save(key, value) {
            tracing::warn!(key, error = %e, "could not persist state entry");
        }
    }

    fn notify_finished(&self, phase: &Phase, result: &PhaseResult) {
        if let Some(observer) = &self.observer {
            observer.phase_finished(phase, result);
        }
    }
}

/// Wait for SIGTERM or SIGINT. Returns the name of the signal received.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
