//! Per-phase state machine: `Pending -> Started -> {Completed, Failed}`.
//!
//! The executor is the only writer of phase markers during a run. It never
//! propagates a phase error; the orchestrator decides what a failure means
//! for the run.

use std::sync::Arc;
use std::time::Instant;

use crate::errors::PhaseError;
use crate::ledger::FailureLedger;
use crate::markers::{MarkerRecord, MarkerState, MarkerStore};
use crate::orchestrator::{PhaseResult, SkipReason};
use crate::phase::{Phase, RunContext};

pub struct PhaseExecutor {
    markers: Arc<MarkerStore>,
    ledger: Arc<FailureLedger>,
}

impl PhaseExecutor {
    pub fn new(markers: Arc<MarkerStore>, ledger: Arc<FailureLedger>) -> Self {
        Self { markers, ledger }
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Run one phase to a terminal state.
    ///
    /// With `resume` set, a phase that already has a `completed` marker is
    /// skipped without invoking its body or touching the marker.
    pub async fn execute(&self, phase: &Phase, ctx: &RunContext, resume: bool) -> PhaseResult {
        if resume && self.markers.exists(&phase.id, MarkerState::Completed) {
            tracing::info!(phase = %phase.id, "phase already completed, skipping");
            return PhaseResult::skipped(&phase.id, SkipReason::AlreadyCompleted);
        }

        let start = Instant::now();
        tracing::info!(phase = %phase.id, index = phase.index, "phase started");

        let started = MarkerRecord::new(&phase.id, MarkerState::Started);
        if let Err(e) = self.write_marker(phase, MarkerState::Started, &started) {
            return self.fail(phase, &e.to_string(), start);
        }

        match phase.body.run(ctx).await {
            Ok(report) => {
                let record =
                    MarkerRecord::new(&phase.id, MarkerState::Completed).with_summary(&report.summary);
                match self.write_terminal(phase, MarkerState::Completed, &record) {
                    Ok(()) => {
                        tracing::info!(
                            phase = %phase.id,
                            summary = %report.summary,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "phase completed"
                        );
                        PhaseResult::completed(&phase.id, &report.summary, start.elapsed())
                    }
                    Err(e) => self.fail(phase, &e.to_string(), start),
                }
            }
            Err(e) => {
                let err = PhaseError::Body {
                    phase: phase.id.clone(),
                    message: format!("{:#}", e),
                };
                self.fail(phase, &err.to_string(), start)
            }
        }
    }

    /// Record a failure: `failed` marker, ledger entry, log line.
    fn fail(&self, phase: &Phase, reason: &str, start: Instant) -> PhaseResult {
        tracing::error!(phase = %phase.id, group = %phase.group, reason, "phase failed");

        let record = MarkerRecord::new(&phase.id, MarkerState::Failed).with_reason(reason);
        if let Err(e) = self.write_terminal(phase, MarkerState::Failed, &record) {
            tracing::error!(phase = %phase.id, error = %e, "could not record failure marker");
        }
        if let Err(e) = self.ledger.record(&phase.id, &phase.group, reason) {
            tracing::error!(phase = %phase.id, error = %e, "could not append to failure ledger");
        }
        PhaseResult::failed(&phase.id, reason, start.elapsed())
    }

    /// Retire the opposite terminal marker left by an earlier attempt, then
    /// write `state`.
    fn write_terminal(
        &self,
        phase: &Phase,
        state: MarkerState,
        record: &MarkerRecord,
    ) -> Result<(), PhaseError> {
        if let Some(opposite) = state.opposite() {
            self.markers
                .retire(&phase.id, opposite)
                .map_err(|source| PhaseError::MarkerWrite {
                    phase: phase.id.clone(),
                    state: opposite.to_string(),
                    source,
                })?;
        }
        self.write_marker(phase, state, record)
    }

    fn write_marker(
        &self,
        phase: &Phase,
        state: MarkerState,
        record: &MarkerRecord,
    ) -> Result<(), PhaseError> {
        self.markers
            .write(&phase.id, state, Some(record))
            .map_err(|source| PhaseError::MarkerWrite {
                phase: phase.id.clone(),
                state: state.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::PhaseStatus;
    use crate::phase::{PhaseBody, PhaseReport};
    use crate::process::{ProcessRegistry, ToolRunner};
    use crate::state::StateStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use uuid::Uuid;

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Counting {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PhaseBody for Counting {
        async fn run(&self, _ctx: &RunContext) -> anyhow::Result<PhaseReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow::anyhow!("scanner crashed").context("probe step"))
            } else {
                Ok(PhaseReport::new("3 hosts found"))
            }
        }
    }

    fn setup(dir: &Path) -> (PhaseExecutor, RunContext, Arc<FailureLedger>) {
        let markers = Arc::new(MarkerStore::new(dir.join("markers")));
        let ledger = Arc::new(FailureLedger::new(
            dir.join("failures.jsonl"),
            Uuid::new_v4(),
        ));
        let state = Arc::new(StateStore::new(dir.join("state"), "example.com"));
        let registry = Arc::new(ProcessRegistry::new(Duration::from_millis(100)));
        let ctx = RunContext::new(
            dir,
            "example.com",
            dir.join("markers"),
            state,
            ToolRunner::new(registry),
        );
        (PhaseExecutor::new(markers, ledger.clone()), ctx, ledger)
    }

    #[tokio::test]
    async fn test_success_writes_completed_marker() {
        let dir = tempdir().unwrap();
        let (executor, ctx, ledger) = setup(dir.path());
        let body = Counting::new(false);
        let phase = Phase::new("dns", "hosts", body.clone());

        let result = executor.execute(&phase, &ctx, false).await;
        assert_eq!(result.status, PhaseStatus::Completed);
        assert_eq!(result.summary.as_deref(), Some("3 hosts found"));
        assert_eq!(body.calls(), 1);

        let markers = executor.markers();
        assert!(markers.exists("dns", MarkerState::Started));
        assert!(markers.exists("dns", MarkerState::Completed));
        assert!(!markers.exists("dns", MarkerState::Failed));
        let record = markers.read("dns", MarkerState::Completed).unwrap();
        assert_eq!(record.summary.as_deref(), Some("3 hosts found"));
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_writes_failed_marker_and_ledger() {
        let dir = tempdir().unwrap();
        let (executor, ctx, ledger) = setup(dir.path());
        let phase = Phase::new("ports", "hosts", Counting::new(true));

        let result = executor.execute(&phase, &ctx, false).await;
        assert_eq!(result.status, PhaseStatus::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("probe step"));
        assert!(error.contains("scanner crashed"));

        let record = executor.markers().read("ports", MarkerState::Failed).unwrap();
        assert_eq!(record.phase, "ports");
        assert!(record.reason.unwrap().contains("scanner crashed"));
        assert!(!executor.markers().exists("ports", MarkerState::Completed));

        let entries = ledger.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].phase, "ports");
        assert_eq!(entries[0].group, "hosts");
    }

    #[tokio::test]
    async fn test_resume_skips_completed_without_touching_marker() {
        let dir = tempdir().unwrap();
        let (executor, ctx, _ledger) = setup(dir.path());
        let body = Counting::new(false);
        let phase = Phase::new("web", "web", body.clone());

        executor.execute(&phase, &ctx, false).await;
        let before = executor
            .markers()
            .read_payload("web", MarkerState::Completed)
            .unwrap();

        for _ in 0..2 {
            let result = executor.execute(&phase, &ctx, true).await;
            assert_eq!(
                result.status,
                PhaseStatus::Skipped(SkipReason::AlreadyCompleted)
            );
        }
        assert_eq!(body.calls(), 1);
        let after = executor
            .markers()
            .read_payload("web", MarkerState::Completed)
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_without_resume_completed_phase_reruns() {
        let dir = tempdir().unwrap();
        let (executor, ctx, _ledger) = setup(dir.path());
        let body = Counting::new(false);
        let phase = Phase::new("web", "web", body.clone());

        executor.execute(&phase, &ctx, false).await;
        executor.execute(&phase, &ctx, false).await;
        assert_eq!(body.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_after_failure_leaves_single_terminal_marker() {
        let dir = tempdir().unwrap();
        let (executor, ctx, _ledger) = setup(dir.path());

        let failing = Phase::new("vulns", "web", Counting::new(true));
        executor.execute(&failing, &ctx, false).await;
        assert_eq!(
            executor.markers().terminal_state("vulns"),
            Some(MarkerState::Failed)
        );

        let fixed = Phase::new("vulns", "web", Counting::new(false));
        let result = executor.execute(&fixed, &ctx, true).await;
        assert_eq!(result.status, PhaseStatus::Completed);
        assert!(executor.markers().exists("vulns", MarkerState::Completed));
        assert!(!executor.markers().exists("vulns", MarkerState::Failed));
    }

    #[tokio::test]
    async fn test_marker_write_failure_fails_phase() {
        let dir = tempdir().unwrap();
        let (_, ctx, ledger) = setup(dir.path());
        // A regular file where the marker directory should be
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, "").unwrap();
        let executor = PhaseExecutor::new(Arc::new(MarkerStore::new(&blocked)), ledger.clone());

        let body = Counting::new(false);
        let phase = Phase::new("osint", "recon", body.clone());
        let result = executor.execute(&phase, &ctx, false).await;

        assert_eq!(result.status, PhaseStatus::Failed);
        assert!(result.error.unwrap().contains("started marker"));
        assert_eq!(body.calls(), 0);
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }
}
