//! Library-level tests for a full orchestrated run.
//!
//! Phase bodies here are in-process closures with call counters, so the
//! tests observe exactly which phases were invoked.

use async_trait::async_trait;
use reconductor::ledger::FailureLedger;
use reconductor::markers::{MarkerState, MarkerStore};
use reconductor::orchestrator::{
    EXIT_INTERRUPTED, Orchestrator, PhaseStatus, RunOptions, RunSummary, SkipReason,
};
use reconductor::phase::{Phase, PhaseBody, PhaseReport, RunContext};
use reconductor::pipeline_config::FailurePolicy;
use reconductor::process::{ProcessRegistry, ToolOutcome, ToolRunner};
use reconductor::state::{LAST_COMPLETED_PHASE_KEY, RUN_STATUS_KEY, StateStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uuid::Uuid;

/// Phase body that counts invocations and succeeds or fails on demand.
struct Scripted {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl Scripted {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    fn failing() -> Arc<Self> {
        let body = Self::ok();
        body.fail.store(true, Ordering::SeqCst);
        body
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PhaseBody for Scripted {
    async fn run(&self, _ctx: &RunContext) -> anyhow::Result<PhaseReport> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("scripted failure on call {}", n)
        }
        Ok(PhaseReport::new(format!("call {}", n)))
    }
}

/// Phase body that runs a long external tool.
struct Sleeper;

#[async_trait]
impl PhaseBody for Sleeper {
    async fn run(&self, ctx: &RunContext) -> anyhow::Result<PhaseReport> {
        match ctx
            .tools
            .run("sleeper", Duration::from_secs(60), "sleep 30")
            .await?
        {
            ToolOutcome::Success => Ok(PhaseReport::new("slept")),
            other => anyhow::bail!("sleep ended early: {}", other),
        }
    }
}

struct RunDir {
    _tmp: TempDir,
    root: PathBuf,
}

impl RunDir {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("example.com");
        std::fs::create_dir_all(&root).unwrap();
        Self { _tmp: tmp, root }
    }

    fn markers(&self) -> Arc<MarkerStore> {
        Arc::new(MarkerStore::new(self.root.join("markers")))
    }

    fn state(&self) -> Arc<StateStore> {
        Arc::new(StateStore::new(self.root.join("state"), "example.com"))
    }

    fn ledger(&self) -> Arc<FailureLedger> {
        Arc::new(FailureLedger::new(
            self.root.join("failures.jsonl"),
            Uuid::new_v4(),
        ))
    }
}

async fn run_phases(
    dir: &RunDir,
    phases: Vec<Phase>,
    options: RunOptions,
) -> (RunSummary, Arc<ProcessRegistry>) {
    let registry = Arc::new(ProcessRegistry::new(Duration::from_millis(200)));
    let state = dir.state();
    let mut ctx = context(&dir.root, state.clone(), registry.clone());
    let orchestrator = Orchestrator::new(
        phases,
        dir.markers(),
        state,
        dir.ledger(),
        registry.clone(),
        options,
    )
    .unwrap();
    let summary = orchestrator.run(&mut ctx, std::future::pending()).await;
    (summary, registry)
}

fn context(root: &Path, state: Arc<StateStore>, registry: Arc<ProcessRegistry>) -> RunContext {
    RunContext::new(
        root,
        "example.com",
        root.join("markers"),
        state,
        ToolRunner::new(registry).with_log_dir(root.join("logs/tools")),
    )
}

fn abc(a: &Arc<Scripted>, b: &Arc<Scripted>, c: &Arc<Scripted>) -> Vec<Phase> {
    vec![
        Phase::new("a", "recon", a.clone()),
        Phase::new("b", "recon", b.clone()),
        Phase::new("c", "recon", c.clone()),
    ]
}

fn options(policy: FailurePolicy, resume: bool) -> RunOptions {
    RunOptions {
        resume,
        policy,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_best_effort_runs_every_phase() {
    let dir = RunDir::new();
    let (a, b, c) = (Scripted::ok(), Scripted::failing(), Scripted::ok());

    let (summary, _) = run_phases(
        &dir,
        abc(&a, &b, &c),
        options(FailurePolicy::BestEffort, false),
    )
    .await;

    assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));
    assert_eq!(summary.completed(), vec!["a", "c"]);
    assert_eq!(summary.failed(), vec!["b"]);
    assert!(!summary.halted);
    assert_ne!(summary.exit_code(), 0);

    let ledger = dir.ledger().entries().unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].phase, "b");
    assert_eq!(ledger[0].group, "recon");
}

#[tokio::test]
async fn test_fail_fast_halts_before_next_phase() {
    let dir = RunDir::new();
    let (a, b, c) = (Scripted::ok(), Scripted::failing(), Scripted::ok());

    let (summary, _) = run_phases(
        &dir,
        abc(&a, &b, &c),
        options(FailurePolicy::FailFast, false),
    )
    .await;

    assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 0));
    assert!(summary.halted);
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.result("c").is_none());

    let markers = dir.markers();
    for state in [
        MarkerState::Started,
        MarkerState::Completed,
        MarkerState::Failed,
    ] {
        assert!(!markers.exists("c", state), "c has a {} marker", state);
    }
    assert_eq!(dir.state().load(RUN_STATUS_KEY, ""), "halted");
}

#[tokio::test]
async fn test_exactly_one_terminal_marker_per_reached_phase() {
    let dir = RunDir::new();
    let phases = vec![
        Phase::new("a", "g", Scripted::ok()),
        Phase::new("b", "g", Scripted::failing()),
        Phase::new("off", "g", Scripted::ok()).with_enabled(false),
        Phase::new("c", "g", Scripted::ok()),
    ];
    run_phases(&dir, phases, RunOptions::default()).await;

    let markers = dir.markers();
    for id in ["a", "b", "c"] {
        let completed = markers.exists(id, MarkerState::Completed);
        let failed = markers.exists(id, MarkerState::Failed);
        assert!(completed ^ failed, "phase {} must have exactly one terminal marker", id);
    }
    assert!(!markers.exists("off", MarkerState::Completed));
    assert!(!markers.exists("off", MarkerState::Failed));
}

#[tokio::test]
async fn test_resume_skips_completed_and_retries_failed() {
    let dir = RunDir::new();

    // First run: a and b complete, c fails.
    let (a, b, c) = (Scripted::ok(), Scripted::ok(), Scripted::failing());
    let (first, _) = run_phases(&dir, abc(&a, &b, &c), RunOptions::default()).await;
    assert_eq!(first.failed(), vec!["c"]);

    // Resumed run with fresh counters; c now succeeds.
    let (a2, b2, c2) = (Scripted::ok(), Scripted::ok(), Scripted::ok());
    let (second, _) = run_phases(
        &dir,
        abc(&a2, &b2, &c2),
        options(FailurePolicy::BestEffort, true),
    )
    .await;

    assert_eq!((a2.calls(), b2.calls(), c2.calls()), (0, 0, 1));
    assert_eq!(
        second.result("a").unwrap().status,
        PhaseStatus::Skipped(SkipReason::AlreadyCompleted)
    );
    assert_eq!(
        second.result("b").unwrap().status,
        PhaseStatus::Skipped(SkipReason::AlreadyCompleted)
    );
    assert_eq!(second.completed(), vec!["c"]);
    assert_eq!(second.exit_code(), 0);

    let markers = dir.markers();
    assert!(markers.exists("c", MarkerState::Completed));
    assert!(!markers.exists("c", MarkerState::Failed));
    assert_eq!(dir.state().load(LAST_COMPLETED_PHASE_KEY, ""), "c");
}

#[tokio::test]
async fn test_resume_is_idempotent_for_completed_phase() {
    let dir = RunDir::new();
    let a = Scripted::ok();
    run_phases(
        &dir,
        vec![Phase::new("a", "g", a.clone())],
        RunOptions::default(),
    )
    .await;
    let payload = dir
        .markers()
        .read_payload("a", MarkerState::Completed)
        .unwrap();

    for _ in 0..2 {
        run_phases(
            &dir,
            vec![Phase::new("a", "g", a.clone())],
            options(FailurePolicy::BestEffort, true),
        )
        .await;
    }

    assert_eq!(a.calls(), 1);
    assert_eq!(
        dir.markers()
            .read_payload("a", MarkerState::Completed)
            .unwrap(),
        payload
    );
}

#[test]
fn test_checkpoint_round_trip_ignores_later_mutations() {
    let dir = RunDir::new();
    let state = dir.state();
    state.save("current_phase", "dns").unwrap();
    state.save("hosts", "12").unwrap();
    let before = state.entries();

    let id = state.checkpoint(Some("before-ports"), None).unwrap();

    state.save("current_phase", "ports").unwrap();
    state.save("open_ports", "443").unwrap();
    assert_ne!(state.entries(), before);

    state.restore(&id).unwrap();
    assert_eq!(state.entries(), before);
}

#[tokio::test]
async fn test_cancel_all_with_no_processes_returns_immediately() {
    let registry = ProcessRegistry::new(Duration::from_secs(5));
    let start = Instant::now();
    let report = registry.cancel_all().await;
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(report.signalled, 0);
    assert_eq!(report.forced, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancel_all_terminates_every_registered_process() {
    let registry = ProcessRegistry::new(Duration::from_millis(300));
    let mut children = Vec::new();
    for i in 0..3 {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            // The second child ignores SIGTERM and must be killed.
            .arg(if i == 1 { "trap '' TERM; sleep 30" } else { "sleep 30" })
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        registry
            .register(child.id().unwrap(), &format!("sleep-{}", i))
            .unwrap();
        children.push(child);
    }
    assert_eq!(registry.len(), 3);

    registry.cancel_all().await;

    for mut child in children {
        let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .expect("child still running after cancel_all")
            .unwrap();
        assert!(!status.success());
    }
    assert!(registry.is_empty());
    assert!(registry.is_cancelled());
}

#[cfg(unix)]
#[tokio::test]
async fn test_interrupt_routes_through_end_of_run_path() {
    let dir = RunDir::new();
    let registry = Arc::new(ProcessRegistry::new(Duration::from_millis(200)));
    let state = dir.state();
    let mut ctx = context(&dir.root, state.clone(), registry.clone());
    let after = Scripted::ok();

    let orchestrator = Orchestrator::new(
        vec![
            Phase::new("long", "g", Arc::new(Sleeper)),
            Phase::new("after", "g", after.clone()),
        ],
        dir.markers(),
        state.clone(),
        dir.ledger(),
        registry.clone(),
        RunOptions {
            drain_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    )
    .unwrap()
    .with_runs_dir(dir.root.join("runs"));

    let start = Instant::now();
    let summary = orchestrator
        .run(&mut ctx, tokio::time::sleep(Duration::from_millis(300)))
        .await;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(summary.interrupted);
    assert_eq!(summary.exit_code(), EXIT_INTERRUPTED);
    assert_eq!(after.calls(), 0);
    assert!(registry.is_empty());
    assert_eq!(state.load(RUN_STATUS_KEY, ""), "interrupted");

    let markers = dir.markers();
    assert_eq!(markers.terminal_state("long"), Some(MarkerState::Failed));
    assert!(!markers.exists("after", MarkerState::Started));

    let records = reconductor::orchestrator::RunRecord::list(&dir.root.join("runs")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "interrupted");
}

#[tokio::test]
async fn test_state_corruption_degrades_to_defaults() {
    let dir = RunDir::new();
    std::fs::create_dir_all(dir.root.join("state")).unwrap();
    std::fs::write(dir.root.join("state/current.json"), "{ not json").unwrap();

    let (summary, _) = run_phases(
        &dir,
        vec![Phase::new("a", "g", Scripted::ok())],
        RunOptions::default(),
    )
    .await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(dir.state().load(LAST_COMPLETED_PHASE_KEY, ""), "a");
}
