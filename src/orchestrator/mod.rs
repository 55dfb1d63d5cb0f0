pub mod runner;
pub mod summary;

pub use runner::{Orchestrator, RunObserver, RunOptions, wait_for_shutdown_signal};
pub use summary::{EXIT_INTERRUPTED, PhaseResult, PhaseStatus, RunRecord, RunSummary, SkipReason};
