//! Typed error hierarchy for the reconductor orchestrator.
//!
//! Four enums cover the layers of the core:
//! - `StoreError` — marker, state and checkpoint persistence
//! - `ToolError` — external command spawning
//! - `PhaseError` — failures recorded against a single phase
//! - `OrchestratorError` — fatal conditions that abort a run before any phase

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the on-disk stores (markers, state document, checkpoints, ledger).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt document at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint '{id}' not found")]
    CheckpointNotFound { id: String },

    #[error("Invalid identifier '{0}': only ASCII letters, digits, '-', '_' and '.' are allowed")]
    InvalidId(String),

    #[error("Invalid phase id '{0}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidPhaseId(String),

    #[error("Phase id '{0}' is reserved for the run directory")]
    ReservedPhaseId(String),

    #[error("State lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from launching or supervising an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to spawn tool '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for tool '{name}': {source}")]
    WaitFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run was cancelled before '{name}' could be registered")]
    Cancelled { name: String },
}

/// Errors recorded against a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Failed to write {state} marker for phase {phase}: {source}")]
    MarkerWrite {
        phase: String,
        state: String,
        #[source]
        source: StoreError,
    },

    #[error("Phase {phase} failed: {message}")]
    Body { phase: String, message: String },
}

/// Fatal errors that abort the run before any phase executes.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Cannot prepare run directory {path}: {source}")]
    RunDirUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Duplicate phase id '{0}'")]
    DuplicatePhase(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
