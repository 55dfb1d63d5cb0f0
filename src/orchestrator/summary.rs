//! Outcome types for phase executions and whole runs.
//!
//! `PhaseResult` is produced by the executor for every phase in the pipeline;
//! `RunSummary` aggregates them and maps the run to a process exit code.
//! `RunRecord` is the JSON document persisted under `runs/` when a run ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::pipeline_config::FailurePolicy;
use crate::util::atomic_write;

/// Exit code for a run interrupted by a signal (128 + SIGINT).
pub const EXIT_INTERRUPTED: u8 = 130;

/// Why a phase was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Resumed run and the phase already has a `completed` marker
    AlreadyCompleted,
    /// Disabled in configuration
    Disabled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyCompleted => write!(f, "already completed"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Terminal status of one phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Skipped(SkipReason),
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

/// Result of executing (or skipping) a single phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    #[serde(flatten)]
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Failure reason, including the error chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl PhaseResult {
    pub fn completed(phase: &str, summary: &str, duration: Duration) -> Self {
        Self {
            phase: phase.to_string(),
            status: PhaseStatus::Completed,
            summary: Some(summary.to_string()),
            error: None,
            duration,
        }
    }

    pub fn failed(phase: &str, error: &str, duration: Duration) -> Self {
        Self {
            phase: phase.to_string(),
            status: PhaseStatus::Failed,
            summary: None,
            error: Some(error.to_string()),
            duration,
        }
    }

    pub fn skipped(phase: &str, reason: SkipReason) -> Self {
        Self {
            phase: phase.to_string(),
            status: PhaseStatus::Skipped(reason),
            summary: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == PhaseStatus::Failed
    }
}

/// Aggregated outcome of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// One entry per phase that was reached, in pipeline order
    pub results: Vec<PhaseResult>,
    /// Fail-fast stopped the run before the remaining phases
    pub halted: bool,
    /// A shutdown signal ended the run
    pub interrupted: bool,
}

impl RunSummary {
    pub fn push(&mut self, result: PhaseResult) {
        self.results.push(result);
    }

    pub fn completed(&self) -> Vec<&str> {
        self.with_status(|s| *s == PhaseStatus::Completed)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.with_status(|s| *s == PhaseStatus::Failed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.with_status(|s| matches!(s, PhaseStatus::Skipped(_)))
    }

    fn with_status(&self, pred: impl Fn(&PhaseStatus) -> bool) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| pred(&r.status))
            .map(|r| r.phase.as_str())
            .collect()
    }

    pub fn result(&self, phase: &str) -> Option<&PhaseResult> {
        self.results.iter().find(|r| r.phase == phase)
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(PhaseResult::is_failed)
    }

    /// Final value persisted under the `run_status` state key.
    pub fn status_label(&self) -> &'static str {
        if self.interrupted {
            "interrupted"
        } else if self.halted {
            "halted"
        } else if self.has_failures() {
            "completed_with_failures"
        } else {
            "completed"
        }
    }

    /// Process exit code: 130 when interrupted, 1 on any failure or halt, 0 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.halted || self.has_failures() {
            1
        } else {
            0
        }
    }
}

/// Persisted record of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resume: bool,
    pub policy: FailurePolicy,
    pub status: String,
    pub exit_code: u8,
    #[serde(flatten)]
    pub summary: RunSummary,
}

impl RunRecord {
    /// Write the record to `<runs_dir>/<started>_<run-id-prefix>.json`.
    pub fn save(&self, runs_dir: &Path) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(runs_dir).map_err(|e| StoreError::io(runs_dir, e))?;
        let filename = format!(
            "{}_{}.json",
            self.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &self.run_id.to_string()[..8]
        );
        let path = runs_dir.join(filename);
        let json = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Serialize {
            what: "run record",
            source,
        })?;
        atomic_write(&path, &json)?;
        Ok(path)
    }

    /// All run records in `runs_dir`, oldest first. Unreadable files are skipped.
    pub fn list(runs_dir: &Path) -> Result<Vec<RunRecord>, StoreError> {
        let read_dir = match fs::read_dir(runs_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(runs_dir, e)),
        };
        let mut records: Vec<RunRecord> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| fs::read_to_string(path).ok())
            .filter_map(|content| serde_json::from_str(&content).ok())
            .collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
