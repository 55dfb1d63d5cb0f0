//! Append-only ledger of phase failures for a run directory.
//!
//! One JSON object per line. Records are never rewritten; the ledger is read
//! back for the end-of-run summary and the `status` command.

use crate::errors::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub phase: String,
    pub group: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Run that recorded the failure.
    pub run_id: Uuid,
}

pub struct FailureLedger {
    path: PathBuf,
    run_id: Uuid,
}

impl FailureLedger {
    pub fn new(path: impl AsRef<Path>, run_id: Uuid) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            run_id,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append a failure record for `phase`.
    pub fn record(&self, phase: &str, group: &str, reason: &str) -> Result<(), StoreError> {
        let record = FailureRecord {
            phase: phase.to_string(),
            group: group.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
            run_id: self.run_id,
        };
        let mut line = serde_json::to_string(&record).map_err(|source| StoreError::Serialize {
            what: "failure record",
            source,
        })?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        // A single write on an O_APPEND descriptor keeps concurrent records
        // from interleaving within a line.
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|e| StoreError::io(&self.path, e))?;

        tracing::debug!(phase, group, "failure recorded in ledger");
        Ok(())
    }

    /// All records, oldest first. Malformed lines are skipped.
    pub fn entries(&self) -> Result<Vec<FailureRecord>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Records written by this ledger's run.
    pub fn entries_for_run(&self) -> Result<Vec<FailureRecord>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|r| r.run_id == self.run_id)
            .collect())
    }
}
