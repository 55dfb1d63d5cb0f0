//! Presence-based phase markers.
//!
//! A marker is the file `<marker_dir>/<phase>.<state>`. Its presence is the
//! fact; its content is an optional JSON payload. Markers are only ever
//! created or overwritten, never removed. A marker that must stop counting
//! (a stale terminal marker from an earlier attempt) is renamed to a
//! `*.retired-<timestamp>` history entry instead.

use crate::errors::StoreError;
use crate::util::{atomic_write, validate_phase_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Lifecycle state a marker records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerState {
    Started,
    Completed,
    Failed,
}

impl MarkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerState::Started => "started",
            MarkerState::Completed => "completed",
            MarkerState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MarkerState::Completed | MarkerState::Failed)
    }

    /// The other terminal state, if this one is terminal.
    pub fn opposite(&self) -> Option<MarkerState> {
        match self {
            MarkerState::Completed => Some(MarkerState::Failed),
            MarkerState::Failed => Some(MarkerState::Completed),
            MarkerState::Started => None,
        }
    }
}

impl fmt::Display for MarkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload stored inside a marker file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub phase: String,
    pub state: MarkerState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl MarkerRecord {
    pub fn new(phase: &str, state: MarkerState) -> Self {
        Self {
            phase: phase.to_string(),
            state,
            timestamp: Utc::now(),
            reason: None,
            summary: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Durable store of "phase P reached state S" facts.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self, phase: &str, state: MarkerState) -> PathBuf {
        self.dir.join(format!("{}.{}", phase, state.as_str()))
    }

    /// Create or overwrite the marker. Writing the same marker twice is not an
    /// error; the most recent payload wins.
    pub fn write(
        &self,
        phase: &str,
        state: MarkerState,
        payload: Option<&MarkerRecord>,
    ) -> Result<(), StoreError> {
        validate_phase_id(phase)?;
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        let body = match payload {
            Some(record) => serde_json::to_vec_pretty(record).map_err(|source| {
                StoreError::Serialize {
                    what: "marker payload",
                    source,
                }
            })?,
            None => Vec::new(),
        };

        atomic_write(&self.marker_path(phase, state), &body)?;
        tracing::debug!(phase, state = %state, "marker written");
        Ok(())
    }

    pub fn exists(&self, phase: &str, state: MarkerState) -> bool {
        validate_phase_id(phase).is_ok() && self.marker_path(phase, state).is_file()
    }

    /// Raw payload of the marker, `None` when the marker is absent or unreadable.
    pub fn read_payload(&self, phase: &str, state: MarkerState) -> Option<String> {
        if validate_phase_id(phase).is_err() {
            return None;
        }
        fs::read_to_string(self.marker_path(phase, state)).ok()
    }

    /// Typed payload of the marker. Markers written without a payload yield `None`.
    pub fn read(&self, phase: &str, state: MarkerState) -> Option<MarkerRecord> {
        let payload = self.read_payload(phase, state)?;
        serde_json::from_str(&payload).ok()
    }

    /// The terminal state currently recorded for `phase`, if any.
    pub fn terminal_state(&self, phase: &str) -> Option<MarkerState> {
        [MarkerState::Completed, MarkerState::Failed]
            .into_iter()
            .find(|state| self.exists(phase, *state))
    }

    /// Move an existing marker out of the presence set.
    ///
    /// Returns `Ok(false)` when there was nothing to retire.
    pub fn retire(&self, phase: &str, state: MarkerState) -> Result<bool, StoreError> {
        validate_phase_id(phase)?;
        let path = self.marker_path(phase, state);
        if !path.is_file() {
            return Ok(false);
        }
        let retired = self.dir.join(format!(
            "{}.{}.retired-{}",
            phase,
            state.as_str(),
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
        ));
        fs::rename(&path, &retired).map_err(|e| StoreError::io(&path, e))?;
        tracing::debug!(phase, state = %state, "marker retired");
        Ok(true)
    }
}
