//! Run state: a versioned key/value document plus named checkpoints.
//!
//! Layout under the state directory:
//!
//! ```text
//! state/
//!   current.json              live document
//!   .lock                     advisory lock for read-modify-write
//!   checkpoints/
//!     .latest                 id of the newest checkpoint
//!     <id>/state.json         copy of the document at creation time
//!     <id>/meta.json          CheckpointMeta
//! ```

pub mod checkpoint;
pub mod store;

pub use checkpoint::{CheckpointId, CheckpointMeta};
pub use store::StateStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version written into every state document.
pub const SCHEMA_VERSION: u32 = 1;

/// Keys the orchestrator maintains in the state document.
pub const CURRENT_PHASE_KEY: &str = "current_phase";
pub const LAST_PHASE_KEY: &str = "last_phase";
pub const LAST_PHASE_STATUS_KEY: &str = "last_phase_status";
pub const LAST_COMPLETED_PHASE_KEY: &str = "last_completed_phase";
pub const RUN_STATUS_KEY: &str = "run_status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: String,
    pub last_updated: DateTime<Utc>,
}

impl StateEntry {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            last_updated: Utc::now(),
        }
    }
}

/// The whole state document as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    /// Incremented on every write; lets readers tell two snapshots apart.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub entries: BTreeMap<String, StateEntry>,
}

impl StateDocument {
    pub fn new(target: &str) -> Self {
        Self {
            version: SCHEMA_VERSION,
            revision: 0,
            target: target.to_string(),
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_string(), StateEntry::new(value));
    }

    /// Plain key/value view without timestamps.
    pub fn values(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}
