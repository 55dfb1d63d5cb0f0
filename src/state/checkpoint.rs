//! Named, immutable snapshots of the state document.

use super::store::{StateStore, read_json};
use super::{CURRENT_PHASE_KEY, StateDocument};
use crate::errors::StoreError;
use crate::util::{atomic_write, slugify, sync_dir, validate_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub type CheckpointId = String;

/// Hidden, so it can never clash with a checkpoint id.
const LATEST_POINTER: &str = ".latest";
/// Keyword the CLI resolves to the newest checkpoint.
const LATEST_KEYWORD: &str = "latest";
const STATE_FILE: &str = "state.json";
const META_FILE: &str = "meta.json";

/// Metadata record stored alongside every checkpoint snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: CheckpointId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created: DateTime<Utc>,
    /// Phase the orchestrator was on when the checkpoint was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub target: String,
    /// Revision of the state document captured by this checkpoint.
    #[serde(default)]
    pub revision: u64,
}

impl StateStore {
    /// Snapshot the live document by value and point `.latest` at it.
    ///
    /// `name` defaults to the creation timestamp. If another checkpoint already
    /// uses the derived id, a numeric suffix is appended; existing checkpoints
    /// are never overwritten.
    pub fn checkpoint(
        &self,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<CheckpointId, StoreError> {
        let created = Utc::now();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| created.format("%Y%m%dT%H%M%S%.3fZ").to_string());

        let meta = self.with_lock(|| {
            let doc = self
                .try_read_document()?
                .unwrap_or_else(|| StateDocument::new(&self.target));

            fs::create_dir_all(&self.checkpoints_dir)
                .map_err(|e| StoreError::io(&self.checkpoints_dir, e))?;

            let id = self.unused_id(&slugify(&name));
            let meta = CheckpointMeta {
                id: id.clone(),
                name: name.clone(),
                description: description.unwrap_or_default().to_string(),
                created,
                phase: doc.get(CURRENT_PHASE_KEY).map(str::to_string),
                target: self.target.clone(),
                revision: doc.revision,
            };

            // Stage the snapshot in a hidden directory and rename it into
            // place so a listed checkpoint is always complete.
            let staging = self
                .checkpoints_dir
                .join(format!(".staging-{}", uuid::Uuid::new_v4().simple()));
            let stage = || -> Result<(), StoreError> {
                fs::create_dir_all(&staging).map_err(|e| StoreError::io(&staging, e))?;
                write_json(&staging.join(STATE_FILE), &doc, "checkpoint state")?;
                write_json(&staging.join(META_FILE), &meta, "checkpoint metadata")?;
                let final_dir = self.checkpoints_dir.join(&id);
                fs::rename(&staging, &final_dir).map_err(|e| StoreError::io(&final_dir, e))?;
                sync_dir(&self.checkpoints_dir);
                Ok(())
            };
            if let Err(e) = stage() {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }

            atomic_write(
                &self.checkpoints_dir.join(LATEST_POINTER),
                id.as_bytes(),
            )?;
            Ok(meta)
        })?;

        tracing::info!(
            checkpoint = %meta.id,
            phase = meta.phase.as_deref().unwrap_or("-"),
            revision = meta.revision,
            "checkpoint created"
        );
        Ok(meta.id)
    }

    /// Replace the live document with the snapshot stored in checkpoint `id`.
    /// The checkpoint itself is left untouched.
    pub fn restore(&self, id: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        let snapshot_file = self.checkpoints_dir.join(id).join(STATE_FILE);

        self.with_lock(|| {
            let snapshot: StateDocument = read_json(&snapshot_file)?
                .ok_or_else(|| StoreError::CheckpointNotFound { id: id.to_string() })?;
            let current_revision = match self.try_read_document() {
                Ok(doc) => doc.map(|d| d.revision).unwrap_or(0),
                Err(_) => 0,
            };

            let mut restored = snapshot;
            restored.revision = current_revision.max(restored.revision) + 1;
            self.write_document(&restored)
        })?;

        tracing::info!(checkpoint = id, "state restored from checkpoint");
        Ok(())
    }

    /// Restore whatever `.latest` points at.
    pub fn restore_latest(&self) -> Result<CheckpointId, StoreError> {
        let id = self
            .latest_checkpoint()
            .ok_or_else(|| StoreError::CheckpointNotFound {
                id: LATEST_KEYWORD.to_string(),
            })?;
        self.restore(&id)?;
        Ok(id)
    }

    /// Id of the most recently created checkpoint.
    pub fn latest_checkpoint(&self) -> Option<CheckpointId> {
        let id = fs::read_to_string(self.checkpoints_dir.join(LATEST_POINTER)).ok()?;
        let id = id.trim().to_string();
        validate_id(&id).ok().map(|_| id)
    }

    /// All complete checkpoints, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>, StoreError> {
        let entries = match fs::read_dir(&self.checkpoints_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.checkpoints_dir, e)),
        };

        let mut metas: Vec<CheckpointMeta> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|e| match read_json::<CheckpointMeta>(&e.path().join(META_FILE)) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!(path = %e.path().display(), error = %err, "skipping unreadable checkpoint");
                    None
                }
            })
            .collect();

        metas.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(metas)
    }

    /// Snapshot stored in checkpoint `id`.
    pub fn checkpoint_document(&self, id: &str) -> Result<StateDocument, StoreError> {
        validate_id(id)?;
        read_json(&self.checkpoints_dir.join(id).join(STATE_FILE))?
            .ok_or_else(|| StoreError::CheckpointNotFound { id: id.to_string() })
    }

    fn unused_id(&self, base: &str) -> CheckpointId {
        let mut candidate = base.to_string();
        let mut n = 2;
        while candidate.eq_ignore_ascii_case(LATEST_KEYWORD)
            || self.checkpoints_dir.join(&candidate).exists()
        {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        candidate
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.checkpoints_dir.clone()
    }
}

fn write_json<T: Serialize>(
    path: &std::path::Path,
    value: &T,
    what: &'static str,
) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|source| StoreError::Serialize { what, source })?;
    fs::write(path, body).map_err(|e| StoreError::io(path, e))
}
