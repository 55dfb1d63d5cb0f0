use super::{StateDocument, StateEntry};
use crate::errors::StoreError;
use crate::util::atomic_write;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistent key/value store for one run.
///
/// Every mutation is a read-all, mutate, write-all cycle performed while
/// holding both an in-process mutex and an exclusive advisory lock on
/// `state/.lock`, so concurrent writers (the orchestrator between phases, a
/// phase body recording progress, a second CLI invocation) never interleave.
pub struct StateStore {
    pub(super) dir: PathBuf,
    pub(super) current_file: PathBuf,
    pub(super) checkpoints_dir: PathBuf,
    lock_file: PathBuf,
    pub(super) target: String,
    guard: Mutex<()>,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>, target: &str) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            current_file: dir.join("current.json"),
            checkpoints_dir: dir.join("checkpoints"),
            lock_file: dir.join(".lock"),
            target: target.to_string(),
            dir,
            guard: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Upsert `key`, refreshing its `last_updated` timestamp.
    pub fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|doc| {
            doc.set(key, value);
            Ok(())
        })
    }

    /// Value for `key`, or `default` when the key is absent or the document
    /// cannot be read.
    pub fn load(&self, key: &str, default: &str) -> String {
        self.read_document()
            .get(key)
            .map(str::to_string)
            .unwrap_or_else(|| default.to_string())
    }

    /// Full entry for `key` including its timestamp.
    pub fn entry(&self, key: &str) -> Option<StateEntry> {
        self.read_document().entries.get(key).cloned()
    }

    /// Plain key/value view of the live document.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.read_document().values()
    }

    /// Current document, falling back to an empty one (with a warning) when
    /// the backing file is missing or unreadable.
    pub fn read_document(&self) -> StateDocument {
        match self.try_read_document() {
            Ok(Some(doc)) => doc,
            Ok(None) => StateDocument::new(&self.target),
            Err(e) => {
                tracing::warn!(error = %e, "state document unreadable, using defaults");
                StateDocument::new(&self.target)
            }
        }
    }

    /// Strict read: `Ok(None)` when no document exists yet.
    pub fn try_read_document(&self) -> Result<Option<StateDocument>, StoreError> {
        read_json::<StateDocument>(&self.current_file)
    }

    /// Run `f` against the live document under the store lock and persist the
    /// result atomically. A corrupt document is preserved next to the live
    /// file and replaced by an empty one before `f` runs. If it cannot be
    /// moved aside the update fails and the corrupt file is left in place.
    pub(crate) fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StateDocument) -> Result<(), StoreError>,
    {
        self.with_lock(|| {
            let mut doc = match self.try_read_document() {
                Ok(Some(doc)) => doc,
                Ok(None) => StateDocument::new(&self.target),
                Err(StoreError::Corrupt { path, source }) => {
                    let aside = corrupt_aside_path(&path, Utc::now());
                    if let Err(e) = fs::rename(&path, &aside) {
                        tracing::warn!(
                            error = %e,
                            preserved = %aside.display(),
                            "cannot move corrupt state document aside, keeping it"
                        );
                        return Err(StoreError::io(&aside, e));
                    }
                    tracing::warn!(
                        error = %source,
                        preserved = %aside.display(),
                        "corrupt state document replaced"
                    );
                    StateDocument::new(&self.target)
                }
                Err(e) => return Err(e),
            };
            f(&mut doc)?;
            doc.revision += 1;
            self.write_document(&doc)
        })
    }

    pub(super) fn write_document(&self, doc: &StateDocument) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Serialize {
            what: "state document",
            source,
        })?;
        atomic_write(&self.current_file, &body)
    }

    /// Serialize `f` against every other mutation of this run's state.
    pub(super) fn with_lock<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Result<T, StoreError>,
    {
        let _guard = self.guard.lock().map_err(|_| StoreError::LockPoisoned)?;
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)
            .map_err(|e| StoreError::io(&self.lock_file, e))?;
        lock.lock_exclusive()
            .map_err(|e| StoreError::io(&self.lock_file, e))?;
        let result = f();
        let _ = FileExt::unlock(&lock);
        result
    }
}

/// Read and parse a JSON file; `Ok(None)` when it does not exist.
pub(super) fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn corrupt_aside_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    path.with_extension(format!("json.corrupt-{}", at.format("%Y%m%dT%H%M%S")))
}
