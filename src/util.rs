//! Shared filesystem helpers for the reconductor crate.

use crate::errors::StoreError;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Write `content` to `path` via a sibling temp file and a rename, so readers
/// observe either the previous document or the new one, never a torn write.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::io(path, std::io::Error::other("path has no parent directory"))
    })?;
    let tmp_path = parent.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document"),
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));

    let write_tmp = || -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()
    };

    if let Err(e) = write_tmp() {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(&tmp_path, e));
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(path, e));
    }

    sync_dir(parent);
    Ok(())
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) {}

/// Entries of the run directory that belong to reconductor itself. A phase
/// with one of these ids would write its output into them.
pub const RESERVED_RUN_ENTRIES: &[&str] = &["markers", "state", "logs", "runs"];

/// Validate a phase id: `[A-Za-z0-9_-]+` and not a reserved run directory
/// entry. Marker file names are `<phase>.<state>`, so a phase id never
/// contains `.`.
pub fn validate_phase_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if !valid {
        return Err(StoreError::InvalidPhaseId(id.to_string()));
    }
    if RESERVED_RUN_ENTRIES.contains(&id) {
        return Err(StoreError::ReservedPhaseId(id.to_string()));
    }
    Ok(())
}

/// Validate an identifier that becomes part of a file name (checkpoint
/// ids). Rejects path separators and anything outside `[A-Za-z0-9._-]`, as
/// well as `.`/`..`.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// Turn an arbitrary label (a checkpoint name, a scan target) into a
/// file-name-safe identifier.
pub fn slugify(label: &str) -> String {
    let slug: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_start_matches('.').to_string();
    if slug.is_empty() {
        "_".to_string()
    } else {
        slug
    }
}
