//! Snapshot (de)serialization for the job store.
//!
//! The snapshot is a crash-recovery visibility aid, not a replay log: it is
//! written atomically (temp file + rename) and read leniently (malformed
//! entries are skipped, never fatal).

use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::core::Job;
use crate::errors::DubflowError;

#[derive(Serialize)]
struct SnapshotFile<'a> {
    jobs: &'a [Job],
}

/// Writes the job list to `path` atomically.
///
/// The data is first written to `<path>.tmp`, then renamed over the target
/// so a crash never leaves a half-written snapshot.
pub fn write_snapshot(path: &Path, jobs: &[Job]) -> Result<(), DubflowError> {
    let payload = serde_json::to_string_pretty(&SnapshotFile { jobs })?;

    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Loads jobs from a snapshot at `path`.
///
/// A missing file yields an empty list. Entries that fail to parse are
/// skipped with a warning so one corrupt record cannot hide the rest.
pub fn load_snapshot(path: &Path) -> Result<Vec<Job>, DubflowError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;

    let entries = value
        .get("jobs")
        .and_then(serde_json::Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut jobs = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<Job>(entry) {
            Ok(job) => jobs.push(job),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed job snapshot entry");
            }
        }
    }
    Ok(jobs)
}
