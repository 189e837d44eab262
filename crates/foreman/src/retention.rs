//! The Retention Manager: rotate archived worker outputs by age and total
//! size, never touching the archive of a task still `in_progress`.
//!
//! One responsibility per sweep: best-effort, never fatal to the caller.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::domain::{Status, TaskFile};
use crate::errors::{ActionableError, ErrorKind};

#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    pub deleted: Vec<String>,
    pub bytes_reclaimed: u64,
    pub skipped_in_progress: Vec<String>,
}

/// Deletes archive files under `runs_dir` older than `retention_days`,
/// then deletes oldest-first while the total archive size exceeds
/// `max_runs_mb`. A run id belonging to a task currently `in_progress` is
/// never deleted regardless of age or size pressure.
pub fn run(runs_dir: &Path, file: &TaskFile, retention_days: u32, max_runs_mb: u64) -> Result<RetentionReport, ActionableError> {
    let mut report = RetentionReport::default();
    if !runs_dir.exists() {
        return Ok(report);
    }

    let protected: Vec<(String, String)> = file
        .tasks
        .iter()
        .filter(|t| t.status == Status::InProgress)
        .filter_map(|t| t.claim.as_ref().map(|c| (c.run_id.clone(), t.id.clone())))
        .collect();

    let mut entries: Vec<(std::path::PathBuf, SystemTime, u64)> = fs::read_dir(runs_dir)
        .map_err(|e| ActionableError::new(format!("could not read {}: {e}", runs_dir.display())))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().ok()?;
            Some((entry.path(), modified, metadata.len()))
        })
        .collect();

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention_days as u64 * 86_400))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    entries.retain(|(path, modified, size)| {
        if let Some(task_id) = protected_task_id(path, &protected) {
            tracing::warn!("{}", ErrorKind::RetentionPolicyViolation { task_id });
            report.skipped_in_progress.push(path.display().to_string());
            return true;
        }
        if *modified < cutoff {
            if fs::remove_file(path).is_ok() {
                report.deleted.push(path.display().to_string());
                report.bytes_reclaimed += size;
            }
            return false;
        }
        true
    });

    entries.sort_by_key(|(_, modified, _)| *modified);
    let max_bytes = max_runs_mb * 1024 * 1024;
    let mut total: u64 = entries.iter().map(|(_, _, size)| size).sum();

    let mut i = 0;
    while total > max_bytes && i < entries.len() {
        let (path, _, size) = &entries[i];
        if let Some(task_id) = protected_task_id(path, &protected) {
            tracing::warn!("{}", ErrorKind::RetentionPolicyViolation { task_id });
            i += 1;
            continue;
        }
        if fs::remove_file(path).is_ok() {
            report.deleted.push(path.display().to_string());
            report.bytes_reclaimed += size;
            total -= size;
        }
        i += 1;
    }

    Ok(report)
}

/// Returns the task id an archive is protected on behalf of, if any.
fn protected_task_id(path: &Path, protected: &[(String, String)]) -> Option<String> {
    let stem = path.file_stem().and_then(|s| s.to_str())?;
    protected
        .iter()
        .find(|(run_id, _)| stem.starts_with(run_id.as_str()))
        .map(|(_, task_id)| task_id.clone())
}
