//! The Reporter: renders `status.md`, a human-readable status board,
//! independent of the scheduling loop and safe to run concurrently with it.
//!
//! Reuses the atomic store's temp-file-plus-rename write primitive so a
//! concurrently running `--status`/`--report` invocation never observes a
//! half-written document.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::domain::{Status, TaskFile};
use crate::errors::ActionableError;

pub fn render(file: &TaskFile, runs_dir: &Path, recent_runs: usize) -> String {
    let mut counts: HashMap<Status, usize> = HashMap::new();
    for task in &file.tasks {
        *counts.entry(task.status).or_insert(0) += 1;
    }

    let mut out = String::new();
    out.push_str("# Status\n\n");
    out.push_str(&format!("Generated: {}\n\n", crate::clock::now_utc().to_rfc3339()));

    out.push_str("## Counts\n\n");
    for status in [
        Status::Pending,
        Status::InProgress,
        Status::Completed,
        Status::Failed,
        Status::Blocked,
        Status::Abandoned,
        Status::Canceled,
    ] {
        out.push_str(&format!("- {status}: {}\n", counts.get(&status).copied().unwrap_or(0)));
    }

    out.push_str("\n## Blocked tasks\n\n");
    let blocked: Vec<_> = file.tasks.iter().filter(|t| t.status == Status::Blocked).collect();
    if blocked.is_empty() {
        out.push_str("(none)\n");
    } else {
        for task in blocked {
            let reason = task
                .history
                .last()
                .and_then(|h| h.error.clone())
                .unwrap_or_else(|| "unknown".to_string());
            out.push_str(&format!("- {}: {}\n", task.id, reason));
        }
    }

    out.push_str("\n## Recent runs\n\n");
    let mut runs = list_run_archives(runs_dir);
    runs.sort_by(|a, b| b.1.cmp(&a.1));
    if runs.is_empty() {
        out.push_str("(none)\n");
    } else {
        for (name, _modified, size) in runs.into_iter().take(recent_runs) {
            out.push_str(&format!("- {name} ({size} bytes)\n"));
        }
    }

    let (disk_usage, count) = archive_disk_usage(runs_dir);
    out.push_str(&format!("\n## Archive usage\n\n{count} files, {disk_usage} bytes\n"));

    out
}

fn list_run_archives(runs_dir: &Path) -> Vec<(String, std::time::SystemTime, u64)> {
    let Ok(entries) = fs::read_dir(runs_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((e.file_name().to_string_lossy().into_owned(), meta.modified().ok()?, meta.len()))
        })
        .collect()
}

fn archive_disk_usage(runs_dir: &Path) -> (u64, usize) {
    let entries = list_run_archives(runs_dir);
    let total: u64 = entries.iter().map(|(_, _, size)| size).sum();
    (total, entries.len())
}

/// Writes the rendered status board to `status.md` via temp-file + rename.
pub fn write_status(root: &Path, file: &TaskFile, runs_dir: &Path, recent_runs: usize) -> Result<(), ActionableError> {
    let body = render(file, runs_dir, recent_runs);
    let target = root.join("status.md");
    let tmp = root.join("status.md.tmp");
    {
        let mut handle = File::create(&tmp)
            .map_err(|e| ActionableError::new(format!("could not create {}: {e}", tmp.display())))?;
        handle
            .write_all(body.as_bytes())
            .map_err(|e| ActionableError::new(format!("could not write {}: {e}", tmp.display())))?;
        handle
            .sync_all()
            .map_err(|e| ActionableError::new(format!("could not fsync {}: {e}", tmp.display())))?;
    }
    fs::rename(&tmp, &target)
        .map_err(|e| ActionableError::new(format!("could not rename {} to {}: {e}", tmp.display(), target.display())))
}
