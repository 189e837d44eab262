use crate::cli::ExitCode;
use crate::errors::ActionableError;
use crate::retention;
use crate::storage::TaskStore;
use crate::supervisor::Paths;

/// `--cleanup`: run the retention sweep once, report what it reclaimed.
pub fn run_cleanup(store: &TaskStore, paths: &Paths) -> Result<ExitCode, ActionableError> {
    let file = store.read()?;
    let report = retention::run(&paths.runs_dir, &file, file.config.retention_days, file.config.max_runs_mb)?;
    println!(
        "reclaimed {} bytes across {} archives ({} protected, in progress)",
        report.bytes_reclaimed,
        report.deleted.len(),
        report.skipped_in_progress.len()
    );
    Ok(ExitCode::Ok)
}
