use std::path::Path;

use crate::cli::ExitCode;
use crate::config::ForemanConfig;
use crate::errors::ActionableError;
use crate::intake as intake_pipeline;
use crate::progress_log::ProgressLog;
use crate::storage::TaskStore;
use crate::supervisor::{self, Paths};

/// `--intake <file>`: process a single document immediately.
pub fn run_intake(
    store: &TaskStore,
    paths: &Paths,
    config: &ForemanConfig,
    document: &Path,
) -> Result<ExitCode, ActionableError> {
    let processed_dir = paths.root.join("inbox").join("processed");
    let log = ProgressLog::new(&paths.root);
    let report = intake_pipeline::process_document(store, &processed_dir, document, config.intake_gate_command.as_deref())?;
    for task_id in &report.task_ids {
        log.append_event(&crate::progress_log::event("intake", task_id, "seeded from intake document"))?;
    }
    println!("seeded {} task(s): {:?}", report.task_ids.len(), report.task_ids);
    Ok(ExitCode::Ok)
}

/// `--watch-inbox <dir>`: process every document currently in `dir` once.
/// With `--loop` this is called again each iteration rather than looping
/// here, so a single `--watch-inbox` without `--loop` is just one sweep.
pub fn run_watch_inbox(
    store: &TaskStore,
    _paths: &Paths,
    config: &ForemanConfig,
    watch_dir: &Path,
    _looping: bool,
) -> Result<ExitCode, ActionableError> {
    let processed = supervisor::watch_inbox_once(store, watch_dir, config)?;
    println!("seeded {} task(s) from inbox: {:?}", processed.len(), processed);
    Ok(ExitCode::Ok)
}
