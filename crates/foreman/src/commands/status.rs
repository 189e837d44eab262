use crate::cli::ExitCode;
use crate::config::ForemanConfig;
use crate::errors::ActionableError;
use crate::reporter;
use crate::storage::TaskStore;
use crate::supervisor::Paths;

/// `--status` / `--report`: render `status.md`, print it to stdout, exit.
pub fn run_report(store: &TaskStore, paths: &Paths, config: &ForemanConfig) -> Result<ExitCode, ActionableError> {
    let file = store.read()?;
    let body = reporter::render(&file, &paths.runs_dir, config.status_report_recent_runs);
    reporter::write_status(&paths.root, &file, &paths.runs_dir, config.status_report_recent_runs)?;
    println!("{body}");
    Ok(ExitCode::Ok)
}
