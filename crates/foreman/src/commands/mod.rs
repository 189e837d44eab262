//! Per-flag command implementations, dispatched from `main.rs` after
//! `Cli` has been parsed and `ForemanConfig` loaded.

mod intake;
mod maintenance;
mod status;
mod turn;

use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{Cli, ExitCode};
use crate::config::ForemanConfig;
use crate::errors::ActionableError;
use crate::storage::TaskStore;
use crate::supervisor::Paths;

/// Resolves the project root: `--root`, else `PROJECT_ROOT`, else the
/// current directory.
pub fn resolve_root(cli: &Cli) -> PathBuf {
    cli.root
        .clone()
        .or_else(|| std::env::var_os("PROJECT_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Applies `--timeout`/`--lease-ttl`/`--max-turns` CLI overrides on top of
/// the loaded `foreman.toml`: flags beat the file, the file beats the
/// built-in default.
fn apply_cli_overrides(config: &mut ForemanConfig, cli: &Cli) {
    if let Some(timeout) = cli.timeout {
        config.worker_timeout_seconds = timeout;
    }
    if let Some(lease_ttl) = cli.lease_ttl {
        config.lease_ttl_override = Some(lease_ttl);
    }
}

pub fn run(cli: Cli) -> ExitCode {
    let root = resolve_root(&cli);
    let mut config = match ForemanConfig::load(&root) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err.to_error_message());
            return ExitCode::RuntimeError;
        }
    };
    apply_cli_overrides(&mut config, &cli);

    let store = TaskStore::new(&root);
    if let Err(err) = store.open() {
        eprintln!("{}", err.to_error_message());
        return ExitCode::RuntimeError;
    }
    let paths = Paths::new(&root);

    match store.read() {
        Ok(file) => {
            let effective_ttl = config.lease_ttl_override.unwrap_or(file.config.lease_ttl_seconds);
            if crate::lease::lease_too_tight(effective_ttl, config.worker_timeout_seconds) {
                tracing::warn!(
                    lease_ttl_seconds = effective_ttl,
                    worker_timeout_seconds = config.worker_timeout_seconds,
                    "lease_ttl_seconds is shorter than worker_timeout_seconds; leases may expire mid-run"
                );
            }
        }
        Err(err) => {
            eprintln!("{}", err.to_error_message());
            return ExitCode::RuntimeError;
        }
    }

    let result = dispatch(&cli, &store, &paths, &config, &root);
    match result {
        Ok(exit_code) => exit_code,
        Err(err) => {
            eprintln!("{}", err.to_error_message());
            ExitCode::RuntimeError
        }
    }
}

fn dispatch(
    cli: &Cli,
    store: &TaskStore,
    paths: &Paths,
    config: &ForemanConfig,
    root: &std::path::Path,
) -> Result<ExitCode, ActionableError> {
    if cli.status || cli.report {
        return status::run_report(store, paths, config);
    }
    if cli.cleanup {
        return maintenance::run_cleanup(store, paths);
    }
    if cli.reclaim {
        return turn::run_reclaim(store, paths);
    }
    if let Some(document) = &cli.intake {
        return intake::run_intake(store, paths, config, document);
    }
    if let Some(watch_dir) = &cli.watch_inbox {
        if !cli.r#loop {
            return intake::run_watch_inbox(store, paths, config, watch_dir, cli.r#loop);
        }
    }
    if cli.dry_run {
        return turn::run_dry_run(store, paths);
    }

    let max_turns = cli.max_turns.or(cli.count);
    if cli.r#loop {
        let poll_interval = Duration::from_secs(config.poll_interval_seconds);
        return turn::run_loop(store, paths, config, root, max_turns, poll_interval, cli.watch_inbox.clone());
    }

    let count = max_turns.unwrap_or(1);
    turn::run_turns(store, paths, config, root, count)
}
