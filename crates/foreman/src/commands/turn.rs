use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::cli::ExitCode;
use crate::config::ForemanConfig;
use crate::domain::{Status, TaskRecord};
use crate::errors::ActionableError;
use crate::lease;
use crate::progress_log::ProgressLog;
use crate::signals::{self, SentinelPaths};
use crate::storage::TaskStore;
use crate::supervisor::{self, LoopOptions, Paths, TurnOutcome};

/// `--dry-run`: report which task would be claimed next without mutating
/// Task.json or spawning a worker.
pub fn run_dry_run(store: &TaskStore, _paths: &Paths) -> Result<ExitCode, ActionableError> {
    let file = store.read()?;
    let by_id: HashMap<String, &TaskRecord> = file.tasks.iter().map(|t| (t.id.clone(), t)).collect();
    let candidate = file
        .tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.status == Status::Pending && t.deps_satisfied(&by_id))
        .min_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ia.cmp(ib)))
        .map(|(_, t)| &t.id);

    match candidate {
        Some(id) => println!("would claim: {id}"),
        None => println!("nothing eligible to claim"),
    }
    Ok(ExitCode::Ok)
}

/// `--reclaim`: sweep expired leases back to pending/blocked, then exit.
pub fn run_reclaim(store: &TaskStore, paths: &Paths) -> Result<ExitCode, ActionableError> {
    let log = ProgressLog::new(&paths.root);
    let report = lease::reclaim_sweep(store)?;
    for task_id in &report.abandoned {
        log.append_event(&crate::progress_log::event("lease_reclaimed", task_id, "lease expired, swept back"))?;
    }
    println!("reclaimed {} lease(s): {:?}", report.abandoned.len(), report.abandoned);
    let any_blocked = report
        .side_effects
        .iter()
        .any(|(_, effect)| matches!(effect, crate::state_machine::SideEffect::Alert { .. }));
    if any_blocked {
        Ok(ExitCode::BlockedTaskEncountered)
    } else {
        Ok(ExitCode::Ok)
    }
}

/// Default mode (no flags) and `--count N` (without `--loop`): run exactly
/// `count` turns back to back, stopping early on a STOP condition.
pub fn run_turns(
    store: &TaskStore,
    paths: &Paths,
    config: &ForemanConfig,
    root: &Path,
    count: u32,
) -> Result<ExitCode, ActionableError> {
    signals::install();
    let sentinels = SentinelPaths::new(root);
    let log = ProgressLog::new(root);

    let mut any_blocked = false;
    let mut streak = supervisor::FailureStreak::new();
    for _ in 0..count.max(1) {
        match supervisor::run_one_turn(store, paths, config, &sentinels, &log, &mut streak)? {
            TurnOutcome::Stopped => break,
            TurnOutcome::Ran { task_id, final_status } => {
                println!("{task_id}: {final_status}");
                if final_status == Status::Blocked {
                    any_blocked = true;
                }
            }
            TurnOutcome::Idle => {
                println!("nothing eligible to claim");
                break;
            }
        }
    }

    Ok(if any_blocked { ExitCode::BlockedTaskEncountered } else { ExitCode::Ok })
}

/// `--loop` (optionally bounded by `--count`/`--max-turns`): run turns
/// continuously, polling between idle turns, until a STOP condition or the
/// turn cap is reached.
pub fn run_loop(
    store: &TaskStore,
    paths: &Paths,
    config: &ForemanConfig,
    root: &Path,
    max_turns: Option<u32>,
    poll_interval: Duration,
    watch_inbox_dir: Option<std::path::PathBuf>,
) -> Result<ExitCode, ActionableError> {
    signals::install();
    let sentinels = SentinelPaths::new(root);
    let log = ProgressLog::new(root);
    let options = LoopOptions {
        max_turns,
        poll_interval,
        watch_inbox_dir,
    };
    let report = supervisor::run_loop(store, paths, config, &sentinels, &log, &options)?;
    println!("ran {} turn(s)", report.turns);
    Ok(if report.any_blocked { ExitCode::BlockedTaskEncountered } else { ExitCode::Ok })
}
