//! The Supervisor: the control loop tying every other module together.
//!
//! One turn per call: reclaim, select, dispatch, await, record, with
//! sentinel-file and signal checks at the top of each turn. Single
//! process, single worker in flight at a time — no parallel dispatch.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::clock::now_utc;
use crate::config::ForemanConfig;
use crate::domain::{Status, TaskRecord, WorkerResult};
use crate::errors::ActionableError;
use crate::lease::{self, ClaimedTask};
use crate::progress_log::{self, HumanHelpPacket, ProgressLog};
use crate::signals::{self, Check, SentinelPaths};
use crate::state_machine::{self, Event, SideEffect};
use crate::storage::TaskStore;
use crate::worker::{self, WorkerConfig};
use crate::{reporter, retention, verify};

/// Paths the supervisor needs beyond the task store itself.
pub struct Paths {
    pub root: PathBuf,
    pub runs_dir: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runs_dir = root.join("runs");
        Self { root, runs_dir }
    }
}

/// What happened during one iteration of the control loop, for the CLI to
/// report and for `--count N` to decide whether to keep looping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// A task was claimed and driven to completion (whatever the outcome).
    Ran { task_id: String, final_status: Status },
    /// Nothing eligible to claim right now.
    Idle,
    /// The loop was asked to stop (STOP sentinel, signal, or exhausted turns).
    Stopped,
}

/// Tracks consecutive non-`completed` turns within one supervisor
/// invocation so `max_failures` can raise an `ALERT.txt` per spec.md
/// §4.H, independent of any single task's own `blocked` alert. Purely
/// in-memory and discardable, like all other supervisor-level state.
#[derive(Debug, Default)]
pub struct FailureStreak(u32);

impl FailureStreak {
    pub fn new() -> Self {
        Self(0)
    }

    fn record(&mut self, final_status: Status) -> u32 {
        if final_status == Status::Completed {
            self.0 = 0;
        } else {
            self.0 += 1;
        }
        self.0
    }
}

/// Runs reclaim, then claims and drives at most one task to a terminal
/// (or lease-active) outcome. This is the unit `--count N` repeats.
pub fn run_one_turn(
    store: &TaskStore,
    paths: &Paths,
    config: &ForemanConfig,
    sentinels: &SentinelPaths,
    log: &ProgressLog,
    streak: &mut FailureStreak,
) -> Result<TurnOutcome, ActionableError> {
    if signals::check(sentinels) == Check::Stop {
        return Ok(TurnOutcome::Stopped);
    }

    let reclaimed = lease::reclaim_sweep(store)?;
    for (task_id, effect) in &reclaimed.side_effects {
        record_side_effect(log, task_id, "n/a", effect)?;
    }
    for task_id in &reclaimed.abandoned {
        log.append_event(&progress_log::event("lease_reclaimed", task_id, "lease expired, swept back"))?;
    }

    if signals::check(sentinels) == Check::Stop {
        return Ok(TurnOutcome::Stopped);
    }

    let Some(claimed) = lease::claim_next(store, config.lease_ttl_override)? else {
        tracing::debug!("no eligible task to claim");
        return Ok(TurnOutcome::Idle);
    };

    log.append_event(&progress_log::event(
        "claim",
        &claimed.task_id,
        &format!("claimed as {} (attempt {})", claimed.run_id, claimed.attempt),
    ))?;

    let final_status = drive_claimed_task(store, paths, config, &claimed, log)?;

    let max_failures = store.read()?.config.max_failures;
    let consecutive = streak.record(final_status);
    if max_failures > 0 && consecutive >= max_failures {
        tracing::warn!(
            consecutive,
            max_failures,
            "consecutive non-completed turns reached max_failures, raising alert"
        );
        signals::raise_alert(
            sentinels,
            &format!("{consecutive} consecutive non-completed turns (max_failures={max_failures})"),
            "inspect the progress log for the recent failure pattern before resuming",
        )?;
    }

    Ok(TurnOutcome::Ran {
        task_id: claimed.task_id,
        final_status,
    })
}

/// Runs the worker, gates the result through the verification command (if
/// the task requires it), and applies the resulting event to the task.
fn drive_claimed_task(
    store: &TaskStore,
    paths: &Paths,
    config: &ForemanConfig,
    claimed: &ClaimedTask,
    log: &ProgressLog,
) -> Result<Status, ActionableError> {
    let started = Instant::now();

    let prompt_template = config.prompt_template.as_ref().map(PathBuf::from);
    let worker_config = WorkerConfig {
        command: config.worker_command.clone(),
        timeout: Duration::from_secs(config.worker_timeout_seconds),
        capture_limit_bytes: config.capture_limit_bytes,
        prompt_template,
    };

    let outcome = worker::run_worker(&paths.root, &paths.runs_dir, &claimed.task_id, &claimed.run_id, &worker_config)?;
    let duration_ms = started.elapsed().as_millis() as u64;

    let verify_required = store.read()?.config.verify_required;

    let event = match outcome.result {
        WorkerResult::Completed { run_id, verify, git, summary, .. } => {
            if verify_required && verify.is_none() {
                let gate = verify::run_gate(&paths.root, &paths.runs_dir, &run_id, &config.verify_command)?;
                if gate.passed {
                    Event::WorkerSuccess {
                        run_id,
                        verify: Some(gate.evidence),
                        git,
                        summary,
                    }
                } else {
                    Event::WorkerSuccessBadVerify {
                        run_id,
                        verify: gate.evidence,
                    }
                }
            } else {
                Event::WorkerSuccess { run_id, verify, git, summary }
            }
        }
        WorkerResult::Failed { run_id, error, .. } => Event::WorkerFailure { run_id, error },
        WorkerResult::Blocked { run_id, error, .. } => Event::WorkerBlock { run_id, error },
    };

    let from_status = Status::InProgress;
    let (to_status, side_effects, task_id) = apply_event(store, &claimed.task_id, event)?;

    log.append_event(&progress_log::ProgressEvent {
        timestamp: now_utc(),
        event_kind: "worker_result".to_string(),
        task_id: task_id.clone(),
        run_id: Some(claimed.run_id.clone()),
        from_status: Some(from_status),
        to_status: Some(to_status),
        attempt: Some(claimed.attempt),
        verify_exit_code: None,
        commit: None,
        duration_ms: Some(duration_ms),
        reason: format!("worker finished (timed_out={})", outcome.timed_out),
    })?;

    for effect in side_effects {
        record_side_effect(log, &task_id, &claimed.run_id, &effect)?;
    }

    if to_status == Status::Blocked {
        tracing::warn!(task_id = %task_id, "task blocked, raising alert");
        signals::raise_alert(
            &SentinelPaths::new(&paths.root),
            &format!("task {task_id} is blocked"),
            "inspect the progress log and runs/ archive, then clear ALERT.txt once resolved",
        )?;
    }

    Ok(to_status)
}

/// Applies `event` to the named task inside one `TaskStore::mutate` and
/// returns its resulting status plus any side effects raised.
///
/// A worker-reported terminal event that lands the task in `Failed` is
/// immediately followed, in the same commit, by the `retry`/`exhaust`
/// transition the state table requires (mirroring `lease::reclaim_sweep`'s
/// abandoned-then-retry chaining) — otherwise a failed task would sit
/// unclaimable in `Failed` forever instead of becoming `pending` or
/// `blocked`.
fn apply_event(store: &TaskStore, task_id: &str, event: Event) -> Result<(Status, Vec<SideEffect>, String), ActionableError> {
    let task_id = task_id.to_string();
    store.mutate(move |mut file| {
        let now = now_utc();
        let config = file.config.clone();
        let by_id: std::collections::HashMap<String, &TaskRecord> =
            file.tasks.iter().map(|t| (t.id.clone(), t)).collect();
        let task = by_id.get(&task_id).ok_or_else(|| ActionableError::new(format!("unknown task {task_id}")))?;
        let transition = state_machine::apply(task, event, now, &config, &by_id)
            .map_err(|e| ActionableError::new(e.to_string()))?;
        let mut resolved = transition.task;
        let mut effects = transition.side_effects;

        if resolved.status == Status::Failed {
            let follow_up_event = if (resolved.history.len() as u32) < config.max_attempts {
                Event::Retry
            } else {
                Event::Exhaust
            };
            let follow_up = state_machine::apply(&resolved, follow_up_event, now, &config, &std::collections::HashMap::new())
                .map_err(|e| ActionableError::new(e.to_string()))?;
            resolved = follow_up.task;
            effects.extend(follow_up.side_effects);
        }

        let status = resolved.status;
        *file.find_mut(&task_id).unwrap() = resolved;
        Ok((file, (status, effects, task_id.clone())))
    })
}

fn record_side_effect(log: &ProgressLog, task_id: &str, _run_id: &str, effect: &SideEffect) -> Result<(), ActionableError> {
    match effect {
        SideEffect::Alert { reason } => log.append_event(&progress_log::event("alert", task_id, reason)),
        SideEffect::HumanHelpPacket {
            task_id,
            run_id,
            reason,
            suggested_actions,
        } => log.append_human_help_packet(&HumanHelpPacket {
            timestamp: now_utc(),
            task_id: task_id.clone(),
            run_id: run_id.clone(),
            reason: reason.clone(),
            suggested_actions: suggested_actions.clone(),
        }),
    }
}

/// Scans `inbox_dir` for `.md` documents and feeds each through intake, one
/// at a time, in directory order.
pub fn watch_inbox_once(
    store: &TaskStore,
    inbox_dir: &Path,
    config: &ForemanConfig,
) -> Result<Vec<String>, ActionableError> {
    let processed_dir = inbox_dir.join("processed");
    if !inbox_dir.exists() {
        return Ok(Vec::new());
    }
    let mut documents: Vec<PathBuf> = std::fs::read_dir(&inbox_dir)
        .map_err(|e| ActionableError::new(format!("could not read {}: {e}", inbox_dir.display())))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|ext| ext == "md").unwrap_or(false))
        .collect();
    documents.sort();

    let mut processed = Vec::new();
    for document in documents {
        let report = crate::intake::process_document(
            store,
            &processed_dir,
            &document,
            config.intake_gate_command.as_deref(),
        )?;
        processed.extend(report.task_ids);
    }
    Ok(processed)
}

/// Runs the retention sweep and writes `status.md`, the two maintenance
/// actions that are safe to run independently of the main claim/drive loop.
pub fn run_maintenance(store: &TaskStore, paths: &Paths, recent_runs: usize) -> Result<(), ActionableError> {
    let file = store.read()?;
    let _ = retention::run(&paths.runs_dir, &file, file.config.retention_days, file.config.max_runs_mb)?;
    reporter::write_status(&paths.root, &file, &paths.runs_dir, recent_runs)
}

pub fn write_report(store: &TaskStore, paths: &Paths, recent_runs: usize) -> Result<(), ActionableError> {
    let file = store.read()?;
    reporter::write_status(&paths.root, &file, &paths.runs_dir, recent_runs)
}

pub struct LoopOptions {
    pub max_turns: Option<u32>,
    pub poll_interval: Duration,
    pub watch_inbox_dir: Option<PathBuf>,
}

/// Outcome of `run_loop`: how many turns ran, and whether any of them
/// landed a task in `blocked` — the CLI maps the latter to exit code 3.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopReport {
    pub turns: u32,
    pub any_blocked: bool,
}

/// Runs turns until `STOP`/signal, `max_turns` is reached, or (without a
/// cap) forever — polling `poll_interval` between idle turns.
pub fn run_loop(
    store: &TaskStore,
    paths: &Paths,
    config: &ForemanConfig,
    sentinels: &SentinelPaths,
    log: &ProgressLog,
    options: &LoopOptions,
) -> Result<LoopReport, ActionableError> {
    let mut report = LoopReport::default();
    let mut streak = FailureStreak::new();
    loop {
        if let Some(max) = options.max_turns {
            if report.turns >= max {
                break;
            }
        }
        if let Some(inbox_dir) = &options.watch_inbox_dir {
            let seeded = watch_inbox_once(store, inbox_dir, config)?;
            for task_id in &seeded {
                log.append_event(&progress_log::event("intake", task_id, "seeded from inbox during loop"))?;
            }
        }
        match run_one_turn(store, paths, config, sentinels, log, &mut streak)? {
            TurnOutcome::Stopped => break,
            TurnOutcome::Ran { final_status, .. } => {
                report.turns += 1;
                if final_status == Status::Blocked {
                    report.any_blocked = true;
                }
            }
            TurnOutcome::Idle => {
                report.turns += 1;
                if signals::check(sentinels) == Check::Stop {
                    break;
                }
                std::thread::sleep(options.poll_interval);
            }
        }
    }
    Ok(report)
}
