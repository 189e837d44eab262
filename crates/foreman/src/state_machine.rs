//! The pure state machine: `(task, event) -> (new task, side-effect intent)`.
//!
//! Never touches the filesystem or the clock directly — callers pass in
//! `now` so the whole module is exhaustively unit- and property-testable
//! without I/O, the same discipline the graph module follows.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::{Claim, Config, GitEvidence, HistoryEntry, Status, TaskRecord, TaskResult, VerifyEvidence};
use crate::errors::ErrorKind;

/// Every event the state machine can be asked to apply: one variant per
/// row of the transition table, plus the hard-rejection dimension carried
/// on every terminal worker-originated event.
#[derive(Debug, Clone)]
pub enum Event {
    Claim {
        claimed_by: String,
        run_id: String,
    },
    WorkerSuccess {
        run_id: String,
        verify: Option<VerifyEvidence>,
        git: Option<GitEvidence>,
        summary: Option<String>,
    },
    WorkerSuccessBadVerify {
        run_id: String,
        verify: VerifyEvidence,
    },
    WorkerFailure {
        run_id: String,
        error: Option<String>,
    },
    WorkerBlock {
        run_id: String,
        error: Option<String>,
    },
    LeaseExpired,
    Retry,
    Exhaust,
    HumanResume,
    HumanCancel,
}

/// Out-of-band consequences of a transition that the caller (the
/// supervisor loop) must carry out: writing `ALERT.txt`, appending a Human
/// Help Packet block to the progress log.
#[derive(Debug, Clone)]
pub enum SideEffect {
    Alert { reason: String },
    HumanHelpPacket {
        task_id: String,
        run_id: String,
        reason: String,
        suggested_actions: Vec<String>,
    },
}

/// The result of successfully applying an event: the task's new state (it
/// may be unchanged, as in a run-id mismatch) plus any side effects to act on.
#[derive(Debug, Clone)]
pub struct Transition {
    pub task: TaskRecord,
    pub side_effects: Vec<SideEffect>,
}

/// Applies `event` to `task`, returning the resulting `Transition` or
/// rejecting it as `ErrorKind::IllegalTransition` if the event does not
/// apply to the task's current status.
///
/// `by_id` is used only for the dependency-satisfied guard on `Claim`; it
/// is the caller's responsibility to pass a view that includes every task
/// the file currently holds.
pub fn apply(
    task: &TaskRecord,
    event: Event,
    now: DateTime<Utc>,
    config: &Config,
    by_id: &HashMap<String, &TaskRecord>,
) -> Result<Transition, ErrorKind> {
    match (task.status, event) {
        (Status::Pending, Event::Claim { claimed_by, run_id }) => {
            if !task.deps_satisfied(by_id) {
                return Err(illegal(task, "pending", "claim"));
            }
            if task.claim.is_some() {
                return Err(illegal(task, "pending", "claim"));
            }
            if task.history.len() as u32 >= config.max_attempts {
                return Err(illegal(task, "pending", "claim"));
            }
            let mut next = task.clone();
            next.status = Status::InProgress;
            next.claim = Some(Claim {
                claimed_by,
                run_id,
                claimed_at: now,
                lease_expires_at: now + chrono::Duration::seconds(config.lease_ttl_seconds as i64),
                attempt: task.next_attempt(),
            });
            Ok(Transition {
                task: next,
                side_effects: vec![],
            })
        }

        (Status::InProgress, Event::WorkerSuccess { run_id, verify, git, summary }) => {
            let claim = require_claim(task)?;
            if claim.run_id != run_id {
                return Ok(mismatch(task, &run_id));
            }
            // Defensive: never let a completed task through without a zero
            // verify exit code when one is required, regardless of which
            // event variant the caller used.
            let exit_ok = !config.verify_required
                || verify.as_ref().map(|v| v.exit_code) == Some(0);
            if !exit_ok {
                let verify = verify.unwrap_or(VerifyEvidence {
                    command: String::new(),
                    exit_code: -1,
                    evidence: String::new(),
                });
                return Ok(verify_failed(task, &run_id, verify, now));
            }
            let attempt = claim.attempt;
            let mut next = task.clone();
            next.status = Status::Completed;
            next.claim = None;
            next.result = Some(TaskResult { verify, git, summary });
            next.history.push(HistoryEntry {
                attempt,
                run_id,
                status: Status::Completed,
                error: None,
                ended_at: now,
            });
            Ok(Transition {
                task: next,
                side_effects: vec![],
            })
        }

        (Status::InProgress, Event::WorkerSuccessBadVerify { run_id, verify }) => {
            let claim = require_claim(task)?;
            if claim.run_id != run_id {
                return Ok(mismatch(task, &run_id));
            }
            Ok(verify_failed(task, &run_id, verify, now))
        }

        (Status::InProgress, Event::WorkerFailure { run_id, error }) => {
            let claim = require_claim(task)?;
            if claim.run_id != run_id {
                return Ok(mismatch(task, &run_id));
            }
            let attempt = claim.attempt;
            let mut next = task.clone();
            next.status = Status::Failed;
            next.claim = None;
            next.history.push(HistoryEntry {
                attempt,
                run_id,
                status: Status::Failed,
                error,
                ended_at: now,
            });
            Ok(Transition {
                task: next,
                side_effects: vec![],
            })
        }

        (Status::InProgress, Event::WorkerBlock { run_id, error }) => {
            let claim = require_claim(task)?;
            if claim.run_id != run_id {
                return Ok(mismatch(task, &run_id));
            }
            let attempt = claim.attempt;
            let reason = error.clone().unwrap_or_else(|| "worker reported blocked".to_string());
            let mut next = task.clone();
            next.status = Status::Blocked;
            next.claim = None;
            next.history.push(HistoryEntry {
                attempt,
                run_id: run_id.clone(),
                status: Status::Blocked,
                error,
                ended_at: now,
            });
            Ok(Transition {
                task: next,
                side_effects: vec![
                    SideEffect::Alert { reason: reason.clone() },
                    SideEffect::HumanHelpPacket {
                        task_id: task.id.clone(),
                        run_id,
                        reason,
                        suggested_actions: vec![
                            "inspect runs/<run_id>.json for the worker's full output".to_string(),
                            "resolve the blocker, then re-run with `--dry-run` to confirm eligibility".to_string(),
                        ],
                    },
                ],
            })
        }

        (Status::InProgress, Event::LeaseExpired) => {
            let claim = require_claim(task)?;
            let attempt = claim.attempt;
            let run_id = claim.run_id.clone();
            let mut next = task.clone();
            next.status = Status::Abandoned;
            next.claim = None;
            next.history.push(HistoryEntry {
                attempt,
                run_id,
                status: Status::Abandoned,
                error: Some("lease expired".to_string()),
                ended_at: now,
            });
            Ok(Transition {
                task: next,
                side_effects: vec![],
            })
        }

        (Status::Failed, Event::Retry) | (Status::Abandoned, Event::Retry) => {
            if task.history.len() as u32 >= config.max_attempts {
                return Err(illegal(task, &task.status.to_string(), "retry"));
            }
            let mut next = task.clone();
            next.status = Status::Pending;
            Ok(Transition {
                task: next,
                side_effects: vec![],
            })
        }

        (Status::Failed, Event::Exhaust) | (Status::Abandoned, Event::Exhaust) => {
            if (task.history.len() as u32) < config.max_attempts {
                return Err(illegal(task, &task.status.to_string(), "exhaust"));
            }
            let mut next = task.clone();
            next.status = Status::Blocked;
            Ok(Transition {
                task: next,
                side_effects: vec![SideEffect::Alert {
                    reason: format!(
                        "task {} exhausted {} attempts",
                        task.id, config.max_attempts
                    ),
                }],
            })
        }

        (Status::Blocked, Event::HumanResume) => {
            let mut next = task.clone();
            next.status = Status::Pending;
            Ok(Transition {
                task: next,
                side_effects: vec![],
            })
        }

        (Status::Blocked, Event::HumanCancel) | (Status::Pending, Event::HumanCancel) => {
            let mut next = task.clone();
            next.status = Status::Canceled;
            Ok(Transition {
                task: next,
                side_effects: vec![],
            })
        }

        (from, event) => Err(illegal(task, &from.to_string(), event_name(&event))),
    }
}

fn require_claim(task: &TaskRecord) -> Result<&Claim, ErrorKind> {
    task.claim.as_ref().ok_or_else(|| illegal(task, "in_progress", "worker event"))
}

fn illegal(task: &TaskRecord, from: &str, event: &str) -> ErrorKind {
    ErrorKind::IllegalTransition {
        task_id: task.id.clone(),
        from: from.to_string(),
        event: event.to_string(),
    }
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::Claim { .. } => "claim",
        Event::WorkerSuccess { .. } => "worker_success",
        Event::WorkerSuccessBadVerify { .. } => "worker_success_bad_verify",
        Event::WorkerFailure { .. } => "worker_failure",
        Event::WorkerBlock { .. } => "worker_block",
        Event::LeaseExpired => "lease_expired",
        Event::Retry => "retry",
        Event::Exhaust => "exhaust",
        Event::HumanResume => "human_resume",
        Event::HumanCancel => "human_cancel",
    }
}

/// Builds the hard-rejection transition: task state is left completely
/// unchanged (still `in_progress` under its original claim), and the
/// discrepancy is surfaced only through the returned side effects (an
/// alert and a Human Help Packet for the progress log), never through
/// `task.history`. `history` entries are reserved for transitions that
/// actually leave `in_progress` (§3's data model, and the mismatch event
/// by definition does not — the claim holder is unchanged); pushing one
/// here without updating `claim.attempt` would also just have broken
/// Invariant 4 (`claim.attempt == history.len() + 1` while claimed).
fn mismatch(task: &TaskRecord, actual_run_id: &str) -> Transition {
    let expected = task
        .claim
        .as_ref()
        .map(|c| c.run_id.clone())
        .unwrap_or_default();
    let reason = ErrorKind::RunIdMismatch {
        task_id: task.id.clone(),
        expected,
        actual: actual_run_id.to_string(),
    }
    .to_string();
    Transition {
        task: task.clone(),
        side_effects: vec![
            SideEffect::Alert { reason: reason.clone() },
            SideEffect::HumanHelpPacket {
                task_id: task.id.clone(),
                run_id: actual_run_id.to_string(),
                reason,
                suggested_actions: vec![
                    "inspect the active claim before taking any manual action".to_string(),
                    "the rogue worker's raw output is archived under runs/ regardless".to_string(),
                ],
            },
        ],
    }
}

/// Builds the verify-downgrade transition: `completed` demoted to `failed`
/// with a distinguished verify-failure error.
fn verify_failed(task: &TaskRecord, run_id: &str, verify: VerifyEvidence, now: DateTime<Utc>) -> Transition {
    let attempt = task.claim.as_ref().map(|c| c.attempt).unwrap_or(task.next_attempt());
    let mut next = task.clone();
    next.status = Status::Failed;
    next.claim = None;
    next.result = Some(TaskResult {
        verify: Some(verify.clone()),
        git: None,
        summary: None,
    });
    next.history.push(HistoryEntry {
        attempt,
        run_id: run_id.to_string(),
        status: Status::Failed,
        error: Some(
            ErrorKind::VerifyFailed {
                task_id: task.id.clone(),
                exit_code: verify.exit_code,
            }
            .to_string(),
        ),
        ended_at: now,
    });
    Transition {
        task: next,
        side_effects: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskRecord;

    fn config() -> Config {
        Config {
            max_attempts: 3,
            ..Config::default()
        }
    }

    #[test]
    fn claim_moves_pending_to_in_progress() {
        let task = TaskRecord::new("t1", "do the thing");
        let by_id = HashMap::new();
        let result = apply(
            &task,
            Event::Claim {
                claimed_by: "sup-1".to_string(),
                run_id: "run-1".to_string(),
            },
            Utc::now(),
            &config(),
            &by_id,
        )
        .unwrap();
        assert_eq!(result.task.status, Status::InProgress);
        assert_eq!(result.task.claim.unwrap().attempt, 1);
    }

    #[test]
    fn claim_rejected_when_deps_unsatisfied() {
        let mut task = TaskRecord::new("t1", "do the thing");
        task.depends_on.insert("t0".to_string());
        let by_id = HashMap::new();
        let result = apply(
            &task,
            Event::Claim {
                claimed_by: "sup-1".to_string(),
                run_id: "run-1".to_string(),
            },
            Utc::now(),
            &config(),
            &by_id,
        );
        assert!(result.is_err());
    }

    #[test]
    fn worker_success_completes_task() {
        let mut task = TaskRecord::new("t1", "do the thing");
        task.status = Status::InProgress;
        task.claim = Some(Claim {
            claimed_by: "sup-1".to_string(),
            run_id: "run-1".to_string(),
            claimed_at: Utc::now(),
            lease_expires_at: Utc::now() + chrono::Duration::seconds(900),
            attempt: 1,
        });
        let by_id = HashMap::new();
        let result = apply(
            &task,
            Event::WorkerSuccess {
                run_id: "run-1".to_string(),
                verify: Some(VerifyEvidence {
                    command: "scripts/verify.sh".to_string(),
                    exit_code: 0,
                    evidence: "ok".to_string(),
                }),
                git: None,
                summary: Some("done".to_string()),
            },
            Utc::now(),
            &config(),
            &by_id,
        )
        .unwrap();
        assert_eq!(result.task.status, Status::Completed);
        assert_eq!(result.task.history.len(), 1);
    }

    #[test]
    fn worker_success_bad_verify_downgrades_to_failed() {
        let mut task = TaskRecord::new("t1", "do the thing");
        task.status = Status::InProgress;
        task.claim = Some(Claim {
            claimed_by: "sup-1".to_string(),
            run_id: "run-1".to_string(),
            claimed_at: Utc::now(),
            lease_expires_at: Utc::now() + chrono::Duration::seconds(900),
            attempt: 1,
        });
        let by_id = HashMap::new();
        let result = apply(
            &task,
            Event::WorkerSuccessBadVerify {
                run_id: "run-1".to_string(),
                verify: VerifyEvidence {
                    command: "scripts/verify.sh".to_string(),
                    exit_code: 1,
                    evidence: "failure".to_string(),
                },
            },
            Utc::now(),
            &config(),
            &by_id,
        )
        .unwrap();
        assert_eq!(result.task.status, Status::Failed);
        assert!(result.task.history[0]
            .error
            .as_ref()
            .unwrap()
            .contains("verification failed"));
    }

    #[test]
    fn run_id_mismatch_leaves_state_unchanged() {
        let mut task = TaskRecord::new("t1", "do the thing");
        task.status = Status::InProgress;
        task.claim = Some(Claim {
            claimed_by: "sup-1".to_string(),
            run_id: "run-1".to_string(),
            claimed_at: Utc::now(),
            lease_expires_at: Utc::now() + chrono::Duration::seconds(900),
            attempt: 1,
        });
        let by_id = HashMap::new();
        let result = apply(
            &task,
            Event::WorkerSuccess {
                run_id: "run-0".to_string(),
                verify: Some(VerifyEvidence {
                    command: "x".to_string(),
                    exit_code: 0,
                    evidence: String::new(),
                }),
                git: None,
                summary: None,
            },
            Utc::now(),
            &config(),
            &by_id,
        )
        .unwrap();
        assert_eq!(result.task.status, Status::InProgress);
        assert!(matches!(result.side_effects[0], SideEffect::Alert { .. }));
    }

    #[test]
    fn exhaustion_moves_failed_to_blocked_at_cap() {
        let mut task = TaskRecord::new("t1", "do the thing");
        task.status = Status::Failed;
        for i in 1..=3 {
            task.history.push(HistoryEntry {
                attempt: i,
                run_id: format!("run-{i}"),
                status: Status::Failed,
                error: None,
                ended_at: Utc::now(),
            });
        }
        let by_id = HashMap::new();
        let result = apply(&task, Event::Exhaust, Utc::now(), &config(), &by_id).unwrap();
        assert_eq!(result.task.status, Status::Blocked);
    }

    #[test]
    fn retry_rejected_once_attempts_exhausted() {
        let mut task = TaskRecord::new("t1", "do the thing");
        task.status = Status::Failed;
        for i in 1..=3 {
            task.history.push(HistoryEntry {
                attempt: i,
                run_id: format!("run-{i}"),
                status: Status::Failed,
                error: None,
                ended_at: Utc::now(),
            });
        }
        let by_id = HashMap::new();
        let result = apply(&task, Event::Retry, Utc::now(), &config(), &by_id);
        assert!(result.is_err());
    }

    #[test]
    fn terminal_states_reject_all_events() {
        let mut task = TaskRecord::new("t1", "do the thing");
        task.status = Status::Completed;
        let by_id = HashMap::new();
        let result = apply(&task, Event::HumanResume, Utc::now(), &config(), &by_id);
        assert!(result.is_err());
    }
}

#[cfg(test)]
#[path = "state_machine_proptests.rs"]
mod proptests;
