//! Claim and reclaim: selecting the next eligible task, claiming it, and
//! sweeping expired leases back to a retry-eligible state.
//!
//! A claim lives directly on the `TaskRecord`, so both operations are
//! plain `TaskStore::mutate` closures rather than needing a side index to
//! keep in sync — there is nothing else that could drift out of agreement
//! with the task file.

use std::collections::HashMap;

use chrono::Utc;

use crate::clock::{new_run_id, supervisor_id};
use crate::domain::{Status, TaskRecord};
use crate::errors::ActionableError;
use crate::state_machine::{self, Event, SideEffect};
use crate::storage::TaskStore;

/// A task claimed and ready to hand to the Worker Driver.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: String,
    pub run_id: String,
    pub attempt: u32,
}

/// Picks the next eligible `Pending` task (lowest priority value first,
/// ties by declaration order) and atomically claims it, or returns `None`
/// if nothing is eligible right now.
pub fn claim_next(store: &TaskStore, lease_ttl_override: Option<u64>) -> Result<Option<ClaimedTask>, ActionableError> {
    let run_id = new_run_id();
    let claimed_by = supervisor_id().to_string();

    store.mutate(move |mut file| {
        let now = Utc::now();
        let mut config = file.config.clone();
        if let Some(ttl) = lease_ttl_override {
            config.lease_ttl_seconds = ttl;
        }

        let by_id: HashMap<String, &TaskRecord> =
            file.tasks.iter().map(|t| (t.id.clone(), t)).collect();

        let candidate_id = file
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == Status::Pending && t.deps_satisfied(&by_id))
            .min_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ia.cmp(ib)))
            .map(|(_, t)| t.id.clone());

        let Some(candidate_id) = candidate_id else {
            return Ok((file, None));
        };

        let by_id: HashMap<String, &TaskRecord> =
            file.tasks.iter().map(|t| (t.id.clone(), t)).collect();
        let task = by_id.get(&candidate_id).unwrap();
        let transition = state_machine::apply(
            task,
            Event::Claim {
                claimed_by: claimed_by.clone(),
                run_id: run_id.clone(),
            },
            now,
            &config,
            &by_id,
        )
        .map_err(|e| ActionableError::new(e.to_string()))?;

        let attempt = transition
            .task
            .claim
            .as_ref()
            .map(|c| c.attempt)
            .unwrap_or(1);
        let claimed = ClaimedTask {
            task_id: candidate_id.clone(),
            run_id: run_id.clone(),
            attempt,
        };

        *file.find_mut(&candidate_id).unwrap() = transition.task;
        tracing::info!(task_id = %candidate_id, run_id = %run_id, attempt, "claimed task");
        Ok((file, Some(claimed)))
    })
}

/// Outcome of a single reclaim sweep, reported back to the supervisor loop
/// so it can log and alert.
#[derive(Debug, Clone)]
pub struct ReclaimReport {
    pub abandoned: Vec<String>,
    pub side_effects: Vec<(String, SideEffect)>,
}

/// Sweeps every `in_progress` task whose lease has expired, transitioning
/// it to `abandoned` and then immediately to either `pending` (attempts
/// remain) or `blocked` (exhausted). Idempotent: a second sweep with no
/// newly expired leases reports nothing.
pub fn reclaim_sweep(store: &TaskStore) -> Result<ReclaimReport, ActionableError> {
    store.mutate(|mut file| {
        let now = Utc::now();
        let config = file.config.clone();
        let mut abandoned = Vec::new();
        let mut side_effects = Vec::new();

        let expired_ids: Vec<String> = file
            .tasks
            .iter()
            .filter(|t| {
                t.status == Status::InProgress
                    && t.claim
                        .as_ref()
                        .map(|c| c.lease_expires_at <= now)
                        .unwrap_or(false)
            })
            .map(|t| t.id.clone())
            .collect();

        for id in expired_ids {
            let by_id: HashMap<String, &TaskRecord> =
                file.tasks.iter().map(|t| (t.id.clone(), t)).collect();
            let task = by_id.get(&id).unwrap();
            let expire_transition = state_machine::apply(task, Event::LeaseExpired, now, &config, &by_id)
                .map_err(|e| ActionableError::new(e.to_string()))?;
            let abandoned_task = expire_transition.task;

            let follow_up_event = if (abandoned_task.history.len() as u32) < config.max_attempts {
                Event::Retry
            } else {
                Event::Exhaust
            };
            let follow_up = state_machine::apply(&abandoned_task, follow_up_event, now, &config, &HashMap::new())
                .map_err(|e| ActionableError::new(e.to_string()))?;

            for effect in follow_up.side_effects {
                side_effects.push((id.clone(), effect));
            }

            tracing::warn!(
                task_id = %id,
                new_status = ?follow_up.task.status,
                "reclaimed abandoned lease"
            );

            abandoned.push(id.clone());
            *file.find_mut(&id).unwrap() = follow_up.task;
        }

        Ok((file, ReclaimReport { abandoned, side_effects }))
    })
}

/// True if `lease_ttl_seconds` is configured too tight relative to the
/// worker timeout to leave any margin for the driver's own kill/cleanup
/// path (recommended: `lease_ttl_seconds >= 1.5 * worker_timeout`).
pub fn lease_too_tight(lease_ttl_seconds: u64, worker_timeout_seconds: u64) -> bool {
    lease_ttl_seconds < worker_timeout_seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Config;

    #[test]
    fn claim_next_picks_lowest_priority_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.open().unwrap();
        store
            .mutate(|mut f| {
                let mut low = TaskRecord::new("low", "low priority");
                low.priority = crate::domain::Priority::P2;
                let mut high = TaskRecord::new("high", "high priority");
                high.priority = crate::domain::Priority::P0;
                f.tasks.push(low);
                f.tasks.push(high);
                Ok((f, ()))
            })
            .unwrap();

        let claimed = claim_next(&store, None).unwrap().unwrap();
        assert_eq!(claimed.task_id, "high");
    }

    #[test]
    fn claim_next_skips_tasks_with_unsatisfied_deps() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.open().unwrap();
        store
            .mutate(|mut f| {
                let mut blocked = TaskRecord::new("blocked", "needs t0");
                blocked.depends_on.insert("t0".to_string());
                let t0 = TaskRecord::new("t0", "prerequisite");
                f.tasks.push(blocked);
                f.tasks.push(t0);
                Ok((f, ()))
            })
            .unwrap();

        let claimed = claim_next(&store, None).unwrap().unwrap();
        assert_eq!(claimed.task_id, "t0");
    }

    #[test]
    fn reclaim_sweep_abandons_then_retries_expired_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.open().unwrap();
        store
            .mutate(|mut f| {
                f.config = Config {
                    max_attempts: 3,
                    ..Config::default()
                };
                let mut task = TaskRecord::new("t1", "expiring");
                task.status = Status::InProgress;
                task.claim = Some(crate::domain::Claim {
                    claimed_by: "sup-1".to_string(),
                    run_id: "run-1".to_string(),
                    claimed_at: Utc::now() - chrono::Duration::seconds(1000),
                    lease_expires_at: Utc::now() - chrono::Duration::seconds(100),
                    attempt: 1,
                });
                f.tasks.push(task);
                Ok((f, ()))
            })
            .unwrap();

        let report = reclaim_sweep(&store).unwrap();
        assert_eq!(report.abandoned, vec!["t1".to_string()]);

        let file = store.read().unwrap();
        assert_eq!(file.find("t1").unwrap().status, Status::Pending);
        assert_eq!(file.find("t1").unwrap().history.len(), 1);
    }

    #[test]
    fn reclaim_sweep_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.open().unwrap();
        let first = reclaim_sweep(&store).unwrap();
        let second = reclaim_sweep(&store).unwrap();
        assert!(first.abandoned.is_empty());
        assert!(second.abandoned.is_empty());
    }

    #[test]
    fn lease_too_tight_flags_undersized_ttl() {
        assert!(lease_too_tight(60, 120));
        assert!(!lease_too_tight(180, 120));
    }
}
