//! Property-based tests for the transition table's attempt-counting and
//! run-id-mismatch invariants across randomly generated histories.

use super::*;
use crate::domain::TaskRecord;
use proptest::prelude::*;

fn config_with_cap(max_attempts: u32) -> Config {
    Config {
        max_attempts,
        ..Config::default()
    }
}

fn failed_task_with_history(id: &str, attempts: u32) -> TaskRecord {
    let mut task = TaskRecord::new(id, "do the thing");
    task.status = Status::Failed;
    for i in 1..=attempts {
        task.history.push(HistoryEntry {
            attempt: i,
            run_id: format!("run-{i}"),
            status: Status::Failed,
            error: None,
            ended_at: Utc::now(),
        });
    }
    task
}

proptest! {
    // retry is only legal strictly below the configured cap.
    #[test]
    fn prop_retry_legality_matches_attempt_cap(
        max_attempts in 1u32..8,
        prior_attempts in 0u32..10,
    ) {
        let task = failed_task_with_history("t1", prior_attempts);
        let by_id = HashMap::new();
        let result = apply(&task, Event::Retry, Utc::now(), &config_with_cap(max_attempts), &by_id);
        prop_assert_eq!(result.is_ok(), prior_attempts < max_attempts);
    }

    // exhaust is only legal at-or-above the configured cap.
    #[test]
    fn prop_exhaust_legality_matches_attempt_cap(
        max_attempts in 1u32..8,
        prior_attempts in 0u32..10,
    ) {
        let task = failed_task_with_history("t1", prior_attempts);
        let by_id = HashMap::new();
        let result = apply(&task, Event::Exhaust, Utc::now(), &config_with_cap(max_attempts), &by_id);
        prop_assert_eq!(result.is_ok(), prior_attempts >= max_attempts);
        if let Ok(transition) = result {
            prop_assert_eq!(transition.task.status, Status::Blocked);
            prop_assert!(matches!(transition.side_effects[0], SideEffect::Alert { .. }));
        }
    }

    // A claim can only be taken below the attempt cap, and always records
    // the next sequential attempt number.
    #[test]
    fn prop_claim_respects_attempt_cap_and_sequencing(
        max_attempts in 1u32..8,
        prior_attempts in 0u32..10,
    ) {
        let mut task = TaskRecord::new("t1", "do the thing");
        task.history = (1..=prior_attempts)
            .map(|i| HistoryEntry {
                attempt: i,
                run_id: format!("run-{i}"),
                status: Status::Failed,
                error: None,
                ended_at: Utc::now(),
            })
            .collect();
        let by_id = HashMap::new();
        let result = apply(
            &task,
            Event::Claim { claimed_by: "sup-1".to_string(), run_id: "run-x".to_string() },
            Utc::now(),
            &config_with_cap(max_attempts),
            &by_id,
        );
        prop_assert_eq!(result.is_ok(), prior_attempts < max_attempts);
        if let Ok(transition) = result {
            prop_assert_eq!(transition.task.claim.unwrap().attempt, prior_attempts + 1);
        }
    }

    // A run-id mismatch on any in-progress worker event never changes the
    // task's status and always raises an alert, regardless of which
    // worker event carried the stale run id.
    #[test]
    fn prop_run_id_mismatch_never_changes_status(
        claimed_run_id in "[a-z0-9-]{3,10}",
        stale_run_id in "[a-z0-9-]{3,10}",
        attempt in 1u32..5,
        which in 0u8..3,
    ) {
        prop_assume!(claimed_run_id != stale_run_id);

        let mut task = TaskRecord::new("t1", "do the thing");
        task.status = Status::InProgress;
        task.claim = Some(Claim {
            claimed_by: "sup-1".to_string(),
            run_id: claimed_run_id,
            claimed_at: Utc::now(),
            lease_expires_at: Utc::now() + chrono::Duration::seconds(900),
            attempt,
        });
        let by_id = HashMap::new();

        let event = match which {
            0 => Event::WorkerSuccess {
                run_id: stale_run_id.clone(),
                verify: None,
                git: None,
                summary: None,
            },
            1 => Event::WorkerFailure { run_id: stale_run_id.clone(), error: None },
            _ => Event::WorkerBlock { run_id: stale_run_id.clone(), error: None },
        };

        let result = apply(&task, event, Utc::now(), &config_with_cap(3), &by_id).unwrap();
        prop_assert_eq!(result.task.status, Status::InProgress);
        prop_assert!(matches!(result.side_effects[0], SideEffect::Alert { .. }));
        prop_assert!(result.task.history.is_empty());
        prop_assert_eq!(result.task.claim.unwrap().attempt, attempt);
    }
}
