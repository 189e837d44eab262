//! The persisted data model: `TaskFile`, `Config`, `TaskRecord`, and the
//! worker result tagged sum.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::graph::GraphNode;

pub const TASK_FILE_VERSION: &str = "2.0";

/// Status a `TaskRecord` can occupy. See the state machine for legal
/// transitions between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Abandoned,
    Canceled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Canceled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Blocked => "blocked",
            Status::Abandoned => "abandoned",
            Status::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// Declared task priority. Lower numeric value schedules first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::P1
    }
}

/// Operational and policy configuration persisted inside `TaskFile`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub lease_ttl_seconds: u64,
    pub max_attempts: u32,
    pub verify_required: bool,
    pub retention_days: u32,
    pub max_runs_mb: u64,
    pub max_failures: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: 900,
            max_attempts: 3,
            verify_required: true,
            retention_days: 7,
            max_runs_mb: 100,
            max_failures: 5,
        }
    }
}

/// An active, time-bounded assertion that a task is being worked.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Claim {
    pub claimed_by: String,
    pub run_id: String,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub attempt: u32,
}

/// Verification-gate evidence attached to a `result`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VerifyEvidence {
    pub command: String,
    pub exit_code: i32,
    pub evidence: String,
}

/// Version-control evidence attached to a `result`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GitEvidence {
    pub commit: Option<String>,
    pub branch: Option<String>,
}

/// Recorded outcome of a task's most recent successful run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskResult {
    pub verify: Option<VerifyEvidence>,
    pub git: Option<GitEvidence>,
    pub summary: Option<String>,
}

/// One entry appended to `history` on every terminal transition out of
/// `in_progress`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HistoryEntry {
    pub attempt: u32,
    pub run_id: String,
    pub status: Status,
    pub error: Option<String>,
    pub ended_at: DateTime<Utc>,
}

/// A unit of declared work and its full execution history.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskRecord {
    pub id: String,
    pub description: String,
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default)]
    pub claim: Option<Claim>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub notes: String,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: Status::Pending,
            priority: Priority::P1,
            depends_on: HashSet::new(),
            claim: None,
            result: None,
            history: Vec::new(),
            notes: String::new(),
        }
    }

    /// True once every dependency id resolves to a `Completed` task in `by_id`.
    pub fn deps_satisfied(&self, by_id: &HashMap<String, &TaskRecord>) -> bool {
        self.depends_on.iter().all(|dep| {
            by_id
                .get(dep)
                .map(|task| task.status == Status::Completed)
                .unwrap_or(false)
        })
    }

    /// Number of attempts already recorded; the attempt a fresh claim would use.
    pub fn next_attempt(&self) -> u32 {
        self.history.len() as u32 + 1
    }
}

impl GraphNode for TaskRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &HashSet<String> {
        &self.depends_on
    }
}

/// The single persistent document this supervisor reads, mutates, and
/// commits under an exclusive lock.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskFile {
    pub version: String,
    pub last_modified: DateTime<Utc>,
    pub config: Config,
    pub tasks: Vec<TaskRecord>,
}

impl TaskFile {
    pub fn new() -> Self {
        Self {
            version: TASK_FILE_VERSION.to_string(),
            last_modified: Utc::now(),
            config: Config::default(),
            tasks: Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn by_id_map(&self) -> HashMap<String, &TaskRecord> {
        self.tasks.iter().map(|t| (t.id.clone(), t)).collect()
    }

    /// Re-checks every invariant from the data model section. Called by the
    /// atomic store after every `mutate` closure runs, before the write
    /// is committed.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.clone()) {
                return Err(format!("duplicate task id: {}", task.id));
            }
        }

        let by_id = self.by_id_map();
        for task in &self.tasks {
            for dep in &task.depends_on {
                if !by_id.contains_key(dep) {
                    return Err(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    ));
                }
            }
        }

        let refs: Vec<&TaskRecord> = self.tasks.iter().collect();
        let graph = crate::graph::DependencyGraph::new(&refs);
        graph.validate_dag().map_err(|e| e.to_string())?;

        // Invariant 1: every completed task has a zero verify exit code when required.
        if self.config.verify_required {
            for task in &self.tasks {
                if task.status == Status::Completed {
                    let exit_code = task.result.as_ref().and_then(|r| r.verify.as_ref()).map(|v| v.exit_code);
                    if exit_code != Some(0) {
                        return Err(format!(
                            "task {} is completed but does not carry a zero verify exit code",
                            task.id
                        ));
                    }
                }
            }
        }

        // Invariant 2/3: at most one live claim per task, and claims only on in_progress.
        for task in &self.tasks {
            match (&task.status, &task.claim) {
                (Status::InProgress, None) => {
                    return Err(format!("task {} is in_progress without a claim", task.id));
                }
                (status, Some(_)) if *status != Status::InProgress => {
                    return Err(format!(
                        "task {} carries a claim but is not in_progress",
                        task.id
                    ));
                }
                _ => {}
            }
        }

        // Invariant 4: attempt is monotone and equals history.length + 1 while claimed.
        for task in &self.tasks {
            let mut last_attempt = 0u32;
            for entry in &task.history {
                if entry.attempt < last_attempt {
                    return Err(format!("task {} has non-monotone history attempts", task.id));
                }
                last_attempt = entry.attempt;
            }
            if let Some(claim) = &task.claim {
                if claim.attempt != task.history.len() as u32 + 1 {
                    return Err(format!(
                        "task {} claim attempt {} does not equal history length + 1",
                        task.id, claim.attempt
                    ));
                }
            }
        }

        // Invariant 7: history never exceeds max_attempts.
        for task in &self.tasks {
            if task.history.len() as u32 > self.config.max_attempts {
                return Err(format!(
                    "task {} history length {} exceeds max_attempts {}",
                    task.id,
                    task.history.len(),
                    self.config.max_attempts
                ));
            }
        }

        Ok(())
    }
}

impl Default for TaskFile {
    fn default() -> Self {
        Self::new()
    }
}

/// The worker's reported termination document. A tagged sum so serde
/// enforces the required fields per status at parse time, while
/// `extra` tolerates fields the supervisor does not know about.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResult {
    Completed {
        task_id: String,
        run_id: String,
        verify: Option<VerifyEvidence>,
        git: Option<GitEvidence>,
        summary: Option<String>,
        #[serde(flatten, default)]
        extra: Map<String, Value>,
    },
    Failed {
        task_id: String,
        run_id: String,
        error: Option<String>,
        #[serde(default)]
        needs_human: bool,
        #[serde(flatten, default)]
        extra: Map<String, Value>,
    },
    Blocked {
        task_id: String,
        run_id: String,
        error: Option<String>,
        #[serde(default)]
        needs_human: bool,
        #[serde(flatten, default)]
        extra: Map<String, Value>,
    },
}

impl WorkerResult {
    pub fn task_id(&self) -> &str {
        match self {
            WorkerResult::Completed { task_id, .. } => task_id,
            WorkerResult::Failed { task_id, .. } => task_id,
            WorkerResult::Blocked { task_id, .. } => task_id,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            WorkerResult::Completed { run_id, .. } => run_id,
            WorkerResult::Failed { run_id, .. } => run_id,
            WorkerResult::Blocked { run_id, .. } => run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_file_has_no_tasks_and_default_config() {
        let file = TaskFile::new();
        assert!(file.tasks.is_empty());
        assert_eq!(file.config.lease_ttl_seconds, 900);
        assert_eq!(file.version, TASK_FILE_VERSION);
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut file = TaskFile::new();
        file.tasks.push(TaskRecord::new("t1", "first"));
        file.tasks.push(TaskRecord::new("t1", "second"));
        assert!(file.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let mut file = TaskFile::new();
        let mut t1 = TaskRecord::new("t1", "first");
        t1.depends_on.insert("ghost".to_string());
        file.tasks.push(t1);
        assert!(file.validate().is_err());
    }

    #[test]
    fn validate_rejects_dependency_cycle() {
        let mut file = TaskFile::new();
        let mut t1 = TaskRecord::new("t1", "first");
        t1.depends_on.insert("t2".to_string());
        let mut t2 = TaskRecord::new("t2", "second");
        t2.depends_on.insert("t1".to_string());
        file.tasks.push(t1);
        file.tasks.push(t2);
        assert!(file.validate().is_err());
    }

    #[test]
    fn validate_rejects_completed_without_zero_exit() {
        let mut file = TaskFile::new();
        let mut t1 = TaskRecord::new("t1", "first");
        t1.status = Status::Completed;
        file.tasks.push(t1);
        assert!(file.validate().is_err());
    }

    #[test]
    fn deps_satisfied_true_when_no_deps() {
        let t1 = TaskRecord::new("t1", "first");
        let map = HashMap::new();
        assert!(t1.deps_satisfied(&map));
    }

    #[test]
    fn worker_result_round_trips_completed() {
        let json = r#"{"task_id":"t1","run_id":"r1","status":"completed","verify":{"command":"x","exit_code":0,"evidence":"ok"},"summary":"done","extra_field":42}"#;
        let result: WorkerResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.task_id(), "t1");
        match result {
            WorkerResult::Completed { extra, .. } => {
                assert_eq!(extra.get("extra_field").unwrap(), &serde_json::json!(42));
            }
            _ => panic!("expected completed"),
        }
    }

    #[test]
    fn worker_result_parses_blocked() {
        let json = r#"{"task_id":"t1","run_id":"r1","status":"blocked","error":"need creds","needs_human":true}"#;
        let result: WorkerResult = serde_json::from_str(json).unwrap();
        assert!(matches!(result, WorkerResult::Blocked { .. }));
    }
}
