//! The Progress Log: an append-only, timestamped record of every state
//! transition and supervisor-level event, for human audit.
//!
//! Opened with `OpenOptions::new().create(true).append(true)`, one record
//! per event, rendered primarily as human-readable text blocks; a JSONL
//! mirror (`progress.jsonl`) is written alongside so the reporter can read
//! structured history without re-parsing prose. Neither file is ever
//! rewritten or truncated.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::Status;
use crate::errors::ActionableError;

/// One state-transition or supervisor-level event.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub event_kind: String,
    pub task_id: String,
    pub run_id: Option<String>,
    pub from_status: Option<Status>,
    pub to_status: Option<Status>,
    pub attempt: Option<u32>,
    pub verify_exit_code: Option<i32>,
    pub commit: Option<String>,
    pub duration_ms: Option<u64>,
    pub reason: String,
}

/// A structured block raised for an irrecoverable situation requiring
/// operator action (run-id mismatch, a task becoming `blocked`).
#[derive(Debug, Clone, Serialize)]
pub struct HumanHelpPacket {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub run_id: String,
    pub reason: String,
    pub suggested_actions: Vec<String>,
}

pub struct ProgressLog {
    text_path: PathBuf,
    jsonl_path: PathBuf,
}

impl ProgressLog {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            text_path: root.join("progress.txt"),
            jsonl_path: root.join("progress.jsonl"),
        }
    }

    pub fn append_event(&self, event: &ProgressEvent) -> Result<(), ActionableError> {
        let mut block = format!(
            "[{}] {}\n  task: {}\n",
            event.timestamp.to_rfc3339(),
            event.event_kind,
            event.task_id
        );
        if let Some(run_id) = &event.run_id {
            block.push_str(&format!("  run: {run_id}\n"));
        }
        if let (Some(from), Some(to)) = (event.from_status, event.to_status) {
            block.push_str(&format!("  transition: {from} -> {to}\n"));
        }
        if let Some(attempt) = event.attempt {
            block.push_str(&format!("  attempt: {attempt}\n"));
        }
        if let Some(exit_code) = event.verify_exit_code {
            block.push_str(&format!("  verify exit code: {exit_code}\n"));
        }
        if let Some(commit) = &event.commit {
            block.push_str(&format!("  commit: {commit}\n"));
        }
        if let Some(duration_ms) = event.duration_ms {
            block.push_str(&format!("  duration: {duration_ms}ms\n"));
        }
        block.push_str(&format!("  reason: {}\n\n", event.reason));

        self.append_text(&block)?;
        self.append_jsonl(event)
    }

    pub fn append_human_help_packet(&self, packet: &HumanHelpPacket) -> Result<(), ActionableError> {
        let mut block = format!(
            "[{}] HUMAN HELP PACKET\n  task: {}\n  run: {}\n  reason: {}\n  suggested actions:\n",
            packet.timestamp.to_rfc3339(),
            packet.task_id,
            packet.run_id,
            packet.reason
        );
        for action in &packet.suggested_actions {
            block.push_str(&format!("    - {action}\n"));
        }
        block.push('\n');

        self.append_text(&block)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.jsonl_path)
            .map_err(|e| ActionableError::new(format!("could not open {}: {e}", self.jsonl_path.display())))?;
        let line = serde_json::to_string(&serde_json::json!({ "kind": "human_help_packet", "packet": packet }))
            .map_err(|e| ActionableError::new(format!("could not serialize human help packet: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| ActionableError::new(format!("could not write {}: {e}", self.jsonl_path.display())))
    }

    fn append_text(&self, block: &str) -> Result<(), ActionableError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.text_path)
            .map_err(|e| ActionableError::new(format!("could not open {}: {e}", self.text_path.display())))?;
        file.write_all(block.as_bytes())
            .map_err(|e| ActionableError::new(format!("could not write {}: {e}", self.text_path.display())))
    }

    fn append_jsonl(&self, event: &ProgressEvent) -> Result<(), ActionableError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.jsonl_path)
            .map_err(|e| ActionableError::new(format!("could not open {}: {e}", self.jsonl_path.display())))?;
        let line = serde_json::to_string(event)
            .map_err(|e| ActionableError::new(format!("could not serialize progress event: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| ActionableError::new(format!("could not write {}: {e}", self.jsonl_path.display())))
    }
}

pub fn event(event_kind: &str, task_id: &str, reason: &str) -> ProgressEvent {
    ProgressEvent {
        timestamp: Utc::now(),
        event_kind: event_kind.to_string(),
        task_id: task_id.to_string(),
        run_id: None,
        from_status: None,
        to_status: None,
        attempt: None,
        verify_exit_code: None,
        commit: None,
        duration_ms: None,
        reason: reason.to_string(),
    }
}
