//! Structured error kinds and actionable, human-facing error rendering.
//!
//! `ErrorKind` is the closed set of error categories the state machine and
//! its collaborators can produce; `ActionableError` is the operator-facing
//! wrapper used by the CLI layer to explain a failure and suggest a
//! remedy.

use thiserror::Error;

/// One variant per error kind named in the error handling design.
///
/// Carries the contextual fields needed both to render a message and to
/// serialize into a task's `history` / the progress log.
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    #[error("illegal transition: task {task_id} cannot handle event {event} from state {from}")]
    IllegalTransition {
        task_id: String,
        from: String,
        event: String,
    },

    #[error("run id mismatch on task {task_id}: claim has {expected}, event carried {actual}")]
    RunIdMismatch {
        task_id: String,
        expected: String,
        actual: String,
    },

    #[error("verification failed for task {task_id}: verify script exited {exit_code}")]
    VerifyFailed { task_id: String, exit_code: i32 },

    #[error("worker for task {task_id} timed out after {timeout_secs}s")]
    Timeout {
        task_id: String,
        timeout_secs: u64,
    },

    #[error("worker for task {task_id} produced no parseable terminal document")]
    MalformedResult { task_id: String },

    #[error("task file is corrupt or unparseable: {detail}")]
    ParseError { detail: String },

    #[error("could not acquire lock on {path} after {waited_ms}ms")]
    LockContended { path: String, waited_ms: u64 },

    #[error("intake document {document} rejected: {reason}")]
    IntakeValidation { document: String, reason: String },

    #[error("refused to delete archive for in_progress task {task_id}")]
    RetentionPolicyViolation { task_id: String },
}

/// A one-line error plus structured causes and remedies, rendered as a
/// multi-paragraph message for operators.
///
/// A short headline, a list of plausible causes, and a list of concrete
/// next steps for every user-facing failure.
#[derive(Debug, Clone)]
pub struct ActionableError {
    error: String,
    causes: Vec<String>,
    remediation: Vec<String>,
}

impl ActionableError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            causes: Vec::new(),
            remediation: Vec::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.remediation.push(remedy.into());
        self
    }

    pub fn to_error_message(&self) -> String {
        let mut out = format!("Error: {}\n", self.error);
        if !self.causes.is_empty() {
            out.push_str("\nPossible causes:\n");
            for cause in &self.causes {
                out.push_str(&format!("  • {cause}\n"));
            }
        }
        if !self.remediation.is_empty() {
            out.push_str("\nTo fix:\n");
            for remedy in &self.remediation {
                out.push_str(&format!("  • {remedy}\n"));
            }
        }
        out
    }
}

impl std::fmt::Display for ActionableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_error_message())
    }
}

impl std::error::Error for ActionableError {}

/// Builds the actionable error shown when a lock could not be acquired.
pub fn lock_contended(path: &str, waited_ms: u64) -> ActionableError {
    ActionableError::new(
        ErrorKind::LockContended {
            path: path.to_string(),
            waited_ms,
        }
        .to_string(),
    )
    .with_cause("another supervisor process is holding the lock")
    .with_cause("a previous supervisor crashed while holding the lock")
    .with_remedy("check for other running `foreman` processes")
    .with_remedy(format!("if none are running, remove {path} manually"))
}

/// Builds the actionable error shown when an intake document fails validation.
pub fn intake_validation(document: &str, reason: &str) -> ActionableError {
    ActionableError::new(
        ErrorKind::IntakeValidation {
            document: document.to_string(),
            reason: reason.to_string(),
        }
        .to_string(),
    )
    .with_cause("the document is missing a required section")
    .with_cause("a seeded task's `depends_on` does not resolve")
    .with_remedy(format!(
        "edit {document} and re-run with --intake {document}"
    ))
    .with_remedy("the document was left in place with an inline failure annotation")
}

/// Builds the actionable error shown when the task file cannot be parsed.
pub fn parse_error(path: &str, detail: &str) -> ActionableError {
    ActionableError::new(
        ErrorKind::ParseError {
            detail: format!("{path}: {detail}"),
        }
        .to_string(),
    )
    .with_cause("the file was hand-edited and is no longer valid JSON")
    .with_cause("a write was interrupted before this supervisor's own atomic rename")
    .with_remedy(format!("restore {path} from a backup or version control"))
    .with_remedy("validate the repaired file with a JSON formatter before retrying")
}

