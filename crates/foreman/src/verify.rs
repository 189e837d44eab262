//! The Verification Gate: invoke the external verify script and capture
//! its exit code and evidence.
//!
//! Runs through a shell wrapper with `Stdio::piped()`, capturing full
//! stdout/stderr.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::domain::VerifyEvidence;
use crate::errors::ActionableError;

const EVIDENCE_KIB: usize = 1024;

pub struct VerifyOutcome {
    pub evidence: VerifyEvidence,
    pub passed: bool,
}

/// Runs `command` in `project_root`, archives the full output to
/// `runs/<run_id>.verify.log`, and returns the exit code plus the first
/// kilobyte of stdout as evidence.
pub fn run_gate(
    project_root: &Path,
    runs_dir: &Path,
    run_id: &str,
    command: &str,
) -> Result<VerifyOutcome, ActionableError> {
    let output = shell_command(command)
        .current_dir(project_root)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ActionableError::new(format!("could not run verify command {command}: {e}")))?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    fs::create_dir_all(runs_dir)
        .map_err(|e| ActionableError::new(format!("could not create {}: {e}", runs_dir.display())))?;
    let archive_path = runs_dir.join(format!("{run_id}.verify.log"));
    fs::write(&archive_path, format!("$ {command}\nexit code: {exit_code}\n\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}\n"))
        .map_err(|e| ActionableError::new(format!("could not write {}: {e}", archive_path.display())))?;

    let evidence_text: String = stdout.chars().take(EVIDENCE_KIB).collect();

    Ok(VerifyOutcome {
        evidence: VerifyEvidence {
            command: command.to_string(),
            exit_code,
            evidence: evidence_text,
        },
        passed: exit_code == 0,
    })
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_gate_reports_success_on_zero_exit() {
        let project_dir = tempfile::tempdir().unwrap();
        let runs_dir = project_dir.path().join("runs");
        let outcome = run_gate(project_dir.path(), &runs_dir, "run-1", "exit 0").unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.evidence.exit_code, 0);
    }

    #[test]
    fn run_gate_reports_failure_on_nonzero_exit() {
        let project_dir = tempfile::tempdir().unwrap();
        let runs_dir = project_dir.path().join("runs");
        let outcome = run_gate(project_dir.path(), &runs_dir, "run-1", "exit 1").unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.evidence.exit_code, 1);
    }

    #[test]
    fn run_gate_captures_stdout_as_evidence() {
        let project_dir = tempfile::tempdir().unwrap();
        let runs_dir = project_dir.path().join("runs");
        let outcome = run_gate(project_dir.path(), &runs_dir, "run-1", "echo hello").unwrap();
        assert!(outcome.evidence.evidence.contains("hello"));
    }
}
