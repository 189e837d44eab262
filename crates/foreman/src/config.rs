//! `foreman.toml`: the operational half of configuration (worker command,
//! timeouts, poll interval) that sits alongside, but outside, the
//! persisted `TaskFile::config` policy fields.
//!
//! An optional TOML file with optional nested sections, every field
//! defaulted in code, CLI flags taking precedence over the file, the file
//! taking precedence over the built-in default.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ActionableError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    pub worker_command: String,
    pub worker_timeout_seconds: u64,
    pub verify_command: String,
    pub capture_limit_bytes: usize,
    pub poll_interval_seconds: u64,
    pub watch_inbox_interval_seconds: u64,
    pub intake_gate_command: Option<String>,
    /// Path (relative to the project root) to an opaque prose asset handed
    /// to the worker as `WORKER_PROMPT_PATH`; never parsed or validated here.
    pub prompt_template: Option<String>,
    pub status_report_recent_runs: usize,
    /// `--lease-ttl` CLI override, applied for the duration of this
    /// invocation only; never read from or written to `foreman.toml`.
    #[serde(skip)]
    pub lease_ttl_override: Option<u64>,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            worker_command: "scripts/worker.sh".to_string(),
            // Kept comfortably below the default `lease_ttl_seconds` (900)
            // so a fresh project never starts out warning about an
            // undersized lease.
            worker_timeout_seconds: 300,
            verify_command: "scripts/verify.sh".to_string(),
            capture_limit_bytes: crate::worker::CAPTURE_LIMIT_BYTES,
            poll_interval_seconds: 5,
            watch_inbox_interval_seconds: 30,
            intake_gate_command: None,
            prompt_template: Some("templates/worker_prompt.md".to_string()),
            status_report_recent_runs: 10,
            lease_ttl_override: None,
        }
    }
}

impl ForemanConfig {
    /// Loads `foreman.toml` from `root` if present; otherwise returns the
    /// built-in defaults. A present-but-unparseable file is a fatal error,
    /// not silently ignored.
    pub fn load(root: &Path) -> Result<Self, ActionableError> {
        let path = root.join("foreman.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| ActionableError::new(format!("could not read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| ActionableError::new(format!("could not parse {}: {e}", path.display())))
    }
}
