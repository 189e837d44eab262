//! The Worker Driver: spawn an opaque worker subprocess, capture its
//! output, parse its terminal result document, and archive the run.
//!
//! Spawned with piped stdio; `try_wait` is polled on a short sleep, and a
//! timed-out child gets a graceful SIGTERM, a grace period, then SIGKILL
//! rather than an immediate kill.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;

use crate::domain::WorkerResult;
use crate::errors::{ActionableError, ErrorKind};

/// Default in-memory capture bound per stream; the archived transcript is
/// never truncated by this, only the copy mirrored in memory.
pub const CAPTURE_LIMIT_BYTES: usize = 1024 * 1024;

const GRACE_PERIOD: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct WorkerConfig {
    pub command: String,
    pub timeout: Duration,
    pub capture_limit_bytes: usize,
    pub prompt_template: Option<PathBuf>,
}

/// Everything recorded about a single worker invocation, independent of
/// whether it produced a usable result.
#[derive(Debug, Clone, Serialize)]
pub struct RunArchive {
    pub task_id: String,
    pub run_id: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub parsed_result: Option<WorkerResult>,
}

pub struct WorkerOutcome {
    pub result: WorkerResult,
    pub timed_out: bool,
    pub archive_path: PathBuf,
}

/// A byte buffer capped at `limit`: bytes beyond the cap are simply not
/// appended, so the capture always holds the earliest output up to the
/// bound.
struct BoundedBuffer {
    data: Vec<u8>,
    limit: usize,
}

impl BoundedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.data.len() >= self.limit {
            return;
        }
        let remaining = self.limit - self.data.len();
        let take = remaining.min(bytes.len());
        self.data.extend_from_slice(&bytes[..take]);
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

fn spawn_reader(
    mut reader: impl std::io::Read + Send + 'static,
    archive_file: std::fs::File,
    limit: usize,
) -> (thread::JoinHandle<()>, Arc<Mutex<BoundedBuffer>>) {
    let buffer = Arc::new(Mutex::new(BoundedBuffer::new(limit)));
    let buffer_clone = Arc::clone(&buffer);
    let handle = thread::spawn(move || {
        let mut archive_file = archive_file;
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = archive_file.write_all(&chunk[..n]);
                    buffer_clone.lock().unwrap().push(&chunk[..n]);
                }
                Err(_) => break,
            }
        }
    });
    (handle, buffer)
}

/// Spawns the worker, waits for it to finish or time out, and returns the
/// raw archive (always produced) alongside the best-effort parsed result.
pub fn run_worker(
    project_root: &Path,
    runs_dir: &Path,
    task_id: &str,
    run_id: &str,
    config: &WorkerConfig,
) -> Result<WorkerOutcome, ActionableError> {
    fs::create_dir_all(runs_dir)
        .map_err(|e| ActionableError::new(format!("could not create {}: {e}", runs_dir.display())))?;

    let stdout_archive_path = runs_dir.join(format!("{run_id}.stdout.log"));
    let stderr_archive_path = runs_dir.join(format!("{run_id}.stderr.log"));
    let stdout_archive = fs::File::create(&stdout_archive_path)
        .map_err(|e| ActionableError::new(format!("could not create {}: {e}", stdout_archive_path.display())))?;
    let stderr_archive = fs::File::create(&stderr_archive_path)
        .map_err(|e| ActionableError::new(format!("could not create {}: {e}", stderr_archive_path.display())))?;

    let mut cmd = shell_command(&config.command);
    cmd.current_dir(project_root)
        .env("TASK_ID", task_id)
        .env("RUN_ID", run_id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(prompt) = &config.prompt_template {
        cmd.env("WORKER_PROMPT_PATH", prompt);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ActionableError::new(format!("could not spawn worker: {e}")))?;
    tracing::info!(task_id, run_id, pid = child.id(), "spawned worker");

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let (stdout_handle, stdout_buf) = spawn_reader(stdout, stdout_archive, config.capture_limit_bytes);
    let (stderr_handle, stderr_buf) = spawn_reader(stderr, stderr_archive, config.capture_limit_bytes);

    let timed_out = wait_with_timeout(&mut child, config.timeout);
    if timed_out {
        tracing::warn!(task_id, run_id, timeout_secs = config.timeout.as_secs(), "worker timed out, killing");
    }

    let _ = stdout_handle.join();
    let _ = stderr_handle.join();

    let exit_code = child.try_wait().ok().flatten().and_then(|s| s.code());
    tracing::info!(task_id, run_id, exit_code, timed_out, "worker exited");
    let stdout_text = Arc::try_unwrap(stdout_buf)
        .map(|m| m.into_inner().unwrap().into_string())
        .unwrap_or_default();
    let stderr_text = Arc::try_unwrap(stderr_buf)
        .map(|m| m.into_inner().unwrap().into_string())
        .unwrap_or_default();

    let full_stdout = fs::read_to_string(&stdout_archive_path).unwrap_or_else(|_| stdout_text.clone());

    let parsed = if timed_out {
        None
    } else {
        parse_last_json_object(&full_stdout)
            .and_then(|value| serde_json::from_value::<WorkerResult>(value).ok())
    };

    let result = match parsed.clone() {
        Some(result) if result.task_id() == task_id && result.run_id() == run_id => result,
        Some(actual) => synthesize_failed(
            task_id,
            actual.run_id(),
            &ErrorKind::MalformedResult {
                task_id: task_id.to_string(),
            }
            .to_string(),
        ),
        None if timed_out => synthesize_failed(
            task_id,
            run_id,
            &ErrorKind::Timeout {
                task_id: task_id.to_string(),
                timeout_secs: config.timeout.as_secs(),
            }
            .to_string(),
        ),
        None => synthesize_failed(
            task_id,
            run_id,
            &ErrorKind::MalformedResult {
                task_id: task_id.to_string(),
            }
            .to_string(),
        ),
    };

    let archive = RunArchive {
        task_id: task_id.to_string(),
        run_id: run_id.to_string(),
        command: config.command.clone(),
        exit_code,
        timed_out,
        stdout: stdout_text,
        stderr: stderr_text,
        parsed_result: parsed,
    };
    let archive_path = runs_dir.join(format!("{run_id}.json"));
    let archive_bytes = serde_json::to_vec_pretty(&archive)
        .map_err(|e| ActionableError::new(format!("could not serialize run archive: {e}")))?;
    fs::write(&archive_path, archive_bytes)
        .map_err(|e| ActionableError::new(format!("could not write {}: {e}", archive_path.display())))?;

    Ok(WorkerOutcome {
        result,
        timed_out,
        archive_path,
    })
}

fn synthesize_failed(task_id: &str, run_id: &str, error: &str) -> WorkerResult {
    WorkerResult::Failed {
        task_id: task_id.to_string(),
        run_id: run_id.to_string(),
        error: Some(error.to_string()),
        needs_human: false,
        extra: serde_json::Map::new(),
    }
}

/// Polls `try_wait` until the child exits or `timeout` elapses; on
/// timeout, sends SIGTERM, allows a grace period, then SIGKILLs. Returns
/// whether the timeout path was taken.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return false,
            Ok(None) => {}
            Err(_) => return false,
        }
        if start.elapsed() >= timeout {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
    let grace_start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return true,
        }
        if grace_start.elapsed() >= GRACE_PERIOD {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    let _ = child.kill();
    let _ = child.wait();
    true
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

/// Scans `stdout` for the last standalone well-formed JSON object, so two
/// terminal documents on one stream resolve to the second.
pub fn parse_last_json_object(stdout: &str) -> Option<serde_json::Value> {
    let mut last = None;
    let mut depth = 0i32;
    let mut start = None;
    let mut in_string = false;
    let mut escape = false;
    let bytes = stdout.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&stdout[s..=i]) {
                            last = Some(value);
                        }
                    }
                    start = None;
                }
            }
            _ => {}
        }
        i += 1;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_last_json_object_picks_final_document() {
        let stdout = r#"some log line
{"task_id":"t1","run_id":"r0","status":"failed","error":"stale"}
more logs
{"task_id":"t1","run_id":"r1","status":"completed","verify":{"command":"x","exit_code":0,"evidence":"ok"}}
"#;
        let value = parse_last_json_object(stdout).unwrap();
        assert_eq!(value["run_id"], "r1");
    }

    #[test]
    fn parse_last_json_object_ignores_braces_inside_strings() {
        let stdout = r#"{"task_id":"t1","run_id":"r1","status":"failed","error":"contains { and }"}"#;
        let value = parse_last_json_object(stdout).unwrap();
        assert_eq!(value["error"], "contains { and }");
    }

    #[test]
    fn parse_last_json_object_returns_none_when_absent() {
        assert!(parse_last_json_object("no json here").is_none());
    }

    #[test]
    fn run_worker_synthesizes_failed_on_missing_result() {
        let project_dir = tempfile::tempdir().unwrap();
        let runs_dir = project_dir.path().join("runs");
        let config = WorkerConfig {
            command: "echo not json".to_string(),
            timeout: Duration::from_secs(5),
            capture_limit_bytes: CAPTURE_LIMIT_BYTES,
            prompt_template: None,
        };
        let outcome = run_worker(project_dir.path(), &runs_dir, "t1", "run-1", &config).unwrap();
        match outcome.result {
            WorkerResult::Failed { error, .. } => {
                assert_eq!(
                    error.as_deref(),
                    Some("worker for task t1 produced no parseable terminal document")
                );
            }
            _ => panic!("expected synthesized failure"),
        }
        assert!(outcome.archive_path.exists());
    }

    #[test]
    fn run_worker_parses_completed_result() {
        let project_dir = tempfile::tempdir().unwrap();
        let runs_dir = project_dir.path().join("runs");
        let config = WorkerConfig {
            command: r#"echo '{"task_id":"t1","run_id":"run-1","status":"completed","verify":{"command":"x","exit_code":0,"evidence":"ok"}}'"#.to_string(),
            timeout: Duration::from_secs(5),
            capture_limit_bytes: CAPTURE_LIMIT_BYTES,
            prompt_template: None,
        };
        let outcome = run_worker(project_dir.path(), &runs_dir, "t1", "run-1", &config).unwrap();
        assert!(matches!(outcome.result, WorkerResult::Completed { .. }));
        assert!(!outcome.timed_out);
    }

    #[test]
    fn run_worker_times_out_long_running_command() {
        let project_dir = tempfile::tempdir().unwrap();
        let runs_dir = project_dir.path().join("runs");
        let config = WorkerConfig {
            command: "sleep 30".to_string(),
            timeout: Duration::from_millis(200),
            capture_limit_bytes: CAPTURE_LIMIT_BYTES,
            prompt_template: None,
        };
        let outcome = run_worker(project_dir.path(), &runs_dir, "t1", "run-1", &config).unwrap();
        assert!(outcome.timed_out);
        match outcome.result {
            WorkerResult::Failed { error, .. } => assert_eq!(
                error.as_deref(),
                Some("worker for task t1 timed out after 0s")
            ),
            _ => panic!("expected timeout failure"),
        }
    }

    #[test]
    fn run_worker_propagates_workers_actual_run_id_on_mismatch() {
        let project_dir = tempfile::tempdir().unwrap();
        let runs_dir = project_dir.path().join("runs");
        let config = WorkerConfig {
            command: r#"echo '{"task_id":"t1","run_id":"rogue-run","status":"completed","verify":{"command":"x","exit_code":0,"evidence":"ok"}}'"#.to_string(),
            timeout: Duration::from_secs(5),
            capture_limit_bytes: CAPTURE_LIMIT_BYTES,
            prompt_template: None,
        };
        let outcome = run_worker(project_dir.path(), &runs_dir, "t1", "run-1", &config).unwrap();
        match outcome.result {
            WorkerResult::Failed { run_id, .. } => assert_eq!(run_id, "rogue-run"),
            _ => panic!("expected synthesized failure carrying the worker's actual run_id"),
        }
    }
}
