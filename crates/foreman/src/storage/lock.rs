//! Advisory exclusive file locking for the atomic store.
//!
//! A polling `try_lock_exclusive` loop bounded by a timeout, releasing the
//! lock via `Drop` on every exit path, including error paths.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;

use crate::errors::{lock_contended, ActionableError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// RAII guard over an exclusively locked file; unlocks on drop.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquires exclusive locks on sibling `.lock` files, with a bounded
/// blocking wait or a non-blocking try variant.
#[derive(Debug, Clone)]
pub struct FileLocker {
    timeout: Duration,
}

impl FileLocker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Blocks, polling every 10ms, until the lock is acquired or `timeout`
    /// elapses.
    pub fn lock_exclusive(&self, path: &Path) -> Result<LockGuard, ActionableError> {
        let file = open_or_create(path)
            .map_err(|e| ActionableError::new(format!("could not open lock file {}: {e}", path.display())))?;
        let start = Instant::now();
        let mut warned_contended = false;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(true) => {
                    if warned_contended {
                        tracing::info!(
                            path = %path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "acquired lock after contention"
                        );
                    }
                    return Ok(LockGuard {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Ok(false) => {}
                Err(e) => {
                    return Err(ActionableError::new(format!(
                        "error locking {}: {e}",
                        path.display()
                    )))
                }
            }
            if start.elapsed() >= self.timeout {
                tracing::warn!(
                    path = %path.display(),
                    waited_ms = start.elapsed().as_millis() as u64,
                    "timed out waiting for lock"
                );
                return Err(lock_contended(
                    &path.display().to_string(),
                    start.elapsed().as_millis() as u64,
                ));
            }
            if !warned_contended && start.elapsed() >= POLL_INTERVAL * 10 {
                warned_contended = true;
                tracing::info!(path = %path.display(), "waiting on contended lock");
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Non-blocking variant; returns `None` if the lock is currently held.
    pub fn try_lock_exclusive(&self, path: &Path) -> Result<Option<LockGuard>, ActionableError> {
        let file = open_or_create(path)
            .map_err(|e| ActionableError::new(format!("could not open lock file {}: {e}", path.display())))?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(true) => Ok(Some(LockGuard {
                file,
                path: path.to_path_buf(),
            })),
            Ok(false) => Ok(None),
            Err(e) => Err(ActionableError::new(format!(
                "error locking {}: {e}",
                path.display()
            ))),
        }
    }
}

fn open_or_create(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}
