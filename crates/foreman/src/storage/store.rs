//! The Atomic Store: read/modify/write `Task.json` under an exclusive
//! lock, with a temp-file + fsync + rename commit.
//!
//! Writes go to a temp file, `fsync`, then `fs::rename` into place, since a
//! torn `Task.json` would violate every invariant at once.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::now_utc;
use crate::domain::TaskFile;
use crate::errors::{parse_error, ActionableError};

use super::lock::FileLocker;

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the path to `Task.json` and its sibling lock file.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    lock_path: PathBuf,
    locker: FileLocker,
}

impl TaskStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            path: root.join("Task.json"),
            lock_path: root.join("Task.json.lock"),
            locker: FileLocker::new(LOCK_TIMEOUT),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates `Task.json` with a default config and no tasks if it does
    /// not already exist. Idempotent.
    pub fn open(&self) -> Result<(), ActionableError> {
        if self.path.exists() {
            return Ok(());
        }
        let _guard = self.locker.lock_exclusive(&self.lock_path)?;
        if self.path.exists() {
            return Ok(());
        }
        self.write_atomic(&TaskFile::new())
    }

    /// Reads the current document without taking the lock. Callers that
    /// need a consistent read-modify-write must use `mutate` instead.
    pub fn read(&self) -> Result<TaskFile, ActionableError> {
        let bytes = fs::read(&self.path).map_err(|e| {
            ActionableError::new(format!("could not read {}: {e}", self.path.display()))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| parse_error(&self.path.display().to_string(), &e.to_string()))
    }

    /// Acquires the exclusive lock, re-reads the document under the lock
    /// (never trusting a cached copy), applies `f`, re-validates
    /// invariants, and commits atomically. Returns `f`'s side value.
    pub fn mutate<T>(
        &self,
        f: impl FnOnce(TaskFile) -> Result<(TaskFile, T), ActionableError>,
    ) -> Result<T, ActionableError> {
        let _guard = self.locker.lock_exclusive(&self.lock_path)?;
        let current = self.read()?;
        let (mut next, intent) = f(current)?;
        next.last_modified = now_utc();
        if let Err(e) = next.validate() {
            tracing::error!(path = %self.path.display(), "mutate rejected: invariant violation: {e}");
            return Err(ActionableError::new(format!("invariant violation: {e}")));
        }
        self.write_atomic(&next)?;
        Ok(intent)
    }

    fn write_atomic(&self, file: &TaskFile) -> Result<(), ActionableError> {
        let tmp_path = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(file)
            .map_err(|e| ActionableError::new(format!("could not serialize task file: {e}")))?;
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| {
                ActionableError::new(format!("could not create {}: {e}", tmp_path.display()))
            })?;
            tmp.write_all(&bytes).map_err(|e| {
                ActionableError::new(format!("could not write {}: {e}", tmp_path.display()))
            })?;
            tmp.sync_all().map_err(|e| {
                ActionableError::new(format!("could not fsync {}: {e}", tmp_path.display()))
            })?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            ActionableError::new(format!(
                "could not rename {} to {}: {e}",
                tmp_path.display(),
                self.path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskRecord;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn open_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.open().unwrap();
        let file = store.read().unwrap();
        assert!(file.tasks.is_empty());
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.open().unwrap();
        store
            .mutate(|mut f| {
                f.tasks.push(TaskRecord::new("t1", "hello"));
                Ok((f, ()))
            })
            .unwrap();
        store.open().unwrap();
        let file = store.read().unwrap();
        assert_eq!(file.tasks.len(), 1);
    }

    #[test]
    fn mutate_round_trips_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.open().unwrap();
        store
            .mutate(|mut f| {
                f.tasks.push(TaskRecord::new("t1", "hello"));
                Ok((f, ()))
            })
            .unwrap();
        let file = store.read().unwrap();
        assert_eq!(file.tasks.len(), 1);
        assert_eq!(file.tasks[0].id, "t1");
    }

    #[test]
    fn mutate_rejects_invariant_violation_and_leaves_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.open().unwrap();
        let result = store.mutate(|mut f| {
            let mut t1 = TaskRecord::new("t1", "hello");
            t1.depends_on.insert("ghost".to_string());
            f.tasks.push(t1);
            Ok((f, ()))
        });
        assert!(result.is_err());
        let file = store.read().unwrap();
        assert!(file.tasks.is_empty());
    }

    #[test]
    fn concurrent_mutations_serialize_without_losing_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path());
        store.open().unwrap();
        let barrier = Arc::new(Barrier::new(5));
        let mut handles = vec![];
        for i in 0..5 {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                store
                    .mutate(|mut f| {
                        f.tasks.push(TaskRecord::new(format!("t{i}"), "hello"));
                        Ok((f, ()))
                    })
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let file = store.read().unwrap();
        assert_eq!(file.tasks.len(), 5);
    }
}
