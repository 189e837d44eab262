//! The Signal Handler: sentinel files checked at the top of every
//! iteration, process signals translated into the same stop/pause
//! vocabulary, and `ALERT.txt` for situations needing operator attention.
//!
//! The handler itself only flips an `AtomicBool`, since doing I/O from
//! within a signal handler is not signal-safe; all file I/O happens from
//! the supervisor loop reading that flag between iterations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;

use nix::sys::signal::{self, SigHandler, Signal};

use crate::errors::ActionableError;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);
static INSTALL_ONCE: Once = Once::new();

extern "C" fn handle_stop_signal(_signal: libc_like::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Narrow shim so this module does not need a direct `libc` dependency
/// just for the `c_int` alias nix's handler type expects.
mod libc_like {
    pub type c_int = std::os::raw::c_int;
}

/// Installs SIGINT/SIGTERM handlers that translate the signal into the
/// same STOP condition a `STOP` sentinel file produces. Safe to call more
/// than once; only the first call installs the handler.
pub fn install() {
    INSTALL_ONCE.call_once(|| unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(handle_stop_signal));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_stop_signal));
    });
}

/// True once a SIGINT/SIGTERM has been delivered since `install()`.
pub fn stop_signaled() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct SentinelPaths {
    pub stop: PathBuf,
    pub pause: PathBuf,
    pub alert: PathBuf,
}

impl SentinelPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            stop: root.join("STOP"),
            pause: root.join("PAUSE"),
            alert: root.join("ALERT.txt"),
        }
    }
}

/// What the supervisor loop should do at the top of this iteration.
#[derive(Debug, PartialEq, Eq)]
pub enum Check {
    Proceed,
    Stop,
}

/// Checks `STOP`, the translated signal flag, and `PAUSE` (blocking,
/// polling every 5 seconds until the file disappears or STOP arrives).
pub fn check(paths: &SentinelPaths) -> Check {
    loop {
        if paths.stop.exists() || stop_signaled() {
            return Check::Stop;
        }
        if !paths.pause.exists() {
            return Check::Proceed;
        }
        std::thread::sleep(PAUSE_POLL_INTERVAL);
    }
}

/// Writes (or overwrites — this file is a current-state signal, not a log)
/// `ALERT.txt` with the cause and a suggested remediation. Clearing it is
/// the operator's responsibility.
pub fn raise_alert(paths: &SentinelPaths, cause: &str, remediation: &str) -> Result<(), ActionableError> {
    let body = format!("ALERT: {cause}\n\nSuggested remediation:\n  {remediation}\n\nRemove this file once resolved.\n");
    fs::write(&paths.alert, body)
        .map_err(|e| ActionableError::new(format!("could not write {}: {e}", paths.alert.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_proceeds_when_no_sentinels_present() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SentinelPaths::new(dir.path());
        assert_eq!(check(&paths), Check::Proceed);
    }

    #[test]
    fn check_stops_when_stop_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SentinelPaths::new(dir.path());
        fs::write(&paths.stop, "").unwrap();
        assert_eq!(check(&paths), Check::Stop);
    }

    #[test]
    fn raise_alert_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SentinelPaths::new(dir.path());
        raise_alert(&paths, "task exhausted attempts", "inspect the task and resume manually").unwrap();
        let body = fs::read_to_string(&paths.alert).unwrap();
        assert!(body.contains("task exhausted attempts"));
    }
}
