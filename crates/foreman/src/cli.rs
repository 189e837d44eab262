//! The command-line surface.
//!
//! A `clap`-derive struct with one subcommand-shaped flag set per
//! operating mode, and a small fixed exit-code contract the caller (a
//! cron entry, CI step, or a human) can script against instead of parsing
//! stdout.

use std::path::PathBuf;

use clap::Parser;

/// Durable task supervisor for long-running agent workers.
#[derive(Debug, Parser)]
#[command(name = "foreman", version, about)]
pub struct Cli {
    /// Project root containing Task.json; defaults to the current directory
    /// or the `PROJECT_ROOT` environment variable if set.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Print the rendered status board to stdout instead of running a turn.
    #[arg(long)]
    pub status: bool,

    /// Report what would happen (which task would be claimed) without
    /// mutating Task.json or spawning a worker.
    #[arg(long)]
    pub dry_run: bool,

    /// Sweep expired leases back to pending/blocked, then exit.
    #[arg(long)]
    pub reclaim: bool,

    /// Run continuously instead of a single turn.
    #[arg(long)]
    pub r#loop: bool,

    /// Run at most this many turns (combine with `--loop`, or standalone to
    /// run more than one turn without looping forever).
    #[arg(long)]
    pub count: Option<u32>,

    /// Alias for `--count`.
    #[arg(long)]
    pub max_turns: Option<u32>,

    /// Per-worker-invocation timeout in seconds, overriding `foreman.toml`.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Lease TTL in seconds, overriding `foreman.toml`.
    #[arg(long)]
    pub lease_ttl: Option<u64>,

    /// Process a single intake document immediately.
    #[arg(long)]
    pub intake: Option<PathBuf>,

    /// Poll this directory for intake documents (combine with `--loop`).
    #[arg(long)]
    pub watch_inbox: Option<PathBuf>,

    /// Re-render `status.md` without running a turn.
    #[arg(long)]
    pub report: bool,

    /// Run the retention sweep without running a turn.
    #[arg(long)]
    pub cleanup: bool,
}

/// Fixed exit codes, scriptable without parsing stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Turn(s) completed, or a read-only query (`--status`/`--report`)
    /// succeeded.
    Ok = 0,
    /// An operational error prevented the turn from completing (lock
    /// contention timeout, malformed Task.json, intake validation failure).
    RuntimeError = 1,
    /// Invalid invocation (bad flag combination, missing project root).
    UsageError = 2,
    /// A task transitioned to `blocked` during this invocation.
    BlockedTaskEncountered = 3,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_invocation() {
        let cli = Cli::parse_from(["foreman"]);
        assert!(!cli.status);
        assert!(!cli.r#loop);
    }

    #[test]
    fn parses_loop_with_count() {
        let cli = Cli::parse_from(["foreman", "--loop", "--count", "5"]);
        assert!(cli.r#loop);
        assert_eq!(cli.count, Some(5));
    }

    #[test]
    fn exit_code_values_match_contract() {
        assert_eq!(ExitCode::Ok.code(), 0);
        assert_eq!(ExitCode::RuntimeError.code(), 1);
        assert_eq!(ExitCode::UsageError.code(), 2);
        assert_eq!(ExitCode::BlockedTaskEncountered.code(), 3);
    }
}
