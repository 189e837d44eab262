//! Monotonic wall-clock timestamps and collision-resistant identifiers.
//!
//! Dual-clock design borrowed from the lease model this supervisor's claim
//! protocol descends from: a `std::time::Instant` for expiry arithmetic
//! that is immune to NTP adjustments and system clock jumps, paired with a
//! `chrono::DateTime<Utc>` for the human-readable, persisted timestamp.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Current UTC time. The sole source of truth for all persisted timestamps;
/// callers should never call `chrono::Utc::now()` directly so that commit
/// timestamps are always produced at commit time, not at the start of a
/// `mutate` closure.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// A fresh `run-<YYYYMMDD-HHMMSS>-<6 hex>` identifier. The random suffix
/// makes collisions within the same second negligible without requiring a
/// shared counter.
pub fn new_run_id() -> String {
    let now = now_utc();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| {
            let digit = rng.gen_range(0..16);
            std::char::from_digit(digit, 16).unwrap()
        })
        .collect();
    format!("run-{}-{}", now.format("%Y%m%d-%H%M%S"), suffix)
}

static SUPERVISOR_ID: OnceLock<String> = OnceLock::new();

/// Stable identifier for this supervisor process: pid, start epoch, and a
/// random suffix, so that two supervisors started in the same second on
/// the same host are still distinguishable.
pub fn supervisor_id() -> &'static str {
    SUPERVISOR_ID.get_or_init(|| {
        let pid = std::process::id();
        let epoch = now_utc().timestamp();
        let suffix = uuid::Uuid::new_v4();
        format!("supervisor-{pid}-{epoch}-{suffix}")
    })
}

/// A monotonic deadline with an approximate wall-clock mirror.
///
/// `instant` is authoritative for "has this expired" checks made within the
/// lifetime of a single process. When a deadline is reconstructed from a
/// freshly loaded `TaskFile` (a new process, or after a restart), there is
/// no `Instant` to recover, so `from_wall_clock` reconstructs one
/// conservatively from the elapsed wall-clock time between `reference` and
/// now — this can only ever make a deadline look more, not less, expired
/// than it truly is relative to when it was set, which is the safe
/// direction to err for a lease.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    wall_clock: DateTime<Utc>,
    instant: Option<Instant>,
}

impl Deadline {
    /// A fresh deadline `ttl_seconds` from now, with both clocks anchored
    /// to this process's notion of "now".
    pub fn from_now(ttl_seconds: u64) -> Self {
        Self {
            wall_clock: now_utc() + chrono::Duration::seconds(ttl_seconds as i64),
            instant: Some(Instant::now() + std::time::Duration::from_secs(ttl_seconds)),
        }
    }

    /// Reconstructs a deadline from a persisted wall-clock timestamp,
    /// approximating the monotonic instant as `now + (deadline - now)`.
    pub fn from_wall_clock(wall_clock: DateTime<Utc>) -> Self {
        let now = now_utc();
        let remaining_secs = (wall_clock - now).num_seconds();
        let instant = if remaining_secs > 0 {
            Instant::now().checked_add(std::time::Duration::from_secs(remaining_secs as u64))
        } else {
            Some(Instant::now())
        };
        Self {
            wall_clock,
            instant,
        }
    }

    pub fn wall_clock(&self) -> DateTime<Utc> {
        self.wall_clock
    }

    /// True once the deadline has passed. `lease_expires_at == now` counts
    /// as expired per the spec's boundary behavior.
    pub fn is_expired(&self) -> bool {
        match self.instant {
            Some(instant) => Instant::now() >= instant,
            None => now_utc() >= self.wall_clock,
        }
    }
}

/// A simple process-local monotone counter, exposed for callers (e.g.
/// the progress log) that want strictly increasing sequence numbers
/// without relying on the wall clock for ordering.
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
