//! # Shared State Management
//!
//! State shared by the workers of one pool: the pool's cancellation token and the
//! lock-free outcome counters the final [`PoolReport`] is built from.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Granularity of cancellable sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Sleep for `duration`, waking early when `cancel` fires.
///
/// Returns `false` if the sleep was cut short by cancellation.
pub fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

/// Thread-safe state shared by the workers of one pool
#[derive(Debug)]
pub struct SharedState {
    /// Child of the process-wide token; cancelling it stops only this pool
    pub cancellation_token: CancellationToken,

    pub stats: PoolStats,
}

impl SharedState {
    #[must_use]
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            cancellation_token,
            stats: PoolStats::default(),
        }
    }

    /// Requests shutdown of this pool's workers
    pub fn request_shutdown(&self) {
        self.cancellation_token.cancel();
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// Outcome counters updated by workers
#[derive(Debug, Default)]
pub struct PoolStats {
    success: AtomicU64,
    zero_result: AtomicU64,
    failed: AtomicU64,
    skipped_terminal: AtomicU64,
    rotations: AtomicU64,
    session_restarts: AtomicU64,
}

impl PoolStats {
    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zero_result(&self) {
        self.zero_result.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, count: u64) {
        self.skipped_terminal.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_restart(&self) {
        self.session_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Units that reached an outcome in this run
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
            + self.zero_result.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
    }

    /// Snapshot into a report; pool-level fields are filled in by the pool
    #[must_use]
    pub fn snapshot(&self) -> PoolReport {
        PoolReport {
            success: self.success.load(Ordering::Relaxed),
            zero_result: self.zero_result.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_terminal: self.skipped_terminal.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            session_restarts: self.session_restarts.load(Ordering::Relaxed),
            ..PoolReport::default()
        }
    }
}

/// Result of one pool run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReport {
    pub enqueued: u64,
    pub success: u64,
    pub zero_result: u64,
    pub failed: u64,
    pub skipped_terminal: u64,
    pub rotations: u64,
    pub session_restarts: u64,
    pub workers_lost: u64,
    pub interrupted: bool,
}

impl fmt::Display for PoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enqueued={} success={} zero_result={} failed={} skipped={} rotations={} session_restarts={} workers_lost={}{}",
            self.enqueued,
            self.success,
            self.zero_result,
            self.failed,
            self.skipped_terminal,
            self.rotations,
            self.session_restarts,
            self.workers_lost,
            if self.interrupted { " (interrupted)" } else { "" }
        )
    }
}
