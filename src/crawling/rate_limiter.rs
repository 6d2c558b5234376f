//! # Rate Limiter
//!
//! Two composed limits, both blocking the calling worker thread:
//!
//! * **Batch window**: at most `batch_limit` requests per `batch_period`, shared by all
//!   workers of a pool. The window is anchored at the request that fills it, so request
//!   `limit + 1` starts at least one full period after request `limit`. The window mutex
//!   is held while sleeping so other workers queue behind it.
//! * **Cadence**: minimum spacing between two consecutive requests of one worker (or one
//!   identity, see [`CadenceScope`]), enforced by a `governor` limiter per key.
//!
//! State is in-memory only and rebuilt fresh on restart.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::crawling::state::sleep_unless_cancelled;
use crate::domain::identity::Identity;
use crate::utils::{duration_ms, lock_or_recover};

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// What the per-request cadence is keyed on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CadenceScope {
    /// One cadence per worker thread
    #[default]
    Worker,
    /// One cadence per identity label, shared by workers presenting it
    Identity,
}

/// Rate limit settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per batch window; 0 disables the window
    pub batch_limit: u32,
    pub batch_period: Duration,
    /// Minimum spacing per cadence key; zero disables the cadence
    pub min_interval: Duration,
    pub cadence_scope: CadenceScope,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            batch_limit: 0,
            batch_period: Duration::ZERO,
            min_interval: Duration::ZERO,
            cadence_scope: CadenceScope::Worker,
        }
    }
}

#[derive(Debug)]
struct WindowState {
    count: u32,
    /// When the current window reached its limit
    filled_at: Option<Instant>,
}

/// N requests per T, shared across workers
#[derive(Debug)]
pub struct BatchWindow {
    limit: u32,
    period: Duration,
    state: Mutex<WindowState>,
}

impl BatchWindow {
    #[must_use]
    pub const fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period,
            state: Mutex::new(WindowState {
                count: 0,
                filled_at: None,
            }),
        }
    }

    /// Block until a request may proceed. Returns `false` if cancelled while waiting.
    pub fn acquire(&self, cancel: &CancellationToken) -> bool {
        let mut state = lock_or_recover(&self.state);
        if state.count >= self.limit {
            if let Some(filled_at) = state.filled_at {
                let elapsed = filled_at.elapsed();
                if elapsed < self.period {
                    let wait = self.period - elapsed;
                    debug!(wait_ms = duration_ms(wait), "⏳ Batch window full, waiting");
                    if !sleep_unless_cancelled(wait, cancel) {
                        return false;
                    }
                }
            }
            state.count = 0;
            state.filled_at = None;
        }
        state.count += 1;
        if state.count >= self.limit {
            state.filled_at = Some(Instant::now());
        }
        true
    }
}

/// Minimum spacing per key, one `governor` limiter per key
pub struct CadenceLimiter {
    quota: Quota,
    limiters: Mutex<HashMap<String, Arc<DirectLimiter>>>,
    clock: DefaultClock,
}

impl std::fmt::Debug for CadenceLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadenceLimiter")
            .field("quota", &self.quota)
            .field("keys", &lock_or_recover(&self.limiters).len())
            .finish()
    }
}

impl CadenceLimiter {
    /// `None` for a zero interval
    #[must_use]
    pub fn new(min_interval: Duration) -> Option<Self> {
        let quota = Quota::with_period(min_interval)?.allow_burst(NonZeroU32::MIN);
        Some(Self {
            quota,
            limiters: Mutex::new(HashMap::new()),
            clock: DefaultClock::default(),
        })
    }

    fn limiter_for(&self, key: &str) -> Arc<DirectLimiter> {
        let mut limiters = lock_or_recover(&self.limiters);
        Arc::clone(
            limiters
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(self.quota))),
        )
    }

    /// Block until `key` may issue its next request. Returns `false` if cancelled.
    pub fn acquire(&self, key: &str, cancel: &CancellationToken) -> bool {
        let limiter = self.limiter_for(key);
        loop {
            match limiter.check() {
                Ok(()) => return true,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    trace!(key, wait_ms = duration_ms(wait), "Cadence wait");
                    if !sleep_unless_cancelled(wait, cancel) {
                        return false;
                    }
                }
            }
        }
    }
}

/// Batch window and cadence composed
#[derive(Debug)]
pub struct RateLimiter {
    batch: Option<BatchWindow>,
    cadence: Option<CadenceLimiter>,
    scope: CadenceScope,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let batch = (config.batch_limit > 0 && !config.batch_period.is_zero())
            .then(|| BatchWindow::new(config.batch_limit, config.batch_period));
        Self {
            batch,
            cadence: CadenceLimiter::new(config.min_interval),
            scope: config.cadence_scope,
        }
    }

    /// No limits at all
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            batch: None,
            cadence: None,
            scope: CadenceScope::Worker,
        }
    }

    /// Clearance for one request by `worker_id` presenting `identity`.
    /// Returns `false` when shutdown was requested while waiting.
    pub fn acquire(&self, worker_id: usize, identity: &Identity, cancel: &CancellationToken) -> bool {
        if let Some(batch) = &self.batch {
            if !batch.acquire(cancel) {
                return false;
            }
        }
        if let Some(cadence) = &self.cadence {
            let key = match self.scope {
                CadenceScope::Worker => format!("worker-{worker_id}"),
                CadenceScope::Identity => format!("identity-{}", identity.label),
            };
            if !cadence.acquire(&key, cancel) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(label: &str) -> Identity {
        Identity {
            index: 0,
            label: label.to_string(),
            proxy: None,
        }
    }

    #[test]
    fn batch_window_gap_between_limit_and_next_request() {
        let window = BatchWindow::new(3, Duration::from_millis(150));
        let token = CancellationToken::new();
        let mut stamps = Vec::new();
        for _ in 0..4 {
            assert!(window.acquire(&token));
            stamps.push(Instant::now());
        }
        // First three go through back to back
        assert!(stamps[2] - stamps[0] < Duration::from_millis(100));
        // Request limit+1 waits a full period after request limit
        assert!(stamps[3] - stamps[2] >= Duration::from_millis(145));
    }

    #[test]
    fn batch_window_is_shared_across_threads() {
        let window = Arc::new(BatchWindow::new(2, Duration::from_millis(120)));
        let token = CancellationToken::new();
        let started = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let window = Arc::clone(&window);
                let token = token.clone();
                std::thread::spawn(move || window.acquire(&token))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn cancelled_batch_wait_returns_false() {
        let window = BatchWindow::new(1, Duration::from_secs(30));
        let token = CancellationToken::new();
        assert!(window.acquire(&token));
        token.cancel();
        assert!(!window.acquire(&token));
    }

    #[test]
    fn cadence_spaces_requests_per_key() {
        let cadence = CadenceLimiter::new(Duration::from_millis(100)).unwrap();
        let token = CancellationToken::new();

        let started = Instant::now();
        assert!(cadence.acquire("a", &token));
        assert!(cadence.acquire("b", &token));
        assert!(started.elapsed() < Duration::from_millis(80));

        assert!(cadence.acquire("a", &token));
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn zero_interval_disables_cadence() {
        assert!(CadenceLimiter::new(Duration::ZERO).is_none());
    }

    #[test]
    fn identity_scope_shares_cadence_between_workers() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            min_interval: Duration::from_millis(100),
            cadence_scope: CadenceScope::Identity,
            ..RateLimitConfig::default()
        });
        let token = CancellationToken::new();
        let started = Instant::now();
        assert!(limiter.acquire(0, &identity("shared"), &token));
        assert!(limiter.acquire(1, &identity("shared"), &token));
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let token = CancellationToken::new();
        let started = Instant::now();
        for i in 0..100 {
            assert!(limiter.acquire(i % 3, &identity("x"), &token));
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
