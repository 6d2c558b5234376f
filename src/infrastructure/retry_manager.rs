//! 재시도 관리자
//!
//! One retry wrapper for every retried operation in the coordinator: transient
//! extraction errors, session recreation and checkpoint/registry persistence.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Retry bound and fixed backoff (plus optional random jitter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one; 0 is treated as 1
    pub max_attempts: u32,
    pub backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            jitter: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Single attempt, no sleeping
    #[must_use]
    pub const fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        if self.max_attempts == 0 { 1 } else { self.max_attempts }
    }

    /// Delay before the next attempt
    #[must_use]
    pub fn delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.backoff;
        }
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        self.backoff + Duration::from_millis(fastrand::u64(0..=jitter_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the attempt
    /// bound is hit. `op` receives the 1-based attempt number. The last error is
    /// returned on exhaustion.
    pub fn run<T, E, F, P>(&self, mut op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "✅ Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt < attempts && is_retryable(&err) => {
                    let delay = self.delay();
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "🔄 Retrying after error: {err}"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<u32, String> = policy.run(
            |attempt| {
                calls += 1;
                if attempt < 3 { Err("timeout".into()) } else { Ok(attempt) }
            },
            |_| true,
        );
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn stops_at_bound_and_returns_last_error() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), String> = policy.run(
            |attempt| {
                calls += 1;
                Err(format!("fail {attempt}"))
            },
            |_| true,
        );
        assert_eq!(result, Err("fail 2".to_string()));
        assert_eq!(calls, 2);
    }

    #[test]
    fn non_retryable_error_is_returned_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_secs(10));
        let started = Instant::now();
        let mut calls = 0;
        let result: Result<(), &str> = policy.run(
            |_| {
                calls += 1;
                Err("fatal")
            },
            |e| *e != "fatal",
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy =
            RetryPolicy::new(3, Duration::from_millis(100)).with_jitter(Duration::from_millis(50));
        for _ in 0..50 {
            let delay = policy.delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
