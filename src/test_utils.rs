//! Test utilities for scrape-coordinator
//!
//! In-memory stand-ins for the browser adapter and the extractor so pools and pipelines
//! can be exercised without a browser. Used by unit tests, integration tests and the
//! benches.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::domain::identity::Identity;
use crate::domain::services::browser_session::{BrowserSession, SessionError, SessionFactory};
use crate::domain::services::extractor::{ExtractionOutcome, Extractor};
use crate::domain::work_unit::WorkKey;
use crate::utils::lock_or_recover;

/// Pids handed out by [`StubFactory`]; high enough not to collide with live processes
pub const STUB_PID_BASE: u32 = 3_900_000;

/// Session that is alive until its factory says otherwise
#[derive(Debug)]
pub struct StubSession {
    pid: u32,
    alive: Arc<AtomicBool>,
}

impl BrowserSession for StubSession {
    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pids(&self) -> Vec<u32> {
        vec![self.pid]
    }

    fn authenticate(&mut self, _identity: &Identity) -> Result<(), SessionError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory counting opens, optionally failing the next `n` of them
#[derive(Debug, Default)]
pub struct StubFactory {
    opened: AtomicU32,
    fail_opens: AtomicU32,
    sessions: Mutex<Vec<Arc<AtomicBool>>>,
}

impl StubFactory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every open fails
    #[must_use]
    pub fn broken() -> Arc<Self> {
        let factory = Self::default();
        factory.fail_opens.store(u32::MAX, Ordering::SeqCst);
        Arc::new(factory)
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    /// Sessions successfully opened so far
    #[must_use]
    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Make every open session report itself dead on the next liveness check
    pub fn kill_sessions(&self) {
        for alive in lock_or_recover(&self.sessions).iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

impl SessionFactory for StubFactory {
    fn open(&self, _identity: &Identity) -> Result<Box<dyn BrowserSession>, SessionError> {
        if self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SessionError::Open("stub driver refused to start".into()));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        lock_or_recover(&self.sessions).push(Arc::clone(&alive));
        Ok(Box::new(StubSession {
            pid: STUB_PID_BASE + n,
            alive,
        }))
    }
}

/// One recorded extractor call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractCall {
    pub key: String,
    pub identity: String,
}

/// Extractor with a deterministic default and optional per-key scripts.
///
/// Unscripted keys ending in `0` are zero-result, everything else succeeds with one
/// `items` count. Scripted outcomes are consumed in order before falling back.
#[derive(Debug, Default)]
pub struct ScriptedExtractor {
    scripts: Mutex<HashMap<String, VecDeque<ExtractionOutcome>>>,
    calls: Mutex<Vec<ExtractCall>>,
    count: AtomicUsize,
    delay: Duration,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Cancel `token` once `calls` extractions have finished
    #[must_use]
    pub fn cancel_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    #[must_use]
    pub fn script(self, key: &str, outcomes: impl IntoIterator<Item = ExtractionOutcome>) -> Self {
        lock_or_recover(&self.scripts)
            .entry(key.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Total extract calls
    #[must_use]
    pub fn calls(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn call_log(&self) -> Vec<ExtractCall> {
        lock_or_recover(&self.calls).clone()
    }

    /// Identities that presented `key`, in call order
    #[must_use]
    pub fn identities_for(&self, key: &str) -> Vec<String> {
        lock_or_recover(&self.calls)
            .iter()
            .filter(|call| call.key == key)
            .map(|call| call.identity.clone())
            .collect()
    }

    fn default_outcome(key: &WorkKey) -> ExtractionOutcome {
        if key.as_str().ends_with('0') {
            ExtractionOutcome::ZeroResult {
                reason: "no results".into(),
            }
        } else {
            ExtractionOutcome::success_with("items", 1)
        }
    }
}

impl Extractor for ScriptedExtractor {
    fn extract(
        &self,
        key: &WorkKey,
        _session: &mut dyn BrowserSession,
        identity: &Identity,
    ) -> ExtractionOutcome {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        lock_or_recover(&self.calls).push(ExtractCall {
            key: key.as_str().to_string(),
            identity: identity.label.clone(),
        });
        let outcome = lock_or_recover(&self.scripts)
            .get_mut(key.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Self::default_outcome(key));

        let done = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if done >= *limit {
                token.cancel();
            }
        }
        outcome
    }
}

/// `count` keys named `key-0 .. key-{count-1}`
#[must_use]
pub fn numbered_keys(count: usize) -> Vec<WorkKey> {
    (0..count).map(|i| WorkKey::new(format!("key-{i}"))).collect()
}
