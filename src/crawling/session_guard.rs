//! # Session Guard
//!
//! Owns one worker's browser session. Before each unit the guard checks liveness; a
//! dead session is closed and a fresh one opened for the worker's current identity.
//! Every live session's pids are registered under the scraper's identity so `terminate`
//! can find them later. A session's pids leave the registry only after a clean close or
//! once they were killed; a session that refuses to close is reaped through the
//! registry.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::identity::Identity;
use crate::domain::services::browser_session::{BrowserSession, SessionError, SessionFactory};
use crate::infrastructure::process_registry::{ProcessRegistry, RegistryError};
use crate::infrastructure::retry_manager::RetryPolicy;

#[derive(Error, Debug)]
pub enum GuardError {
    /// No usable session after all recreation attempts; the worker exits
    #[error("browser session unavailable: {0}")]
    Unavailable(#[from] SessionError),

    /// Registry could not be updated; fatal for the run
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl GuardError {
    const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub struct SessionGuard {
    scraper: String,
    factory: Arc<dyn SessionFactory>,
    registry: Arc<ProcessRegistry>,
    retry: RetryPolicy,
    session: Option<Box<dyn BrowserSession>>,
    pids: Vec<u32>,
    restarts: u64,
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("scraper", &self.scraper)
            .field("open", &self.session.is_some())
            .field("pids", &self.pids)
            .field("restarts", &self.restarts)
            .finish_non_exhaustive()
    }
}

impl SessionGuard {
    #[must_use]
    pub fn new(
        scraper: impl Into<String>,
        factory: Arc<dyn SessionFactory>,
        registry: Arc<ProcessRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            scraper: scraper.into(),
            factory,
            registry,
            retry,
            session: None,
            pids: Vec::new(),
            restarts: 0,
        }
    }

    /// Times a dead session had to be recreated
    #[must_use]
    pub const fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Return a live session for `identity`, recreating it when it is no longer alive.
    ///
    /// The first call opens the session; that is not counted as a restart.
    pub fn ensure(
        &mut self,
        identity: &Identity,
    ) -> Result<&mut (dyn BrowserSession + 'static), GuardError> {
        let alive = self.session.as_mut().is_some_and(|session| session.is_alive());
        if !alive {
            if self.session.is_some() {
                warn!(scraper = %self.scraper, identity = %identity, "💀 Browser session died, recreating");
                self.discard()?;
                self.restarts += 1;
            }
            self.open(identity)?;
        }
        self.session
            .as_deref_mut()
            .ok_or_else(|| GuardError::Unavailable(SessionError::Unavailable("no session".into())))
    }

    /// Close the current session and open one for `identity`
    pub fn rotate(&mut self, identity: &Identity) -> Result<(), GuardError> {
        debug!(scraper = %self.scraper, identity = %identity, "Switching session identity");
        self.discard()?;
        self.open(identity)
    }

    /// Close the session and unregister its pids
    pub fn shutdown(&mut self) -> Result<(), GuardError> {
        self.discard()
    }

    fn discard(&mut self) -> Result<(), GuardError> {
        let pids = std::mem::take(&mut self.pids);
        match self.session.take() {
            Some(session) => self.release(session, &pids),
            None => Ok(()),
        }
    }

    /// Close `session`, then drop its pids from the registry. When the close fails the
    /// pids are killed instead; any that survive stay registered.
    fn release(&self, mut session: Box<dyn BrowserSession>, pids: &[u32]) -> Result<(), GuardError> {
        match session.close() {
            Ok(()) => self.registry.unregister(&self.scraper, pids)?,
            Err(e) => {
                warn!(scraper = %self.scraper, ?pids, "Browser session did not close ({e}), killing its processes");
                let report = self.registry.reap(&self.scraper, pids)?;
                if report.failed > 0 {
                    warn!(%report, "Session processes survived, left registered");
                }
            }
        }
        Ok(())
    }

    fn open(&mut self, identity: &Identity) -> Result<(), GuardError> {
        let (session, pids) = self.retry.run(
            |attempt| {
                debug!(scraper = %self.scraper, identity = %identity, attempt, "Opening browser session");
                self.open_once(identity)
            },
            GuardError::is_retryable,
        )?;
        debug!(scraper = %self.scraper, identity = %identity, ?pids, "🌐 Browser session ready");
        self.session = Some(session);
        self.pids = pids;
        Ok(())
    }

    fn open_once(
        &self,
        identity: &Identity,
    ) -> Result<(Box<dyn BrowserSession>, Vec<u32>), GuardError> {
        let mut session = self.factory.open(identity)?;
        let pids = session.pids();
        if let Err(e) = self.registry.register(&self.scraper, &pids) {
            let _ = session.close();
            return Err(e.into());
        }
        if let Err(e) = session.authenticate(identity) {
            self.release(session, &pids)?;
            return Err(e.into());
        }
        Ok((session, pids))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.discard() {
            warn!(scraper = %self.scraper, "Failed to release browser session: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    use std::collections::{HashMap, HashSet};

    use crate::infrastructure::process_registry::{ProcessControl, RegistryConfig};

    #[derive(Default)]
    struct Recorder {
        opened: AtomicU32,
        closed: AtomicU32,
        fail_opens: AtomicU32,
        reject_auth: AtomicBool,
        alive: Mutex<Vec<Arc<AtomicBool>>>,
    }

    struct FakeSession {
        pid: u32,
        alive: Arc<AtomicBool>,
        recorder: Arc<Recorder>,
    }

    impl BrowserSession for FakeSession {
        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn pids(&self) -> Vec<u32> {
            vec![self.pid]
        }

        fn authenticate(&mut self, identity: &Identity) -> Result<(), SessionError> {
            if self.recorder.reject_auth.load(Ordering::SeqCst) {
                return Err(SessionError::Authentication {
                    identity: identity.label.clone(),
                    reason: "bad password".into(),
                });
            }
            Ok(())
        }

        fn close(&mut self) -> Result<(), SessionError> {
            self.recorder.closed.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::Close("already gone".into()))
        }
    }

    struct FakeFactory(Arc<Recorder>);

    impl SessionFactory for FakeFactory {
        fn open(&self, _identity: &Identity) -> Result<Box<dyn BrowserSession>, SessionError> {
            let recorder = &self.0;
            if recorder
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SessionError::Open("driver crashed".into()));
            }
            let n = recorder.opened.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::new(AtomicBool::new(true));
            lock_alive(recorder).push(Arc::clone(&alive));
            Ok(Box::new(FakeSession {
                pid: 90_000 + n,
                alive,
                recorder: Arc::clone(recorder),
            }))
        }
    }

    /// Process table where every session pid is running until killed
    #[derive(Default)]
    struct FakeProcesses {
        killed: Mutex<HashSet<u32>>,
        unkillable: HashSet<u32>,
    }

    impl ProcessControl for Arc<FakeProcesses> {
        fn live_processes(&self) -> HashMap<u32, Option<u32>> {
            let killed = self.killed.lock().unwrap();
            (90_000..90_010)
                .filter(|pid| !killed.contains(pid))
                .map(|pid| (pid, None))
                .collect()
        }

        fn kill(&self, pid: u32) -> bool {
            if self.unkillable.contains(&pid) {
                return false;
            }
            self.killed.lock().unwrap().insert(pid);
            true
        }
    }

    fn lock_alive(recorder: &Recorder) -> std::sync::MutexGuard<'_, Vec<Arc<AtomicBool>>> {
        recorder.alive.lock().unwrap()
    }

    fn identity(label: &str) -> Identity {
        Identity {
            index: 0,
            label: label.to_string(),
            proxy: None,
        }
    }

    fn guard(dir: &TempDir, recorder: &Arc<Recorder>) -> (SessionGuard, Arc<ProcessRegistry>) {
        guard_with(dir, recorder, Arc::new(FakeProcesses::default()))
    }

    fn guard_with(
        dir: &TempDir,
        recorder: &Arc<Recorder>,
        processes: Arc<FakeProcesses>,
    ) -> (SessionGuard, Arc<ProcessRegistry>) {
        let registry = Arc::new(ProcessRegistry::with_process_control(
            RegistryConfig::under(dir.path()),
            Box::new(processes),
        ));
        let guard = SessionGuard::new(
            "acme",
            Arc::new(FakeFactory(Arc::clone(recorder))),
            Arc::clone(&registry),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        (guard, registry)
    }

    #[test]
    fn first_ensure_opens_and_registers() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let (mut guard, registry) = guard(&dir, &recorder);

        assert!(guard.ensure(&identity("a")).unwrap().is_alive());
        guard.ensure(&identity("a")).unwrap();

        assert_eq!(recorder.opened.load(Ordering::SeqCst), 1);
        assert_eq!(guard.restarts(), 0);
        assert_eq!(registry.pids_for("acme").unwrap().into_iter().collect::<Vec<_>>(), vec![90_000]);
    }

    #[test]
    fn dead_session_is_replaced_and_pids_swapped() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let (mut guard, registry) = guard(&dir, &recorder);

        guard.ensure(&identity("a")).unwrap();
        lock_alive(&recorder)[0].store(false, Ordering::SeqCst);
        guard.ensure(&identity("a")).unwrap();

        assert_eq!(recorder.opened.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert_eq!(guard.restarts(), 1);
        assert_eq!(registry.pids_for("acme").unwrap().into_iter().collect::<Vec<_>>(), vec![90_001]);
    }

    #[test]
    fn open_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        recorder.fail_opens.store(2, Ordering::SeqCst);
        let (mut guard, _registry) = guard(&dir, &recorder);

        assert!(guard.ensure(&identity("a")).is_ok());
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_recreation_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        recorder.fail_opens.store(10, Ordering::SeqCst);
        let (mut guard, registry) = guard(&dir, &recorder);

        let err = guard.ensure(&identity("a")).err().unwrap();
        assert!(matches!(err, GuardError::Unavailable(SessionError::Open(_))));
        assert!(registry.pids_for("acme").unwrap().is_empty());
    }

    #[test]
    fn rejected_authentication_closes_and_unregisters() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        recorder.reject_auth.store(true, Ordering::SeqCst);
        let (mut guard, registry) = guard(&dir, &recorder);

        let err = guard.ensure(&identity("a")).err().unwrap();
        assert!(matches!(
            err,
            GuardError::Unavailable(SessionError::Authentication { .. })
        ));
        assert_eq!(recorder.opened.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 3);
        assert!(registry.pids_for("acme").unwrap().is_empty());
    }

    #[test]
    fn rotate_and_drop_release_pids() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let (mut guard, registry) = guard(&dir, &recorder);

        guard.ensure(&identity("a")).unwrap();
        guard.rotate(&identity("b")).unwrap();
        assert_eq!(guard.restarts(), 0);
        assert_eq!(registry.pids_for("acme").unwrap().into_iter().collect::<Vec<_>>(), vec![90_001]);

        drop(guard);
        assert!(registry.pids_for("acme").unwrap().is_empty());
        assert!(!registry.entry_path("acme").exists());
    }

    #[test]
    fn unclosable_session_is_killed_before_its_pids_leave_the_registry() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let processes = Arc::new(FakeProcesses::default());
        let (mut guard, registry) = guard_with(&dir, &recorder, Arc::clone(&processes));

        guard.ensure(&identity("a")).unwrap();
        lock_alive(&recorder)[0].store(false, Ordering::SeqCst);
        guard.ensure(&identity("a")).unwrap();

        assert!(processes.killed.lock().unwrap().contains(&90_000));
        assert_eq!(registry.pids_for("acme").unwrap().into_iter().collect::<Vec<_>>(), vec![90_001]);
    }

    #[test]
    fn surviving_pids_stay_registered_for_terminate() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut processes = FakeProcesses::default();
        processes.unkillable.insert(90_000);
        let (mut guard, registry) = guard_with(&dir, &recorder, Arc::new(processes));

        guard.ensure(&identity("a")).unwrap();
        lock_alive(&recorder)[0].store(false, Ordering::SeqCst);
        guard.ensure(&identity("a")).unwrap();

        assert_eq!(
            registry.pids_for("acme").unwrap().into_iter().collect::<Vec<_>>(),
            vec![90_000, 90_001]
        );
        drop(guard);
        let report = registry.terminate("acme").unwrap();
        assert_eq!(report.failed, 1);
    }
}
