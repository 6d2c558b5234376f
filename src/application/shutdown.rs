//! Signal handling
//!
//! Interrupt and terminate signals are received on a dedicated listener thread running
//! a current-thread tokio runtime. The first signal cancels the run token and runs the
//! first-signal hook (terminating the scraper's registered browser processes); a second
//! signal within [`FORCE_EXIT_WINDOW`] exits immediately.
//!
//! A supervisor in another process stops a run by leaving a stop request in the process
//! registry; [`StopRequestWatcher`] polls for it and cancels the run token.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crawling::state::sleep_unless_cancelled;
use crate::infrastructure::process_registry::ProcessRegistry;
use crate::utils::lock_or_recover;

/// Time window where a second signal forces immediate exit.
pub const FORCE_EXIT_WINDOW: Duration = Duration::from_secs(3);

/// Exit status used for runs stopped by a signal
pub const INTERRUPTED_EXIT_CODE: u8 = 130;

/// How often a running pipeline checks for a supervisor stop request
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// First signal: graceful shutdown started
    Graceful,
    /// Repeated signal outside the force window
    Ignored,
    ForceExit,
}

type FirstSignalHook = Box<dyn Fn() + Send + Sync>;

/// Signal state machine, independent of how signals are delivered
pub struct ShutdownHandler {
    token: CancellationToken,
    first_signal_at: Mutex<Option<Instant>>,
    on_first: FirstSignalHook,
}

impl std::fmt::Debug for ShutdownHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandler")
            .field("cancelled", &self.token.is_cancelled())
            .field("first_signal_at", &*lock_or_recover(&self.first_signal_at))
            .finish_non_exhaustive()
    }
}

impl ShutdownHandler {
    pub fn new(token: CancellationToken, on_first: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            token,
            first_signal_at: Mutex::new(None),
            on_first: Box::new(on_first),
        }
    }

    pub fn handle(&self, signal: ShutdownSignal) -> ShutdownAction {
        self.handle_at(signal, Instant::now())
    }

    fn handle_at(&self, signal: ShutdownSignal, now: Instant) -> ShutdownAction {
        let mut first = lock_or_recover(&self.first_signal_at);
        match *first {
            None => {
                *first = Some(now);
                drop(first);
                info!(?signal, "🛑 Shutdown requested, finishing in-flight units");
                self.token.cancel();
                (self.on_first)();
                ShutdownAction::Graceful
            }
            Some(at) if now.saturating_duration_since(at) <= FORCE_EXIT_WINDOW => {
                warn!(?signal, "Second signal within window, forcing exit");
                ShutdownAction::ForceExit
            }
            Some(_) => {
                *first = Some(now);
                debug!(?signal, "Signal outside force-exit window; still shutting down");
                ShutdownAction::Ignored
            }
        }
    }
}

/// Background thread delivering OS signals to a [`ShutdownHandler`]
#[derive(Debug)]
pub struct SignalListener {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    /// Start listening. Returns once the signal handlers are registered.
    pub fn install(handler: Arc<ShutdownHandler>) -> io::Result<Self> {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread = thread::Builder::new()
            .name("signal-listener".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(listen(&handler, stop_rx, &ready_tx));
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(io::Error::other("signal listener exited during startup")),
        }
    }

    /// Stop listening and join the thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Signal listener thread panicked");
            }
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background thread cancelling the run token once a stop request shows up
#[derive(Debug)]
pub struct StopRequestWatcher {
    done: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl StopRequestWatcher {
    pub fn spawn(
        registry: Arc<ProcessRegistry>,
        scraper: String,
        token: CancellationToken,
    ) -> io::Result<Self> {
        let done = CancellationToken::new();
        let finished = done.clone();
        let thread = thread::Builder::new()
            .name(format!("{scraper}-stop-watch"))
            .spawn(move || {
                while !token.is_cancelled() {
                    if registry.stop_requested(&scraper) {
                        info!(scraper = %scraper, "🛑 Stop requested by supervisor, finishing in-flight units");
                        token.cancel();
                        return;
                    }
                    if !sleep_unless_cancelled(STOP_POLL_INTERVAL, &finished) {
                        return;
                    }
                }
            })?;
        Ok(Self {
            done,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.done.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Stop request watcher panicked");
            }
        }
    }
}

impl Drop for StopRequestWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn listen(
    handler: &ShutdownHandler,
    mut stop: oneshot::Receiver<()>,
    ready: &std::sync::mpsc::Sender<io::Result<()>>,
) {
    #[cfg(unix)]
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
    let _ = ready.send(Ok(()));
    debug!("Signal listener ready");

    loop {
        #[cfg(unix)]
        let signal = tokio::select! {
            _ = &mut stop => return,
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => ShutdownSignal::Interrupt,
                Err(e) => {
                    warn!("Failed to listen for Ctrl-C: {e}");
                    return;
                }
            },
            _ = terminate.recv() => ShutdownSignal::Terminate,
        };
        #[cfg(not(unix))]
        let signal = tokio::select! {
            _ = &mut stop => return,
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => ShutdownSignal::Interrupt,
                Err(e) => {
                    warn!("Failed to listen for Ctrl-C: {e}");
                    return;
                }
            },
        };

        if handler.handle(signal) == ShutdownAction::ForceExit {
            std::process::exit(i32::from(INTERRUPTED_EXIT_CODE));
        }
    }
}
