//! # Worker Pool
//!
//! Fixed-size set of OS-thread workers draining one bounded queue for a stage. Each
//! worker owns its identity cursor and browser session; the checkpoint store, rate
//! limiter, registry and extractor are shared.
//!
//! Per unit a worker: skips it when already terminal, rotates identity when the search
//! threshold is reached, waits for rate clearance, makes sure its session is alive,
//! extracts (retrying transient failures in place, rotating once on a block) and records
//! the outcome in the checkpoint.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::crawling::queues::{FeedStop, QueueConfig, QueueError, WorkConsumer, bounded};
use crate::crawling::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::crawling::session_guard::{GuardError, SessionGuard};
use crate::crawling::state::SharedState;
use crate::domain::identity::{IdentityCursor, IdentityPool};
use crate::domain::services::browser_session::SessionFactory;
use crate::domain::services::extractor::{ExtractionError, ExtractionOutcome, Extractor};
use crate::domain::work_unit::WorkKey;
use crate::infrastructure::checkpoint_store::{CheckpointError, CheckpointStore};
use crate::infrastructure::config::defaults;
use crate::infrastructure::process_registry::{ProcessRegistry, RegistryError};
use crate::infrastructure::retry_manager::RetryPolicy;

pub use crate::crawling::state::PoolReport;

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub dequeue_timeout: Duration,
    /// Searches per identity before rotating; 0 disables count-based rotation
    pub rotation_threshold: u32,
    pub rate_limit: RateLimitConfig,
    /// Transient extraction retries
    pub retry: RetryPolicy,
    /// Session recreation attempts
    pub session_retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: defaults::WORKERS,
            queue_capacity: defaults::QUEUE_CAPACITY,
            dequeue_timeout: Duration::from_millis(defaults::DEQUEUE_TIMEOUT_MS),
            rotation_threshold: defaults::ROTATION_THRESHOLD,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            session_retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators shared by every worker of a pool
pub struct PoolDependencies {
    pub scraper: String,
    pub checkpoint: Arc<CheckpointStore>,
    pub registry: Arc<ProcessRegistry>,
    pub factory: Arc<dyn SessionFactory>,
    pub extractor: Arc<dyn Extractor>,
    pub identities: IdentityPool,
}

impl std::fmt::Debug for PoolDependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDependencies")
            .field("scraper", &self.scraper)
            .field("checkpoint", &self.checkpoint.path())
            .field("identities", &self.identities.len())
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("all {lost} workers were lost")]
    NoWorkersLeft { lost: usize },
}

impl PoolError {
    /// Checkpoint or registry state could not be written; the run cannot continue
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Checkpoint(_) | Self::Registry(_))
    }
}

/// How a worker thread ended
#[derive(Debug)]
enum WorkerExit {
    /// Queue closed and drained
    Drained,
    /// Shutdown requested
    Cancelled,
    /// No session could be obtained
    Lost(String),
    Fatal(PoolError),
}

/// One extraction attempt that did not produce an outcome to record
#[derive(Error, Debug)]
enum AttemptError {
    #[error("{0}")]
    Transient(ExtractionError),

    #[error(transparent)]
    Session(GuardError),
}

struct Worker {
    id: usize,
    deps: Arc<PoolDependencies>,
    state: Arc<SharedState>,
    limiter: Arc<RateLimiter>,
    consumer: WorkConsumer,
    cursor: IdentityCursor,
    guard: SessionGuard,
    rotation_threshold: u32,
    retry: RetryPolicy,
}

impl Worker {
    fn run(mut self) -> WorkerExit {
        info!(
            scraper = %self.deps.scraper,
            worker = self.id,
            identity = %self.cursor.current(),
            "👷 Worker started"
        );
        let exit = match (self.drain(), self.guard.shutdown()) {
            (WorkerExit::Fatal(err), _) => WorkerExit::Fatal(err),
            (_, Err(GuardError::Registry(err))) => WorkerExit::Fatal(PoolError::Registry(err)),
            (exit, _) => exit,
        };
        if matches!(exit, WorkerExit::Fatal(_)) {
            self.state.request_shutdown();
        }
        debug!(worker = self.id, ?exit, "Worker finished");
        exit
    }

    fn drain(&mut self) -> WorkerExit {
        loop {
            if self.state.is_shutdown_requested() {
                return WorkerExit::Cancelled;
            }
            let key = match self.consumer.dequeue() {
                Ok(key) => key,
                Err(QueueError::Timeout) => continue,
                Err(QueueError::Closed) => return WorkerExit::Drained,
            };
            if let Err(exit) = self.process(&key) {
                return exit;
            }
        }
    }

    fn process(&mut self, key: &WorkKey) -> Result<(), WorkerExit> {
        let checkpoint = Arc::clone(&self.deps.checkpoint);
        if checkpoint.is_terminal(key) {
            trace!(worker = self.id, key = %key, "Skipping terminal unit");
            self.state.stats.record_skipped(1);
            return Ok(());
        }

        if self.cursor.threshold_reached(self.rotation_threshold) {
            self.rotate("search threshold reached")?;
        }
        self.clearance()?;

        if !checkpoint.mark_in_progress(key).map_err(fatal)? {
            self.state.stats.record_skipped(1);
            return Ok(());
        }

        let restarts_before = self.guard.restarts();
        let mut outcome = self.extract(key)?;
        if let ExtractionOutcome::Failed(err) = &outcome {
            if err.is_blocked() {
                warn!(
                    worker = self.id,
                    key = %key,
                    identity = %self.cursor.current(),
                    "🚫 Blocked: {err}"
                );
                self.rotate("blocked")
                    .map_err(|exit| self.abandon(key, exit))?;
                self.clearance()?;
                outcome = self.extract(key)?;
            }
        }
        for _ in restarts_before..self.guard.restarts() {
            self.state.stats.record_session_restart();
        }

        self.record(key, outcome)
    }

    /// Wait for the rate limiter; cancellation ends the worker
    fn clearance(&self) -> Result<(), WorkerExit> {
        if self
            .limiter
            .acquire(self.id, self.cursor.current(), &self.state.cancellation_token)
        {
            Ok(())
        } else {
            Err(WorkerExit::Cancelled)
        }
    }

    /// Extract with transient retries on the same identity and session
    fn extract(&mut self, key: &WorkKey) -> Result<ExtractionOutcome, WorkerExit> {
        let retry = self.retry;
        let result = retry.run(
            |attempt| {
                let identity = self.cursor.current().clone();
                let session = self.guard.ensure(&identity).map_err(AttemptError::Session)?;
                self.cursor.record_search();
                trace!(worker = self.id, key = %key, identity = %identity, attempt, "Extracting");
                match self.deps.extractor.extract(key, session, &identity) {
                    ExtractionOutcome::Failed(err) if err.is_transient() => {
                        Err(AttemptError::Transient(err))
                    }
                    outcome => Ok(outcome),
                }
            },
            |err| matches!(err, AttemptError::Transient(_)),
        );

        match result {
            Ok(outcome) => Ok(outcome),
            Err(AttemptError::Transient(err)) => Ok(ExtractionOutcome::Failed(err)),
            Err(AttemptError::Session(err)) => {
                let exit = self.guard_exit(err);
                Err(self.abandon(key, exit))
            }
        }
    }

    /// A worker leaving without a session records the unit it was holding as failed
    fn abandon(&self, key: &WorkKey, exit: WorkerExit) -> WorkerExit {
        let WorkerExit::Lost(reason) = &exit else {
            return exit;
        };
        if let Err(err) = self.deps.checkpoint.mark_failed(key, reason) {
            return fatal(err);
        }
        self.state.stats.record_failure();
        exit
    }

    fn rotate(&mut self, reason: &str) -> Result<(), WorkerExit> {
        let previous = self.cursor.current().label.clone();
        let next = self.cursor.advance().clone();
        info!(
            worker = self.id,
            from = %previous,
            to = %next,
            reason,
            "🔁 Rotating identity"
        );
        self.state.stats.record_rotation();
        self.guard.rotate(&next).map_err(|err| self.guard_exit(err))
    }

    fn guard_exit(&self, err: GuardError) -> WorkerExit {
        match err {
            GuardError::Unavailable(err) => {
                error!(worker = self.id, "❌ Worker giving up, no browser session: {err}");
                WorkerExit::Lost(err.to_string())
            }
            GuardError::Registry(err) => WorkerExit::Fatal(PoolError::Registry(err)),
        }
    }

    fn record(&self, key: &WorkKey, outcome: ExtractionOutcome) -> Result<(), WorkerExit> {
        let checkpoint = &self.deps.checkpoint;
        let stats = &self.state.stats;
        match outcome {
            ExtractionOutcome::Success { counts } => {
                checkpoint.mark_success(key, counts).map_err(fatal)?;
                stats.record_success();
                debug!(worker = self.id, key = %key, "✅ Unit done");
            }
            ExtractionOutcome::ZeroResult { reason } => {
                checkpoint.mark_zero_result(key, &reason).map_err(fatal)?;
                stats.record_zero_result();
                debug!(worker = self.id, key = %key, reason, "Unit has no results");
            }
            ExtractionOutcome::Failed(err) => {
                warn!(worker = self.id, key = %key, "⚠️ Unit failed: {err}");
                checkpoint.mark_failed(key, &err.to_string()).map_err(fatal)?;
                stats.record_failure();
            }
        }
        Ok(())
    }
}

fn fatal(err: CheckpointError) -> WorkerExit {
    error!("💥 Checkpoint write failed: {err}");
    WorkerExit::Fatal(PoolError::Checkpoint(err))
}

/// Runs one stage's units across a fixed set of worker threads
#[derive(Debug)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    deps: Arc<PoolDependencies>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// `shutdown` is the process-wide token; the pool works on a child of it.
    #[must_use]
    pub fn new(config: WorkerPoolConfig, deps: PoolDependencies, shutdown: CancellationToken) -> Self {
        Self {
            config,
            deps: Arc::new(deps),
            shutdown,
        }
    }

    /// Process every non-terminal key of `keys` and block until the pool is done.
    ///
    /// Units that fail are recorded and do not fail the pool. The pool fails when the
    /// checkpoint or registry cannot be written, or when every worker was lost.
    pub fn run(&self, keys: &[WorkKey]) -> Result<PoolReport, PoolError> {
        let scraper = self.deps.scraper.clone();
        let pending = self.deps.checkpoint.pending(keys);
        let distinct = keys.iter().map(WorkKey::as_str).collect::<HashSet<_>>().len();

        let state = Arc::new(SharedState::new(self.shutdown.child_token()));
        state
            .stats
            .record_skipped((distinct.saturating_sub(pending.len())) as u64);

        if pending.is_empty() {
            info!(scraper = %scraper, skipped = distinct, "Nothing left to do");
            let mut report = state.stats.snapshot();
            report.interrupted = self.shutdown.is_cancelled();
            return Ok(report);
        }

        let workers = self.config.workers.max(1);
        info!(
            scraper = %scraper,
            workers,
            pending = pending.len(),
            skipped = distinct - pending.len(),
            "🚀 Starting worker pool"
        );

        let (producer, consumer) = bounded(&QueueConfig {
            max_capacity: self.config.queue_capacity,
            dequeue_timeout: self.config.dequeue_timeout,
        });
        let limiter = Arc::new(RateLimiter::new(&self.config.rate_limit));

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker = Worker {
                id,
                deps: Arc::clone(&self.deps),
                state: Arc::clone(&state),
                limiter: Arc::clone(&limiter),
                consumer: consumer.clone(),
                cursor: self.deps.identities.cursor_for_worker(id),
                guard: SessionGuard::new(
                    scraper.clone(),
                    Arc::clone(&self.deps.factory),
                    Arc::clone(&self.deps.registry),
                    self.config.session_retry,
                ),
                rotation_threshold: self.config.rotation_threshold,
                retry: self.config.retry,
            };
            let spawned = thread::Builder::new()
                .name(format!("{scraper}-worker-{id}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    error!(worker = id, "Failed to spawn worker thread: {err}");
                    state.request_shutdown();
                    drop(consumer);
                    join_workers(handles);
                    return Err(PoolError::Spawn(err));
                }
            }
        }
        drop(consumer);

        let feed_token = state.cancellation_token.clone();
        let feeder = match thread::Builder::new()
            .name(format!("{scraper}-producer"))
            .spawn(move || producer.feed(pending, &feed_token))
        {
            Ok(handle) => handle,
            Err(err) => {
                state.request_shutdown();
                join_workers(handles);
                return Err(PoolError::Spawn(err));
            }
        };

        let (lost, fatal) = join_workers(handles);
        let (enqueued, stop) = feeder
            .join()
            .unwrap_or((0, FeedStop::Disconnected));
        debug!(scraper = %scraper, enqueued, ?stop, "Producer finished");

        let mut report = state.stats.snapshot();
        report.enqueued = enqueued as u64;
        report.workers_lost = lost as u64;
        report.interrupted = self.shutdown.is_cancelled();

        if let Some(err) = fatal {
            error!(scraper = %scraper, %report, "💥 Pool stopped on fatal error");
            return Err(err);
        }
        if lost >= workers {
            error!(scraper = %scraper, %report, "💥 Every worker was lost");
            return Err(PoolError::NoWorkersLeft { lost });
        }
        info!(scraper = %scraper, %report, "🏁 Worker pool finished");
        Ok(report)
    }
}

/// Join worker threads; returns the number lost and the first fatal error
fn join_workers(handles: Vec<JoinHandle<WorkerExit>>) -> (usize, Option<PoolError>) {
    let mut lost = 0;
    let mut fatal = None;
    for handle in handles {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        match handle.join() {
            Ok(WorkerExit::Drained | WorkerExit::Cancelled) => {}
            Ok(WorkerExit::Lost(reason)) => {
                warn!(thread = %name, reason, "Worker lost");
                lost += 1;
            }
            Ok(WorkerExit::Fatal(err)) => {
                if fatal.is_none() {
                    fatal = Some(err);
                }
            }
            Err(_) => {
                error!(thread = %name, "💥 Worker thread panicked");
                lost += 1;
            }
        }
    }
    (lost, fatal)
}
