//! Pipeline runner
//!
//! `launch` is what a scraper binary's `main` calls: it loads configuration, sets up
//! logging and signal handling, runs the pipeline and turns the outcome into an exit
//! status.
//!
//! | outcome     | exit |
//! |-------------|------|
//! | completed   | 0    |
//! | halted      | 1    |
//! | fatal error | 2    |
//! | interrupted | 130  |

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::cli::RunArgs;
use crate::application::shutdown::{
    INTERRUPTED_EXIT_CODE, ShutdownHandler, SignalListener, StopRequestWatcher,
};
use crate::crawling::orchestrator::{
    OrchestratorContext, Pipeline, PipelineOutcome, PipelineReport, StageOrchestrator, StartPoint,
};
use crate::domain::identity::IdentityPool;
use crate::domain::services::browser_session::SessionFactory;
use crate::infrastructure::config::CoordinatorConfig;
use crate::infrastructure::logging::{init_logging_with_config, log_system_info};
use crate::infrastructure::process_registry::ProcessRegistry;

/// Exit status for fatal errors (unwritable state, bad configuration)
pub const FATAL_EXIT_CODE: u8 = 2;

#[must_use]
pub const fn exit_status(outcome: &PipelineOutcome) -> u8 {
    match outcome {
        PipelineOutcome::Completed => 0,
        PipelineOutcome::Halted { .. } => 1,
        PipelineOutcome::Interrupted { .. } => INTERRUPTED_EXIT_CODE,
    }
}

/// Exit status for a finished run; any error is fatal
#[must_use]
pub fn run_exit_status(result: &Result<PipelineReport>) -> u8 {
    match result {
        Ok(report) => exit_status(&report.outcome),
        Err(_) => FATAL_EXIT_CODE,
    }
}

/// Run `pipeline` as a standalone program and return its exit status.
pub fn launch(pipeline: Pipeline, factory: Arc<dyn SessionFactory>, args: &RunArgs) -> ExitCode {
    let result = launch_inner(pipeline, factory, args);
    match &result {
        Ok(report) => println!("{report}"),
        Err(e) => {
            error!("💥 Fatal: {e:#}");
            eprintln!("fatal: {e:#}");
        }
    }
    ExitCode::from(run_exit_status(&result))
}

fn launch_inner(
    pipeline: Pipeline,
    factory: Arc<dyn SessionFactory>,
    args: &RunArgs,
) -> Result<PipelineReport> {
    let config =
        CoordinatorConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Err(e) = init_logging_with_config(&config.logging(pipeline.scraper())) {
        eprintln!("Logging setup failed, continuing without it: {e:#}");
    }
    log_system_info(pipeline.scraper());

    let shutdown = CancellationToken::new();
    let registry = Arc::new(ProcessRegistry::new(config.registry()));
    let handler = {
        let registry = Arc::clone(&registry);
        let scraper = pipeline.scraper().to_string();
        ShutdownHandler::new(shutdown.clone(), move || {
            match registry.terminate(&scraper) {
                Ok(report) => info!("Terminated registered processes: {report}"),
                Err(e) => warn!("Failed to terminate registered processes: {e}"),
            }
        })
    };
    let listener = match SignalListener::install(Arc::new(handler)) {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!("Signal handling unavailable: {e}");
            None
        }
    };

    let result = execute(
        pipeline,
        factory,
        &config,
        registry,
        args.start_point(),
        shutdown,
    );
    if let Some(listener) = listener {
        listener.stop();
    }
    result
}

/// Run the pipeline with an already loaded configuration.
///
/// Processes left registered by a previous crashed run of the same scraper are reaped
/// first; anything still registered when the pipeline ends is terminated. A supervisor
/// stop request for the scraper interrupts the run like a signal would.
pub fn execute(
    pipeline: Pipeline,
    factory: Arc<dyn SessionFactory>,
    config: &CoordinatorConfig,
    registry: Arc<ProcessRegistry>,
    start: StartPoint,
    shutdown: CancellationToken,
) -> Result<PipelineReport> {
    let scraper = pipeline.scraper().to_string();
    let stale = registry
        .terminate(&scraper)
        .context("Failed to reap processes from a previous run")?;
    if stale.terminated > 0 || stale.already_gone > 0 {
        warn!("🧟 Reaped processes left by a previous run: {stale}");
    }
    registry
        .clear_stop_request(&scraper)
        .context("Failed to clear an earlier stop request")?;
    let watcher = match StopRequestWatcher::spawn(
        Arc::clone(&registry),
        scraper.clone(),
        shutdown.clone(),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Supervisor stop requests will be ignored: {e}");
            None
        }
    };

    let identities = config.identity_pool().unwrap_or_else(IdentityPool::anonymous);
    info!(
        scraper = %scraper,
        identities = identities.len(),
        workers = config.workers,
        ?start,
        "Starting pipeline"
    );
    let orchestrator = StageOrchestrator::new(
        pipeline,
        OrchestratorContext {
            data_dir: config.data_dir(),
            pool: config.pool(),
            checkpoint_retry: config.retry_policy(),
            registry: Arc::clone(&registry),
            factory,
            identities,
            shutdown,
        },
    );
    let result = orchestrator.run(start);
    if let Some(watcher) = watcher {
        watcher.stop();
    }
    if let Err(e) = registry.clear_stop_request(&scraper) {
        warn!("Failed to clear stop request: {e}");
    }

    match registry.terminate(&scraper) {
        Ok(report) if report.terminated > 0 => warn!("Terminated leftover processes: {report}"),
        Ok(_) => {}
        Err(e) => warn!("Failed to clean up registered processes: {e}"),
    }

    let report = result.context("Pipeline failed")?;
    info!("{}", report.to_string().trim_end());
    Ok(report)
}
