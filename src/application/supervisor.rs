//! Supervisor commands run from a separate process: status, stop and reset.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use tracing::info;

use crate::infrastructure::checkpoint_store::{list_checkpoints, read_checkpoint, remove_checkpoints, summarize};
use crate::infrastructure::config::CoordinatorConfig;
use crate::infrastructure::process_registry::{ProcessRegistry, TerminateReport};

/// Per-stage progress plus the scraper's registered pids, as printable text
pub fn status(config: &CoordinatorConfig, scraper: &str) -> Result<String> {
    let data_dir = config.data_dir();
    let mut out = String::new();
    writeln!(out, "Scraper '{scraper}' ({})", data_dir.display())?;

    let checkpoints = list_checkpoints(&data_dir, scraper)
        .with_context(|| format!("Failed to list checkpoints of {scraper}"))?;
    if checkpoints.is_empty() {
        writeln!(out, "  no checkpoints")?;
    }
    for (stage, path) in checkpoints {
        match read_checkpoint(&path) {
            Ok(Some(checkpoint)) => {
                let state = if checkpoint.completed_at.is_some() {
                    "complete"
                } else {
                    "open"
                };
                writeln!(
                    out,
                    "  {stage}: {} [{state}] updated {}",
                    summarize(&checkpoint),
                    checkpoint.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
                )?;
            }
            Ok(None) => {}
            Err(e) => writeln!(out, "  {stage}: unreadable ({e})")?,
        }
    }

    let pids = ProcessRegistry::new(config.registry())
        .pids_for(scraper)
        .context("Failed to read process registry")?;
    if pids.is_empty() {
        writeln!(out, "  no registered processes")?;
    } else {
        let list: Vec<String> = pids.iter().map(u32::to_string).collect();
        writeln!(out, "  registered pids: {}", list.join(", "))?;
    }
    Ok(out)
}

/// Ask a running pipeline of `scraper` to stop, then terminate its registered processes.
///
/// The run notices the request within a poll interval and ends interrupted; sessions it
/// reopens in the meantime are released when its workers exit.
pub fn stop(config: &CoordinatorConfig, scraper: &str) -> Result<TerminateReport> {
    let registry = ProcessRegistry::new(config.registry());
    registry
        .request_stop(scraper)
        .with_context(|| format!("Failed to request a stop of {scraper}"))?;
    let report = registry
        .terminate(scraper)
        .with_context(|| format!("Failed to terminate processes of {scraper}"))?;
    info!("🛑 {report}");
    Ok(report)
}

/// Remove all checkpoints of `scraper`; returns how many files were deleted
pub fn reset(config: &CoordinatorConfig, scraper: &str) -> Result<usize> {
    remove_checkpoints(&config.data_dir(), scraper)
        .with_context(|| format!("Failed to remove checkpoints of {scraper}"))
}
