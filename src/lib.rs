//! Scrape Coordinator - resumable work coordination for browser-driven scrapers
//!
//! A scraper plugs in a [`SessionFactory`] (how to open a browser for an identity) and
//! one [`StageDefinition`] per stage (how to enumerate and extract work). The
//! coordinator runs each stage on a pool of OS-thread workers and provides:
//!
//! - crash-safe, per-unit checkpoints so an interrupted run resumes where it stopped
//! - a cross-process registry of browser pids so a stop kills only this scraper's browsers
//! - batch-window and per-worker cadence rate limiting
//! - identity rotation on search thresholds and block pages
//! - dead-session detection and recreation
//!
//! ```no_run
//! use std::sync::Arc;
//! use clap::Parser;
//! use scrape_coordinator::{Pipeline, ScraperCli, launch};
//! # fn stages() -> (Arc<dyn scrape_coordinator::StageDefinition>, Arc<dyn scrape_coordinator::SessionFactory>) { unimplemented!() }
//!
//! fn main() -> std::process::ExitCode {
//!     let cli = ScraperCli::parse();
//!     let (list_stage, factory) = stages();
//!     launch(Pipeline::new("acme").stage(list_stage), factory, &cli.run)
//! }
//! ```

// Module declarations
pub mod application;
pub mod crawling;
pub mod domain;
pub mod infrastructure;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;

// Re-export the public surface for scraper crates
pub use application::{
    FATAL_EXIT_CODE, RunArgs, ScraperCli, execute, exit_status, launch, run_exit_status,
};
pub use crawling::{
    Pipeline, PipelineOutcome, PipelineReport, StageDefinition, StageOrchestrator, StartPoint,
};
pub use domain::{
    BrowserSession, ExtractionError, ExtractionOutcome, Extractor, Identity, IdentityPool,
    ResultCounts, SessionError, SessionFactory, WorkKey,
};
pub use infrastructure::{CoordinatorConfig, UnitSummary};
