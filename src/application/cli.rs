//! Command-line arguments
//!
//! Scraper binaries flatten [`RunArgs`] into their own parser (or use [`ScraperCli`]
//! as is). The bundled `scrape-coordinator` binary parses [`SupervisorCli`].

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::crawling::orchestrator::StartPoint;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "SCRAPE_COORDINATOR_CONFIG";

/// Run controls shared by every scraper binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct RunArgs {
    /// Discard all checkpoints of this scraper and start from the first stage
    #[arg(long, conflicts_with = "start_stage")]
    pub fresh: bool,

    /// Start at stage N (1-based); stage N and later stages are run again
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub start_stage: Option<u32>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = CONFIG_ENV, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl RunArgs {
    #[must_use]
    pub fn start_point(&self) -> StartPoint {
        if self.fresh {
            return StartPoint::Fresh;
        }
        match self.start_stage {
            Some(stage) => StartPoint::Stage(stage.saturating_sub(1) as usize),
            None => StartPoint::Resume,
        }
    }
}

/// Ready-made parser for scraper binaries without extra arguments
#[derive(Debug, Parser)]
#[command(version, about = "Resumable browser-driven scraper")]
pub struct ScraperCli {
    #[command(flatten)]
    pub run: RunArgs,
}

/// `scrape-coordinator` supervisor commands
#[derive(Debug, Parser)]
#[command(name = "scrape-coordinator", version, about = "Inspect and control scraper runs")]
pub struct SupervisorCli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true, env = CONFIG_ENV, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: SupervisorCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum SupervisorCommand {
    /// Per-stage progress and registered processes of a scraper
    Status { scraper: String },
    /// Terminate the browser processes registered by a scraper
    Stop { scraper: String },
    /// Delete a scraper's checkpoints so the next run starts fresh
    Reset { scraper: String },
}
