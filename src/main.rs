//! `scrape-coordinator` supervisor binary
//!
//! Inspect and control scraper runs from outside the scraper process:
//!
//! ```bash
//! scrape-coordinator status acme
//! scrape-coordinator stop acme
//! scrape-coordinator reset acme
//! ```

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use scrape_coordinator::application::cli::{SupervisorCli, SupervisorCommand};
use scrape_coordinator::application::supervisor;
use scrape_coordinator::infrastructure::config::CoordinatorConfig;
use scrape_coordinator::infrastructure::logging::init_logging_with_config;

fn main() -> ExitCode {
    let cli = SupervisorCli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: SupervisorCli) -> Result<()> {
    let config = CoordinatorConfig::load(cli.config.as_deref())?;

    // Console only; the supervisor must not rotate a running scraper's log file
    let mut logging = config.logging("supervisor");
    logging.file_output = false;
    logging.console_output = true;
    if let Err(e) = init_logging_with_config(&logging) {
        eprintln!("Logging setup failed: {e:#}");
    }

    match cli.command {
        SupervisorCommand::Status { scraper } => {
            print!("{}", supervisor::status(&config, &scraper)?);
        }
        SupervisorCommand::Stop { scraper } => {
            let report = supervisor::stop(&config, &scraper)?;
            println!("{report}");
        }
        SupervisorCommand::Reset { scraper } => {
            let removed = supervisor::reset(&config, &scraper)?;
            println!("Removed {removed} checkpoint(s) of '{scraper}'");
        }
    }
    Ok(())
}
