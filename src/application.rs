//! Application layer
//!
//! Entry points that wire the coordinator together for a scraper binary: command-line
//! arguments, signal handling, the pipeline runner and the supervisor commands.

pub mod cli;
pub mod runner;
pub mod shutdown;
pub mod supervisor;

// Re-export commonly used items
pub use cli::{RunArgs, ScraperCli, SupervisorCli, SupervisorCommand};
pub use runner::{FATAL_EXIT_CODE, execute, exit_status, launch, run_exit_status};
pub use shutdown::{
    ShutdownAction, ShutdownHandler, ShutdownSignal, SignalListener, StopRequestWatcher,
};
