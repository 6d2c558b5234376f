//! Infrastructure layer: durable state, cross-process coordination and ambient services
//!
//! Checkpoint files, the process registry and its file lock, atomic writes, the shared
//! retry wrapper, configuration loading and logging setup.

pub mod atomic_file;
pub mod checkpoint_store;
pub mod config; // Configuration defaults and loading
pub mod file_lock;
pub mod logging; // Logging infrastructure
pub mod process_registry;
pub mod retry_manager;

// Re-export commonly used items
pub use checkpoint_store::{
    Aggregate, Checkpoint, CheckpointError, CheckpointStore, UnitSummary, read_checkpoint,
    summarize,
};
pub use config::{ConfigError, CoordinatorConfig, LoggingConfig};
pub use file_lock::{FileLock, FileLockOptions, LockError};
pub use logging::{init_logging_with_config, log_system_info};
pub use process_registry::{
    ProcessControl, ProcessRegistry, RegistryConfig, RegistryError, SystemProcesses,
    TerminateReport,
};
pub use retry_manager::RetryPolicy;
