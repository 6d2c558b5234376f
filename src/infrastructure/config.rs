//! Configuration infrastructure
//!
//! Flat coordinator settings loaded in three layers:
//! 1. Built-in defaults (`defaults` module)
//! 2. Optional config file (TOML / JSON / YAML, by extension)
//! 3. `SCRAPER_*` environment variables (e.g. `SCRAPER_WORKERS=4`)
//!
//! The flat struct is then validated and split into the typed settings each
//! component takes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::crawling::rate_limiter::{CadenceScope, RateLimitConfig};
use crate::crawling::workers::WorkerPoolConfig;
use crate::domain::identity::IdentityPool;
use crate::infrastructure::file_lock::FileLockOptions;
use crate::infrastructure::process_registry::RegistryConfig;
use crate::infrastructure::retry_manager::RetryPolicy;

/// Environment variable prefix (`SCRAPER_BATCH_LIMIT`, ...)
pub const ENV_PREFIX: &str = "SCRAPER";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// Default values
pub mod defaults {
    pub const WORKERS: usize = 3;
    pub const QUEUE_CAPACITY: usize = 64;
    pub const DEQUEUE_TIMEOUT_MS: u64 = 500;

    /// Requests per batch window shared by all workers
    pub const BATCH_LIMIT: u32 = 30;
    pub const BATCH_PERIOD_SECS: u64 = 60;

    /// Minimum spacing between two requests of one worker
    pub const MIN_INTERVAL_MS: u64 = 1500;

    /// Searches per identity before a proactive rotation (0 disables)
    pub const ROTATION_THRESHOLD: u32 = 200;

    pub const RETRY_MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BACKOFF_MS: u64 = 2000;
    pub const RETRY_JITTER_MS: u64 = 250;
    pub const SESSION_RECREATE_ATTEMPTS: u32 = 3;

    pub const LOCK_STALE_SECS: u64 = 30;
    pub const LOCK_TIMEOUT_SECS: u64 = 10;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_MAX_FILES: u32 = 10;
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Directory for log files
    pub log_dir: PathBuf,

    /// Base file name; previous files are renamed with a timestamp on startup
    pub file_name: String,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: default_data_dir().join("logs"),
            file_name: "coordinator.log".to_string(),
            max_files: defaults::LOG_MAX_FILES,
        }
    }
}

/// Complete coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Root for checkpoints, registry and logs; platform data dir when unset
    pub data_dir: Option<PathBuf>,

    pub workers: usize,
    pub queue_capacity: usize,
    pub dequeue_timeout_ms: u64,

    pub batch_limit: u32,
    pub batch_period_secs: u64,
    pub min_interval_ms: u64,
    pub cadence_scope: CadenceScope,

    pub rotation_threshold: u32,
    /// Comma separated `label` or `label@proxy` entries
    pub identities: String,

    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub retry_jitter_ms: u64,
    pub session_recreate_attempts: u32,

    pub lock_stale_secs: u64,
    pub lock_timeout_secs: u64,

    pub log_level: String,
    pub log_json: bool,
    pub log_console: bool,
    pub log_file: bool,
    pub log_max_files: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            workers: defaults::WORKERS,
            queue_capacity: defaults::QUEUE_CAPACITY,
            dequeue_timeout_ms: defaults::DEQUEUE_TIMEOUT_MS,
            batch_limit: defaults::BATCH_LIMIT,
            batch_period_secs: defaults::BATCH_PERIOD_SECS,
            min_interval_ms: defaults::MIN_INTERVAL_MS,
            cadence_scope: CadenceScope::Worker,
            rotation_threshold: defaults::ROTATION_THRESHOLD,
            identities: String::new(),
            retry_max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            retry_backoff_ms: defaults::RETRY_BACKOFF_MS,
            retry_jitter_ms: defaults::RETRY_JITTER_MS,
            session_recreate_attempts: defaults::SESSION_RECREATE_ATTEMPTS,
            lock_stale_secs: defaults::LOCK_STALE_SECS,
            lock_timeout_secs: defaults::LOCK_TIMEOUT_SECS,
            log_level: defaults::LOG_LEVEL.to_string(),
            log_json: false,
            log_console: true,
            log_file: true,
            log_max_files: defaults::LOG_MAX_FILES,
        }
    }
}

/// `<platform data dir>/scrape-coordinator`, or `./scrape-data` when there is none
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir().map_or_else(
        || PathBuf::from("scrape-data"),
        |dir| dir.join("scrape-coordinator"),
    )
}

impl CoordinatorConfig {
    /// Load defaults, then `path` (when given), then `SCRAPER_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Like [`Self::load`], but reads environment overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        if let Some(path) = path {
            info!("Loaded coordinator configuration from {}", path.display());
        }
        Ok(config)
    }

    /// 설정값 유효성 검증
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Validation {
                message: message.to_string(),
            })
        };
        if self.workers == 0 {
            return invalid("workers must be greater than 0");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be greater than 0");
        }
        if self.dequeue_timeout_ms == 0 {
            return invalid("dequeue_timeout_ms must be greater than 0");
        }
        if self.batch_limit > 0 && self.batch_period_secs == 0 {
            return invalid("batch_period_secs must be greater than 0 when batch_limit is set");
        }
        if self.retry_max_attempts == 0 {
            return invalid("retry_max_attempts must be greater than 0");
        }
        if self.session_recreate_attempts == 0 {
            return invalid("session_recreate_attempts must be greater than 0");
        }
        if self.lock_stale_secs == 0 {
            return invalid("lock_stale_secs must be greater than 0");
        }
        if !self.identities.trim().is_empty() && self.identity_pool().is_none() {
            return invalid("identities must contain at least one non-empty entry");
        }
        Ok(())
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Configured identities, or `None` when the list is empty
    #[must_use]
    pub fn identity_pool(&self) -> Option<IdentityPool> {
        IdentityPool::from_specs(self.identities.split(','))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
        .with_jitter(Duration::from_millis(self.retry_jitter_ms))
    }

    /// Session recreation shares the backoff, with its own attempt bound
    #[must_use]
    pub fn session_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.session_recreate_attempts,
            ..self.retry_policy()
        }
    }

    #[must_use]
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            batch_limit: self.batch_limit,
            batch_period: Duration::from_secs(self.batch_period_secs),
            min_interval: Duration::from_millis(self.min_interval_ms),
            cadence_scope: self.cadence_scope,
        }
    }

    #[must_use]
    pub fn pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            dequeue_timeout: Duration::from_millis(self.dequeue_timeout_ms),
            rotation_threshold: self.rotation_threshold,
            rate_limit: self.rate_limit(),
            retry: self.retry_policy(),
            session_retry: self.session_retry_policy(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            lock: FileLockOptions {
                stale_after: Duration::from_secs(self.lock_stale_secs),
                timeout: Duration::from_secs(self.lock_timeout_secs),
            },
            retry: self.retry_policy(),
            ..RegistryConfig::under(&self.data_dir())
        }
    }

    #[must_use]
    pub fn logging(&self, file_stem: &str) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.log_json,
            console_output: self.log_console,
            file_output: self.log_file,
            log_dir: self.data_dir().join("logs"),
            file_name: format!("{file_stem}.log"),
            max_files: self.log_max_files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.pool().workers, defaults::WORKERS);
    }

    #[test]
    fn file_then_environment_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coordinator.toml");
        fs::write(
            &path,
            "workers = 5\nbatch_limit = 10\ncadence_scope = \"identity\"\nidentities = \"a, b@http://proxy:3128\"\n",
        )
        .unwrap();

        let config = CoordinatorConfig::load_with_env(
            Some(&path),
            env(&[("SCRAPER_WORKERS", "7"), ("SCRAPER_MIN_INTERVAL_MS", "250")]),
        )
        .unwrap();

        assert_eq!(config.workers, 7);
        assert_eq!(config.batch_limit, 10);
        assert_eq!(config.min_interval_ms, 250);
        assert_eq!(config.cadence_scope, CadenceScope::Identity);
        let pool = config.identity_pool().unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(1).proxy.as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn rejects_zero_workers() {
        let err = CoordinatorConfig::load_with_env(None, env(&[("SCRAPER_WORKERS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result =
            CoordinatorConfig::load_with_env(Some(&dir.path().join("nope.toml")), env(&[]));
        assert!(matches!(result, Err(ConfigError::Load { .. })));
    }

    #[test]
    fn typed_settings_follow_flat_values() {
        let config = CoordinatorConfig {
            data_dir: Some(PathBuf::from("/tmp/scrape")),
            lock_stale_secs: 45,
            session_recreate_attempts: 5,
            ..CoordinatorConfig::default()
        };
        let registry = config.registry();
        assert_eq!(registry.dir, PathBuf::from("/tmp/scrape/registry"));
        assert_eq!(registry.lock.stale_after, Duration::from_secs(45));
        assert_eq!(config.session_retry_policy().max_attempts, 5);
        assert_eq!(config.logging("acme").log_dir, PathBuf::from("/tmp/scrape/logs"));
    }
}
