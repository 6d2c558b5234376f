//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use scrape_coordinator::crawling::orchestrator::{Pipeline, StageDefinition};
use scrape_coordinator::domain::services::extractor::Extractor;
use scrape_coordinator::domain::work_unit::WorkKey;
use scrape_coordinator::infrastructure::checkpoint_store::{
    Checkpoint, UnitSummary, checkpoint_path, read_checkpoint,
};
use scrape_coordinator::infrastructure::config::CoordinatorConfig;
use scrape_coordinator::infrastructure::process_registry::ProcessRegistry;
use scrape_coordinator::test_utils::{ScriptedExtractor, numbered_keys};

pub const SCRAPER: &str = "acme";

/// Fast settings: no rate limits, millisecond backoffs, no log output
pub fn fast_config(data_dir: &Path, workers: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        data_dir: Some(data_dir.to_path_buf()),
        workers,
        queue_capacity: 8,
        dequeue_timeout_ms: 20,
        batch_limit: 0,
        min_interval_ms: 0,
        rotation_threshold: 0,
        retry_max_attempts: 2,
        retry_backoff_ms: 1,
        retry_jitter_ms: 0,
        session_recreate_attempts: 2,
        log_console: false,
        log_file: false,
        ..CoordinatorConfig::default()
    }
}

pub fn registry(config: &CoordinatorConfig) -> Arc<ProcessRegistry> {
    Arc::new(ProcessRegistry::new(config.registry()))
}

/// Stage over `key-N` keys that writes its summary to an output file when done
pub struct KeyStage {
    pub name: String,
    pub keys: Vec<WorkKey>,
    pub output: PathBuf,
    pub extractor: Arc<ScriptedExtractor>,
    pub finished: AtomicU32,
}

impl KeyStage {
    pub fn new(dir: &Path, name: &str, keys: usize, extractor: ScriptedExtractor) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            keys: numbered_keys(keys),
            output: dir.join(format!("{name}.out")),
            extractor: Arc::new(extractor),
            finished: AtomicU32::new(0),
        })
    }

    pub fn finish_count(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }
}

impl StageDefinition for KeyStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn outputs(&self) -> Vec<PathBuf> {
        vec![self.output.clone()]
    }

    fn enumerate(&self) -> anyhow::Result<Vec<WorkKey>> {
        Ok(self.keys.clone())
    }

    fn extractor(&self) -> Arc<dyn Extractor> {
        self.extractor.clone()
    }

    fn finish(&self, summary: &UnitSummary) -> anyhow::Result<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        fs::write(&self.output, summary.to_string())?;
        Ok(())
    }
}

pub fn single_stage(stage: Arc<KeyStage>) -> Pipeline {
    Pipeline::new(SCRAPER).stage(stage)
}

pub fn load_checkpoint(data_dir: &Path, stage: &str) -> Checkpoint {
    read_checkpoint(&checkpoint_path(data_dir, SCRAPER, stage))
        .expect("checkpoint readable")
        .expect("checkpoint exists")
}
