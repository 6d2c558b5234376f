//! # Stage Orchestrator
//!
//! Runs a scraper's ordered stages, each through its own worker pool and checkpoint.
//!
//! A stage is *verified* when its checkpoint is marked complete and every output it
//! declares exists with a nonzero size. On resume the pipeline starts at the first stage
//! that is not verified, so a completed stage whose outputs went missing is re-entered;
//! its terminal units are skipped and only its `finish` hook does real work again.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::crawling::workers::{PoolDependencies, PoolError, PoolReport, WorkerPool, WorkerPoolConfig};
use crate::domain::identity::IdentityPool;
use crate::domain::services::browser_session::SessionFactory;
use crate::domain::services::extractor::Extractor;
use crate::domain::work_unit::WorkKey;
use crate::infrastructure::checkpoint_store::{
    CheckpointError, CheckpointStore, UnitSummary, checkpoint_path, read_checkpoint,
    remove_checkpoints, summarize,
};
use crate::infrastructure::process_registry::ProcessRegistry;
use crate::infrastructure::retry_manager::RetryPolicy;

/// One named stage of a scraper
pub trait StageDefinition: Send + Sync {
    /// Unique within the pipeline; also the checkpoint file name
    fn name(&self) -> &str;

    /// Artifacts the stage produces. All must exist and be non-empty for the stage to
    /// count as verified.
    fn outputs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Enumerate the stage's work keys. May read outputs of earlier stages.
    fn enumerate(&self) -> anyhow::Result<Vec<WorkKey>>;

    fn extractor(&self) -> Arc<dyn Extractor>;

    /// Called once the pool has drained, with the stage's unit counts
    fn finish(&self, _summary: &UnitSummary) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered stages of one scraper identity
#[derive(Clone)]
pub struct Pipeline {
    scraper: String,
    stages: Vec<Arc<dyn StageDefinition>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("scraper", &self.scraper)
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(scraper: impl Into<String>) -> Self {
        Self {
            scraper: scraper.into(),
            stages: Vec::new(),
        }
    }

    #[must_use]
    pub fn stage(mut self, stage: Arc<dyn StageDefinition>) -> Self {
        self.stages.push(stage);
        self
    }

    #[must_use]
    pub fn scraper(&self) -> &str {
        &self.scraper
    }

    #[must_use]
    pub fn stages(&self) -> &[Arc<dyn StageDefinition>] {
        &self.stages
    }
}

/// Where a run begins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPoint {
    /// First stage that is not verified
    #[default]
    Resume,
    /// Delete every checkpoint of the scraper and start at the first stage
    Fresh,
    /// Start at this 0-based stage index, clearing completion of it and later stages
    Stage(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineOutcome {
    Completed,
    Interrupted { stage: String },
    Halted { stage: String, reason: String },
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Interrupted { stage } => write!(f, "interrupted during stage '{stage}'"),
            Self::Halted { stage, reason } => write!(f, "halted at stage '{stage}': {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    /// 0-based position in the pipeline
    pub index: usize,
    pub units: UnitSummary,
    /// `None` when the stage was not run
    pub pool: Option<PoolReport>,
    /// Skipped because already verified
    pub verified: bool,
    /// Marked complete by this run
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub scraper: String,
    pub start_index: usize,
    pub stages: Vec<StageSummary>,
    pub outcome: PipelineOutcome,
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scraper '{}': {}", self.scraper, self.outcome)?;
        for stage in &self.stages {
            let note = if stage.verified {
                " (verified, skipped)"
            } else if stage.completed {
                " (complete)"
            } else {
                ""
            };
            writeln!(f, "  [{}] {}: {}{}", stage.index + 1, stage.name, stage.units, note)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    EmptyPipeline,

    #[error("stage {requested} does not exist (pipeline has {available} stages)")]
    UnknownStage { requested: usize, available: usize },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint or registry unwritable mid-stage
    #[error("fatal error in stage '{stage}': {source}")]
    Fatal {
        stage: String,
        #[source]
        source: PoolError,
    },
}

/// Run-wide collaborators shared by every stage
pub struct OrchestratorContext {
    pub data_dir: PathBuf,
    pub pool: WorkerPoolConfig,
    pub checkpoint_retry: RetryPolicy,
    pub registry: Arc<ProcessRegistry>,
    pub factory: Arc<dyn SessionFactory>,
    pub identities: IdentityPool,
    pub shutdown: CancellationToken,
}

pub struct StageOrchestrator {
    pipeline: Pipeline,
    context: OrchestratorContext,
}

impl fmt::Debug for StageOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageOrchestrator")
            .field("pipeline", &self.pipeline)
            .field("data_dir", &self.context.data_dir)
            .finish_non_exhaustive()
    }
}

impl StageOrchestrator {
    #[must_use]
    pub const fn new(pipeline: Pipeline, context: OrchestratorContext) -> Self {
        Self { pipeline, context }
    }

    fn scraper(&self) -> &str {
        self.pipeline.scraper()
    }

    fn stage_path(&self, stage: &dyn StageDefinition) -> PathBuf {
        checkpoint_path(&self.context.data_dir, self.scraper(), stage.name())
    }

    fn open_store(&self, stage: &dyn StageDefinition) -> Result<CheckpointStore, CheckpointError> {
        CheckpointStore::open(
            &self.context.data_dir,
            self.scraper(),
            stage.name(),
            self.context.checkpoint_retry,
        )
    }

    /// Complete checkpoint plus non-empty outputs
    fn is_verified(&self, stage: &dyn StageDefinition) -> bool {
        let path = self.stage_path(stage);
        let complete = match read_checkpoint(&path) {
            Ok(Some(checkpoint)) => checkpoint.completed_at.is_some(),
            Ok(None) => false,
            Err(e) => {
                warn!(stage = stage.name(), "Unreadable checkpoint, stage will run: {e}");
                false
            }
        };
        if !complete {
            return false;
        }
        let missing: Vec<PathBuf> = stage
            .outputs()
            .into_iter()
            .filter(|output| !has_content(output))
            .collect();
        if missing.is_empty() {
            return true;
        }
        warn!(
            stage = stage.name(),
            ?missing,
            "⏪ Stage is marked complete but outputs are missing or empty, rewinding"
        );
        false
    }

    /// Resolve `start` to a 0-based stage index, applying its side effects
    pub fn resolve_start(&self, start: StartPoint) -> Result<usize, PipelineError> {
        let stages = self.pipeline.stages();
        match start {
            StartPoint::Fresh => {
                let removed = remove_checkpoints(&self.context.data_dir, self.scraper())
                    .map_err(|source| PipelineError::Io {
                        path: self.context.data_dir.clone(),
                        source,
                    })?;
                info!(scraper = self.scraper(), removed, "🧹 Fresh start, checkpoints cleared");
                Ok(0)
            }
            StartPoint::Stage(index) => {
                if index >= stages.len() {
                    return Err(PipelineError::UnknownStage {
                        requested: index + 1,
                        available: stages.len(),
                    });
                }
                for stage in &stages[index..] {
                    self.open_store(stage.as_ref())?.clear_stage_complete()?;
                }
                info!(
                    scraper = self.scraper(),
                    stage = stages[index].name(),
                    "Starting at requested stage {}",
                    index + 1
                );
                Ok(index)
            }
            StartPoint::Resume => {
                let first = stages
                    .iter()
                    .position(|stage| !self.is_verified(stage.as_ref()))
                    .unwrap_or(stages.len());
                if first > 0 {
                    info!(
                        scraper = self.scraper(),
                        verified = first,
                        "Resuming after verified stages"
                    );
                }
                Ok(first)
            }
        }
    }

    /// Run the pipeline from `start`.
    ///
    /// Per-unit failures never fail the run. A stage that cannot enumerate, whose pool
    /// loses every worker or whose `finish` hook fails halts the pipeline. Checkpoint or
    /// registry write failures are returned as errors.
    pub fn run(&self, start: StartPoint) -> Result<PipelineReport, PipelineError> {
        let stages = self.pipeline.stages();
        if stages.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }
        let start_index = self.resolve_start(start)?;

        let mut summaries: Vec<StageSummary> = stages[..start_index]
            .iter()
            .enumerate()
            .map(|(index, stage)| StageSummary {
                name: stage.name().to_string(),
                index,
                units: read_checkpoint(&self.stage_path(stage.as_ref()))
                    .ok()
                    .flatten()
                    .map(|checkpoint| summarize(&checkpoint))
                    .unwrap_or_default(),
                pool: None,
                verified: true,
                completed: false,
            })
            .collect();

        let mut outcome = PipelineOutcome::Completed;
        for (index, stage) in stages.iter().enumerate().skip(start_index) {
            if self.context.shutdown.is_cancelled() {
                outcome = PipelineOutcome::Interrupted {
                    stage: stage.name().to_string(),
                };
                break;
            }
            let (summary, stop) = self.run_stage(index, stage.as_ref())?;
            summaries.push(summary);
            if let Some(stop) = stop {
                outcome = stop;
                break;
            }
        }

        let report = PipelineReport {
            scraper: self.scraper().to_string(),
            start_index,
            stages: summaries,
            outcome,
        };
        info!(scraper = self.scraper(), outcome = %report.outcome, "📋 Pipeline finished");
        Ok(report)
    }

    /// Run one stage; the second value is set when the pipeline must stop
    fn run_stage(
        &self,
        index: usize,
        stage: &dyn StageDefinition,
    ) -> Result<(StageSummary, Option<PipelineOutcome>), PipelineError> {
        let name = stage.name().to_string();
        info!(scraper = self.scraper(), stage = %name, "▶️ Stage {} started", index + 1);

        let store = Arc::new(self.open_store(stage)?);
        let mut summary = StageSummary {
            name: name.clone(),
            index,
            units: UnitSummary::default(),
            pool: None,
            verified: false,
            completed: false,
        };
        let halt = |reason: String| {
            error!(stage = %name, "⛔ {reason}");
            Some(PipelineOutcome::Halted {
                stage: name.clone(),
                reason,
            })
        };

        let keys = match stage.enumerate() {
            Ok(keys) => keys,
            Err(e) => return Ok((summary, halt(format!("enumeration failed: {e:#}")))),
        };
        store.record_plan(&keys)?;

        let pool = WorkerPool::new(
            self.context.pool.clone(),
            PoolDependencies {
                scraper: self.scraper().to_string(),
                checkpoint: Arc::clone(&store),
                registry: Arc::clone(&self.context.registry),
                factory: Arc::clone(&self.context.factory),
                extractor: stage.extractor(),
                identities: self.context.identities.clone(),
            },
            self.context.shutdown.clone(),
        );
        let report = match pool.run(&keys) {
            Ok(report) => report,
            Err(source) if source.is_fatal() => {
                return Err(PipelineError::Fatal {
                    stage: name.clone(),
                    source,
                });
            }
            Err(e) => {
                summary.units = store.summary_for(&keys);
                return Ok((summary, halt(format!("worker pool failed: {e}"))));
            }
        };
        summary.units = store.summary_for(&keys);
        let interrupted = report.interrupted;
        summary.pool = Some(report);

        if interrupted {
            warn!(stage = %name, units = %summary.units, "🛑 Stage interrupted");
            let outcome = PipelineOutcome::Interrupted {
                stage: name.clone(),
            };
            return Ok((summary, Some(outcome)));
        }

        if let Err(e) = stage.finish(&summary.units) {
            return Ok((summary, halt(format!("finish hook failed: {e:#}"))));
        }

        if summary.units.failed == 0 && summary.units.pending == 0 {
            store.mark_stage_complete()?;
            summary.completed = true;
            info!(stage = %name, units = %summary.units, "✅ Stage complete");
        } else {
            warn!(
                stage = %name,
                units = %summary.units,
                "Stage has unfinished units; it will be retried on the next resume"
            );
        }
        Ok((summary, None))
    }
}

fn has_content(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.len() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::crawling::rate_limiter::RateLimitConfig;
    use crate::domain::services::extractor::{ExtractionError, ExtractionOutcome};
    use crate::infrastructure::process_registry::RegistryConfig;
    use crate::test_utils::{ScriptedExtractor, StubFactory, numbered_keys};

    struct FileStage {
        name: String,
        keys: Vec<WorkKey>,
        output: PathBuf,
        extractor: Arc<ScriptedExtractor>,
        fail_enumerate: bool,
        finished: Mutex<u32>,
    }

    impl FileStage {
        fn build(dir: &TempDir, name: &str, keys: usize, extractor: ScriptedExtractor) -> Self {
            Self {
                name: name.to_string(),
                keys: numbered_keys(keys),
                output: dir.path().join(format!("{name}.out")),
                extractor: Arc::new(extractor),
                fail_enumerate: false,
                finished: Mutex::new(0),
            }
        }

        fn new(dir: &TempDir, name: &str, keys: usize, extractor: ScriptedExtractor) -> Arc<Self> {
            Arc::new(Self::build(dir, name, keys, extractor))
        }
    }

    impl StageDefinition for FileStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn outputs(&self) -> Vec<PathBuf> {
            vec![self.output.clone()]
        }

        fn enumerate(&self) -> anyhow::Result<Vec<WorkKey>> {
            if self.fail_enumerate {
                anyhow::bail!("listing unavailable");
            }
            Ok(self.keys.clone())
        }

        fn extractor(&self) -> Arc<dyn Extractor> {
            self.extractor.clone()
        }

        fn finish(&self, summary: &UnitSummary) -> anyhow::Result<()> {
            *self.finished.lock().unwrap() += 1;
            fs::write(&self.output, summary.to_string())?;
            Ok(())
        }
    }

    fn orchestrator(dir: &TempDir, pipeline: Pipeline) -> StageOrchestrator {
        StageOrchestrator::new(
            pipeline,
            OrchestratorContext {
                data_dir: dir.path().join("data"),
                pool: WorkerPoolConfig {
                    workers: 2,
                    queue_capacity: 4,
                    dequeue_timeout: Duration::from_millis(20),
                    rotation_threshold: 0,
                    rate_limit: RateLimitConfig::default(),
                    retry: RetryPolicy::new(2, Duration::from_millis(1)),
                    session_retry: RetryPolicy::new(2, Duration::from_millis(1)),
                },
                checkpoint_retry: RetryPolicy::no_retry(),
                registry: Arc::new(ProcessRegistry::new(RegistryConfig::under(
                    &dir.path().join("data"),
                ))),
                factory: StubFactory::new(),
                identities: IdentityPool::anonymous(),
                shutdown: CancellationToken::new(),
            },
        )
    }

    #[test]
    fn stages_run_in_order_and_resume_skips_verified() {
        let dir = TempDir::new().unwrap();
        let list = FileStage::new(&dir, "list", 12, ScriptedExtractor::new());
        let detail = FileStage::new(&dir, "detail", 5, ScriptedExtractor::new());
        let pipeline = Pipeline::new("acme").stage(list.clone()).stage(detail.clone());

        let report = orchestrator(&dir, pipeline.clone()).run(StartPoint::Resume).unwrap();
        assert_eq!(report.outcome, PipelineOutcome::Completed);
        assert_eq!(report.stages.len(), 2);
        assert!(report.stages.iter().all(|s| s.completed));
        assert_eq!(report.stages[0].units.zero_result, 2);
        assert_eq!(report.stages[0].units.success, 10);

        let again = orchestrator(&dir, pipeline).run(StartPoint::Resume).unwrap();
        assert_eq!(again.start_index, 2);
        assert!(again.stages.iter().all(|s| s.verified));
        assert_eq!(list.extractor.calls(), 12);
        assert_eq!(detail.extractor.calls(), 5);
    }

    #[test]
    fn missing_output_rewinds_to_that_stage() {
        let dir = TempDir::new().unwrap();
        let list = FileStage::new(&dir, "list", 4, ScriptedExtractor::new());
        let detail = FileStage::new(&dir, "detail", 4, ScriptedExtractor::new());
        let pipeline = Pipeline::new("acme").stage(list.clone()).stage(detail.clone());
        orchestrator(&dir, pipeline.clone()).run(StartPoint::Resume).unwrap();

        fs::write(&list.output, b"").unwrap();
        let report = orchestrator(&dir, pipeline).run(StartPoint::Resume).unwrap();

        assert_eq!(report.start_index, 0);
        assert_eq!(report.outcome, PipelineOutcome::Completed);
        // Terminal units are not re-extracted; only the outputs are rebuilt
        assert_eq!(list.extractor.calls(), 4);
        assert_eq!(*list.finished.lock().unwrap(), 2);
        assert!(has_content(&list.output));
    }

    #[test]
    fn failed_units_keep_stage_open_for_next_resume() {
        let dir = TempDir::new().unwrap();
        let failing = ScriptedExtractor::new().script(
            "key-3",
            [ExtractionOutcome::Failed(ExtractionError::Other("parse error".into()))],
        );
        let list = FileStage::new(&dir, "list", 6, failing);
        let detail = FileStage::new(&dir, "detail", 3, ScriptedExtractor::new());
        let pipeline = Pipeline::new("acme").stage(list.clone()).stage(detail.clone());

        let first = orchestrator(&dir, pipeline.clone()).run(StartPoint::Resume).unwrap();
        assert_eq!(first.outcome, PipelineOutcome::Completed);
        assert_eq!(first.stages[0].units.failed, 1);
        assert!(!first.stages[0].completed);
        assert!(first.stages[1].completed);

        let second = orchestrator(&dir, pipeline).run(StartPoint::Resume).unwrap();
        assert_eq!(second.start_index, 0);
        assert!(second.stages[0].completed);
        // Only the failed unit was retried
        assert_eq!(list.extractor.calls(), 7);
        assert_eq!(list.extractor.identities_for("key-3").len(), 2);
    }

    #[test]
    fn explicit_start_clears_completion_but_keeps_units() {
        let dir = TempDir::new().unwrap();
        let list = FileStage::new(&dir, "list", 3, ScriptedExtractor::new());
        let detail = FileStage::new(&dir, "detail", 3, ScriptedExtractor::new());
        let pipeline = Pipeline::new("acme").stage(list.clone()).stage(detail.clone());
        orchestrator(&dir, pipeline.clone()).run(StartPoint::Resume).unwrap();

        let report = orchestrator(&dir, pipeline).run(StartPoint::Stage(1)).unwrap();

        assert_eq!(report.start_index, 1);
        assert!(report.stages[0].verified);
        assert!(report.stages[1].completed);
        assert_eq!(detail.extractor.calls(), 3);
        assert_eq!(*detail.finished.lock().unwrap(), 2);
    }

    #[test]
    fn fresh_start_reprocesses_everything() {
        let dir = TempDir::new().unwrap();
        let list = FileStage::new(&dir, "list", 3, ScriptedExtractor::new());
        let pipeline = Pipeline::new("acme").stage(list.clone());
        orchestrator(&dir, pipeline.clone()).run(StartPoint::Resume).unwrap();

        orchestrator(&dir, pipeline).run(StartPoint::Fresh).unwrap();

        assert_eq!(list.extractor.calls(), 6);
    }

    #[test]
    fn enumeration_failure_halts_pipeline() {
        let dir = TempDir::new().unwrap();
        let broken = Arc::new(FileStage {
            fail_enumerate: true,
            ..FileStage::build(&dir, "list", 3, ScriptedExtractor::new())
        });
        let detail = FileStage::new(&dir, "detail", 3, ScriptedExtractor::new());
        let pipeline = Pipeline::new("acme").stage(broken).stage(detail.clone());

        let report = orchestrator(&dir, pipeline).run(StartPoint::Resume).unwrap();

        assert!(matches!(report.outcome, PipelineOutcome::Halted { ref stage, .. } if stage == "list"));
        assert_eq!(report.stages.len(), 1);
        assert_eq!(detail.extractor.calls(), 0);
    }

    #[test]
    fn unknown_start_stage_and_empty_pipeline_are_errors() {
        let dir = TempDir::new().unwrap();
        let list = FileStage::new(&dir, "list", 1, ScriptedExtractor::new());
        let orchestrator_one = orchestrator(&dir, Pipeline::new("acme").stage(list));
        assert!(matches!(
            orchestrator_one.run(StartPoint::Stage(1)),
            Err(PipelineError::UnknownStage { requested: 2, available: 1 })
        ));
        assert!(matches!(
            orchestrator(&dir, Pipeline::new("acme")).run(StartPoint::Resume),
            Err(PipelineError::EmptyPipeline)
        ));
    }
}
