//! # Checkpoint Store
//!
//! Durable per-(scraper, stage) record of every work unit's status. Every terminal
//! transition and every failure is written to disk (atomic replace) before the call
//! returns, so a killed run resumes without redoing or losing work.
//!
//! Aggregates are maintained incrementally: each unit contributes to the counters
//! according to its current outcome, and a transition swaps the old contribution for
//! the new one. `total_processed` therefore counts distinct units, and
//! `total_failed` counts units that are failed *now*.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::work_unit::{ResultCounts, UnitStatus, WorkKey, WorkUnit};
use crate::infrastructure::atomic_file::{with_suffix, write_atomic};
use crate::infrastructure::retry_manager::RetryPolicy;
use crate::utils::{digest_keys, lock_or_recover};

/// Current on-disk layout. Version 1 is the list-based layout
/// (`completed`, `zero_result`, `failed`, `current`).
pub const SCHEMA_VERSION: u32 = 2;

const CORRUPTED_SUFFIX: &str = ".corrupted";

#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Persisting failed after all retries. Fatal for the run.
    #[error("checkpoint {path} is unwritable: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Running totals over all units of one checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aggregate {
    pub total_processed: u64,
    pub total_success: u64,
    pub total_zero_result: u64,
    pub total_failed: u64,
    pub total_extracted: u64,
    /// Every recorded failure, including retries; never decremented
    pub errors: u64,
}

impl Aggregate {
    /// What a single unit adds to the totals given its current state.
    ///
    /// A non-terminal unit with recorded attempts was last seen failing; it stays
    /// counted as failed while it is being retried.
    fn contribution(unit: &WorkUnit) -> Self {
        let mut c = Self::default();
        match unit.status {
            UnitStatus::Success => {
                c.total_processed = 1;
                c.total_success = 1;
                c.total_extracted = unit.extracted();
            }
            UnitStatus::ZeroResult => {
                c.total_processed = 1;
                c.total_zero_result = 1;
            }
            UnitStatus::Failed => {
                c.total_processed = 1;
                c.total_failed = 1;
            }
            UnitStatus::Pending | UnitStatus::InProgress if unit.attempts > 0 => {
                c.total_processed = 1;
                c.total_failed = 1;
            }
            UnitStatus::Pending | UnitStatus::InProgress => {}
        }
        c
    }

    const fn replace_contribution(&mut self, before: &Self, after: &Self) {
        self.total_processed = self.total_processed.saturating_sub(before.total_processed)
            + after.total_processed;
        self.total_success =
            self.total_success.saturating_sub(before.total_success) + after.total_success;
        self.total_zero_result = self.total_zero_result.saturating_sub(before.total_zero_result)
            + after.total_zero_result;
        self.total_failed =
            self.total_failed.saturating_sub(before.total_failed) + after.total_failed;
        self.total_extracted =
            self.total_extracted.saturating_sub(before.total_extracted) + after.total_extracted;
    }

    /// Recompute totals from unit records (used by schema upgrades and tests).
    #[must_use]
    pub fn recount<'a>(units: impl IntoIterator<Item = &'a WorkUnit>, errors: u64) -> Self {
        let mut total = Self {
            errors,
            ..Self::default()
        };
        for unit in units {
            total.replace_contribution(&Self::default(), &Self::contribution(unit));
        }
        total
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} success={} zero_result={} failed={} extracted={} errors={}",
            self.total_processed,
            self.total_success,
            self.total_zero_result,
            self.total_failed,
            self.total_extracted,
            self.errors
        )
    }
}

/// On-disk checkpoint for one (scraper, stage)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub scraper: String,
    pub stage: String,
    /// Keyed by normalized work key
    pub units: BTreeMap<String, WorkUnit>,
    pub aggregate: Aggregate,
    /// Last key handed to a worker, for crash diagnostics
    pub in_progress: Option<String>,
    pub last_updated: DateTime<Utc>,
    /// Set when the stage finished with no failed units
    pub completed_at: Option<DateTime<Utc>>,
    /// Digest of the enumerated key set of the last run
    pub plan_digest: Option<String>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            scraper: String::new(),
            stage: String::new(),
            units: BTreeMap::new(),
            aggregate: Aggregate::default(),
            in_progress: None,
            last_updated: Utc::now(),
            completed_at: None,
            plan_digest: None,
        }
    }
}

impl Checkpoint {
    fn empty(scraper: &str, stage: &str) -> Self {
        Self {
            scraper: scraper.to_string(),
            stage: stage.to_string(),
            ..Self::default()
        }
    }
}

/// Version 1 layout
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyCheckpoint {
    completed: Vec<String>,
    zero_result: Vec<String>,
    failed: BTreeMap<String, String>,
    current: Option<String>,
    last_updated: Option<DateTime<Utc>>,
}

impl LegacyCheckpoint {
    fn upgrade(self) -> Checkpoint {
        let now = Utc::now();
        let mut units = BTreeMap::new();
        let mut insert = |key: &str, status: UnitStatus, last_error: Option<String>| {
            let work_key = WorkKey::new(key);
            if work_key.is_empty() {
                return;
            }
            let unit = WorkUnit {
                key: key.to_string(),
                status,
                attempts: u32::from(status == UnitStatus::Failed),
                last_error,
                updated_at: now,
                ..WorkUnit::default()
            };
            // Terminal entries win over a stale failure for the same key.
            match units.get(work_key.as_str()) {
                Some(existing) if WorkUnit::is_terminal(existing) => {}
                _ => {
                    units.insert(work_key.as_str().to_string(), unit);
                }
            }
        };
        for (key, error) in self.failed {
            insert(&key, UnitStatus::Failed, Some(error));
        }
        for key in self.zero_result {
            insert(&key, UnitStatus::ZeroResult, None);
        }
        for key in self.completed {
            insert(&key, UnitStatus::Success, None);
        }

        let failures = units
            .values()
            .filter(|u| u.status == UnitStatus::Failed)
            .count() as u64;
        let aggregate = Aggregate::recount(units.values(), failures);
        Checkpoint {
            schema_version: SCHEMA_VERSION,
            units,
            aggregate,
            in_progress: self.current.map(|k| WorkKey::new(k).as_str().to_string()),
            last_updated: self.last_updated.unwrap_or(now),
            ..Checkpoint::default()
        }
    }
}

/// Decode either layout; the flag reports whether an upgrade happened.
fn decode(bytes: &[u8]) -> Result<(Checkpoint, bool), serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let version = value
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(1);
    if version < u64::from(SCHEMA_VERSION) {
        let legacy: LegacyCheckpoint = serde_json::from_value(value)?;
        Ok((legacy.upgrade(), true))
    } else {
        let checkpoint: Checkpoint = serde_json::from_value(value)?;
        Ok((checkpoint, false))
    }
}

/// Read a checkpoint without side effects (no backup, no upgrade rewrite).
pub fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    decode(&bytes)
        .map(|(checkpoint, _)| Some(checkpoint))
        .map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Replace characters that would escape the checkpoint directory.
#[must_use]
pub fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':' | '\0') { '_' } else { c })
        .collect()
}

#[must_use]
pub fn checkpoint_dir(data_dir: &Path, scraper: &str) -> PathBuf {
    data_dir.join("checkpoints").join(sanitize_component(scraper))
}

/// `<data_dir>/checkpoints/<scraper>/<stage>.json`
#[must_use]
pub fn checkpoint_path(data_dir: &Path, scraper: &str, stage: &str) -> PathBuf {
    checkpoint_dir(data_dir, scraper).join(format!("{}.json", sanitize_component(stage)))
}

/// Checkpoint files present for `scraper`, as `(stage file stem, path)` sorted by name.
pub fn list_checkpoints(data_dir: &Path, scraper: &str) -> io::Result<Vec<(String, PathBuf)>> {
    let dir = checkpoint_dir(data_dir, scraper);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut found = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.push((stem.to_string(), path.clone()));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Fresh start: delete every stage checkpoint of `scraper`. Corrupted backups are kept.
pub fn remove_checkpoints(data_dir: &Path, scraper: &str) -> io::Result<usize> {
    let mut removed = 0;
    for (stage, path) in list_checkpoints(data_dir, scraper)? {
        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                info!(scraper, stage, "🗑️ Removed checkpoint");
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(removed)
}

/// Per-status counts over a set of keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub success: u64,
    pub zero_result: u64,
    pub failed: u64,
    pub pending: u64,
}

impl UnitSummary {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.success + self.zero_result + self.failed + self.pending
    }
}

impl fmt::Display for UnitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "success={} zero_result={} failed={} pending={}",
            self.success, self.zero_result, self.failed, self.pending
        )
    }
}

enum Mark<'a> {
    InProgress,
    Success(ResultCounts),
    ZeroResult(&'a str),
    Failed(&'a str),
}

/// Thread-safe handle over one checkpoint file.
///
/// The mutex is held for a mutation plus its persist, never across extraction.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    retry: RetryPolicy,
    state: Mutex<Checkpoint>,
}

impl CheckpointStore {
    /// Open the checkpoint for (`scraper`, `stage`) under `data_dir`.
    pub fn open(
        data_dir: &Path,
        scraper: &str,
        stage: &str,
        retry: RetryPolicy,
    ) -> Result<Self, CheckpointError> {
        Self::open_at(checkpoint_path(data_dir, scraper, stage), scraper, stage, retry)
    }

    /// Open a checkpoint at an explicit path.
    ///
    /// A missing file yields an empty checkpoint. A corrupt file is preserved as
    /// `<name>.json.corrupted` and replaced by an empty checkpoint. A version 1 file is
    /// upgraded and rewritten in place.
    pub fn open_at(
        path: PathBuf,
        scraper: &str,
        stage: &str,
        retry: RetryPolicy,
    ) -> Result<Self, CheckpointError> {
        let mut checkpoint = match fs::read(&path) {
            Ok(bytes) => match decode(&bytes) {
                Ok((mut checkpoint, upgraded)) => {
                    if checkpoint.scraper.is_empty() {
                        checkpoint.scraper = scraper.to_string();
                    }
                    if checkpoint.stage.is_empty() {
                        checkpoint.stage = stage.to_string();
                    }
                    if upgraded {
                        info!(
                            path = %path.display(),
                            units = checkpoint.units.len(),
                            "⬆️ Upgrading checkpoint to schema v{SCHEMA_VERSION}"
                        );
                        persist_to(&path, &mut checkpoint, &retry)?;
                    }
                    checkpoint
                }
                Err(parse_error) => {
                    let backup = with_suffix(&path, CORRUPTED_SUFFIX);
                    warn!(
                        path = %path.display(),
                        error = %parse_error,
                        "⚠️ Checkpoint is corrupt, starting from an empty checkpoint"
                    );
                    match fs::rename(&path, &backup) {
                        Ok(()) => info!(backup = %backup.display(), "Backed up corrupted checkpoint"),
                        Err(e) => warn!("Failed to back up corrupted checkpoint: {e}"),
                    }
                    Checkpoint::empty(scraper, stage)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Checkpoint::empty(scraper, stage),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        checkpoint.schema_version = SCHEMA_VERSION;

        debug!(
            path = %path.display(),
            aggregate = %checkpoint.aggregate,
            "Checkpoint loaded"
        );
        Ok(Self {
            path,
            retry,
            state: Mutex::new(checkpoint),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True iff the unit exists and is `success` or `zero_result`.
    #[must_use]
    pub fn is_terminal(&self, key: &WorkKey) -> bool {
        lock_or_recover(&self.state)
            .units
            .get(key.as_str())
            .is_some_and(WorkUnit::is_terminal)
    }

    #[must_use]
    pub fn unit(&self, key: &WorkKey) -> Option<WorkUnit> {
        lock_or_recover(&self.state).units.get(key.as_str()).cloned()
    }

    #[must_use]
    pub fn aggregate(&self) -> Aggregate {
        lock_or_recover(&self.state).aggregate
    }

    #[must_use]
    pub fn snapshot(&self) -> Checkpoint {
        lock_or_recover(&self.state).clone()
    }

    /// Mark a unit as being worked on. Ignored for terminal units.
    pub fn mark_in_progress(&self, key: &WorkKey) -> Result<bool, CheckpointError> {
        self.apply(key, Mark::InProgress)
    }

    /// Record success. Idempotent: a unit already `success` is left untouched.
    pub fn mark_success(&self, key: &WorkKey, counts: ResultCounts) -> Result<bool, CheckpointError> {
        self.apply(key, Mark::Success(counts))
    }

    /// Record a structurally empty unit. Idempotent like [`Self::mark_success`].
    pub fn mark_zero_result(&self, key: &WorkKey, reason: &str) -> Result<bool, CheckpointError> {
        self.apply(key, Mark::ZeroResult(reason))
    }

    /// Record a failure. Always counts the attempt; never demotes a terminal unit.
    pub fn mark_failed(&self, key: &WorkKey, error: &str) -> Result<(), CheckpointError> {
        self.apply(key, Mark::Failed(error)).map(|_| ())
    }

    fn apply(&self, key: &WorkKey, mark: Mark<'_>) -> Result<bool, CheckpointError> {
        let mut state = lock_or_recover(&self.state);
        let Checkpoint {
            units,
            aggregate,
            in_progress,
            ..
        } = &mut *state;

        let unit = units
            .entry(key.as_str().to_string())
            .or_insert_with(|| WorkUnit::new(key.original()));
        let before = Aggregate::contribution(unit);

        let changed = match mark {
            Mark::InProgress => {
                if unit.is_terminal() {
                    false
                } else {
                    unit.status = UnitStatus::InProgress;
                    *in_progress = Some(key.as_str().to_string());
                    true
                }
            }
            Mark::Success(counts) => {
                if unit.status == UnitStatus::Success {
                    false
                } else {
                    unit.status = UnitStatus::Success;
                    unit.result_counts = counts;
                    unit.zero_reason = None;
                    true
                }
            }
            Mark::ZeroResult(reason) => {
                if unit.status == UnitStatus::ZeroResult {
                    false
                } else {
                    unit.status = UnitStatus::ZeroResult;
                    unit.result_counts.clear();
                    unit.zero_reason = Some(reason.to_string());
                    true
                }
            }
            Mark::Failed(error) => {
                unit.attempts = unit.attempts.saturating_add(1);
                unit.last_error = Some(error.to_string());
                aggregate.errors += 1;
                if !unit.is_terminal() {
                    unit.status = UnitStatus::Failed;
                }
                true
            }
        };
        if !changed {
            return Ok(false);
        }

        unit.updated_at = Utc::now();
        let after = Aggregate::contribution(unit);
        aggregate.replace_contribution(&before, &after);
        let status = unit.status;
        if status != UnitStatus::InProgress && in_progress.as_deref() == Some(key.as_str()) {
            *in_progress = None;
        }

        persist_to(&self.path, &mut state, &self.retry)?;
        debug!(key = %key, status = %status, "Checkpoint updated");
        Ok(true)
    }

    /// Write the current state to disk.
    pub fn persist(&self) -> Result<(), CheckpointError> {
        let mut state = lock_or_recover(&self.state);
        persist_to(&self.path, &mut state, &self.retry)
    }

    /// Fresh start: drop all units, totals and completion, then persist.
    pub fn reset(&self) -> Result<(), CheckpointError> {
        let mut state = lock_or_recover(&self.state);
        let scraper = std::mem::take(&mut state.scraper);
        let stage = std::mem::take(&mut state.stage);
        *state = Checkpoint::empty(&scraper, &stage);
        persist_to(&self.path, &mut state, &self.retry)
    }

    pub fn mark_stage_complete(&self) -> Result<(), CheckpointError> {
        let mut state = lock_or_recover(&self.state);
        state.completed_at = Some(Utc::now());
        state.in_progress = None;
        persist_to(&self.path, &mut state, &self.retry)
    }

    pub fn clear_stage_complete(&self) -> Result<(), CheckpointError> {
        let mut state = lock_or_recover(&self.state);
        if state.completed_at.is_none() {
            return Ok(());
        }
        state.completed_at = None;
        persist_to(&self.path, &mut state, &self.retry)
    }

    #[must_use]
    pub fn is_stage_complete(&self) -> bool {
        lock_or_recover(&self.state).completed_at.is_some()
    }

    /// Remember the digest of this run's enumeration. Returns `true` when it differs
    /// from the previously recorded one (units already terminal stay terminal).
    pub fn record_plan(&self, keys: &[WorkKey]) -> Result<bool, CheckpointError> {
        let digest = digest_keys(keys.iter().map(WorkKey::as_str));
        let mut state = lock_or_recover(&self.state);
        let drifted = match state.plan_digest.as_deref() {
            Some(previous) if previous == digest => return Ok(false),
            Some(previous) => {
                warn!(
                    stage = %state.stage,
                    previous,
                    current = %digest,
                    keys = keys.len(),
                    "Enumerated work differs from the previous run"
                );
                true
            }
            None => false,
        };
        state.plan_digest = Some(digest);
        persist_to(&self.path, &mut state, &self.retry)?;
        Ok(drifted)
    }

    /// Non-terminal keys of an enumeration, deduplicated, in enumeration order.
    #[must_use]
    pub fn pending(&self, keys: &[WorkKey]) -> Vec<WorkKey> {
        let state = lock_or_recover(&self.state);
        let mut seen = HashSet::new();
        keys.iter()
            .filter(|key| seen.insert(key.as_str()))
            .filter(|key| {
                !state
                    .units
                    .get(key.as_str())
                    .is_some_and(WorkUnit::is_terminal)
            })
            .cloned()
            .collect()
    }

    /// Status counts for the given key set; unknown keys are pending.
    #[must_use]
    pub fn summary_for(&self, keys: &[WorkKey]) -> UnitSummary {
        let state = lock_or_recover(&self.state);
        let mut seen = HashSet::new();
        let mut summary = UnitSummary::default();
        for key in keys.iter().filter(|key| seen.insert(key.as_str())) {
            match state.units.get(key.as_str()) {
                Some(unit) => match unit.status {
                    UnitStatus::Success => summary.success += 1,
                    UnitStatus::ZeroResult => summary.zero_result += 1,
                    UnitStatus::Failed => summary.failed += 1,
                    UnitStatus::InProgress if unit.attempts > 0 => summary.failed += 1,
                    UnitStatus::Pending | UnitStatus::InProgress => summary.pending += 1,
                },
                None => summary.pending += 1,
            }
        }
        summary
    }
}

/// Summary over every unit recorded in a checkpoint
#[must_use]
pub fn summarize(checkpoint: &Checkpoint) -> UnitSummary {
    let a = checkpoint.aggregate;
    let unfinished = (checkpoint.units.len() as u64).saturating_sub(a.total_processed);
    UnitSummary {
        success: a.total_success,
        zero_result: a.total_zero_result,
        failed: a.total_failed,
        pending: unfinished,
    }
}

fn persist_to(
    path: &Path,
    checkpoint: &mut Checkpoint,
    retry: &RetryPolicy,
) -> Result<(), CheckpointError> {
    checkpoint.last_updated = Utc::now();
    let bytes = serde_json::to_vec_pretty(checkpoint)?;
    retry
        .run(|_| write_atomic(path, &bytes), |_| true)
        .map_err(|source| CheckpointError::Unwritable {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::open(dir.path(), "acme", "list", RetryPolicy::no_retry()).unwrap()
    }

    fn counts(n: u64) -> ResultCounts {
        let mut c = ResultCounts::new();
        c.insert("products".into(), n);
        c
    }

    #[test]
    fn mark_success_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let key = WorkKey::new("page-1");

        assert!(store.mark_success(&key, counts(12)).unwrap());
        let first = store.aggregate();
        assert!(!store.mark_success(&key, counts(99)).unwrap());

        assert_eq!(store.aggregate(), first);
        assert_eq!(first.total_success, 1);
        assert_eq!(first.total_extracted, 12);
    }

    #[test]
    fn terminal_states_are_exclusive_and_swap_counters() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let key = WorkKey::new("page-2");

        store.mark_zero_result(&key, "no listings").unwrap();
        assert_eq!(store.aggregate().total_zero_result, 1);

        store.mark_success(&key, counts(3)).unwrap();
        let agg = store.aggregate();
        assert_eq!(agg.total_zero_result, 0);
        assert_eq!(agg.total_success, 1);
        assert_eq!(agg.total_processed, 1);
        assert_eq!(store.unit(&key).unwrap().zero_reason, None);
    }

    #[test]
    fn failure_then_success_moves_unit_out_of_failed() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let key = WorkKey::new("Smart Plug");

        store.mark_failed(&key, "boom").unwrap();
        store.mark_failed(&key, "boom again").unwrap();
        assert_eq!(store.aggregate().total_failed, 1);
        assert_eq!(store.aggregate().errors, 2);

        store.mark_in_progress(&key).unwrap();
        assert_eq!(store.aggregate().total_failed, 1);

        store.mark_success(&WorkKey::new("smart  plug"), counts(1)).unwrap();
        let agg = store.aggregate();
        assert_eq!(agg.total_failed, 0);
        assert_eq!(agg.total_success, 1);
        assert_eq!(agg.total_processed, 1);
        assert_eq!(agg.errors, 2);
        assert_eq!(store.unit(&key).unwrap().attempts, 2);
    }

    #[test]
    fn failure_never_demotes_terminal_unit() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let key = WorkKey::new("page-3");

        store.mark_success(&key, counts(5)).unwrap();
        store.mark_failed(&key, "late error").unwrap();
        store.mark_in_progress(&key).unwrap();

        let unit = store.unit(&key).unwrap();
        assert_eq!(unit.status, UnitStatus::Success);
        assert_eq!(unit.attempts, 1);
        assert!(store.is_terminal(&key));
        assert_eq!(store.aggregate().total_failed, 0);
        assert_eq!(store.aggregate().errors, 1);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.mark_success(&WorkKey::new("a"), counts(2)).unwrap();
            store.mark_zero_result(&WorkKey::new("b"), "empty").unwrap();
            store.mark_in_progress(&WorkKey::new("c")).unwrap();
        }
        let reopened = open_store(&dir);
        assert!(reopened.is_terminal(&WorkKey::new("A")));
        assert!(reopened.is_terminal(&WorkKey::new("b")));
        assert!(!reopened.is_terminal(&WorkKey::new("c")));
        assert_eq!(reopened.snapshot().in_progress.as_deref(), Some("c"));
        assert_eq!(reopened.aggregate().total_processed, 2);
    }

    #[test]
    fn outcome_clears_in_progress_marker() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let key = WorkKey::new("x");
        store.mark_in_progress(&key).unwrap();
        store.mark_success(&key, counts(1)).unwrap();
        assert_eq!(store.snapshot().in_progress, None);
    }

    #[test]
    fn corrupt_file_is_backed_up_and_replaced() {
        let dir = TempDir::new().unwrap();
        let path = checkpoint_path(dir.path(), "acme", "list");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{\"schema_version\": 2, \"units\": {").unwrap();

        let store = open_store(&dir);
        assert_eq!(store.aggregate(), Aggregate::default());
        assert!(with_suffix(&path, ".corrupted").exists());

        store.mark_success(&WorkKey::new("k"), counts(1)).unwrap();
        assert!(read_checkpoint(&path).unwrap().is_some());
    }

    #[test]
    fn legacy_layout_is_upgraded_in_place() {
        let dir = TempDir::new().unwrap();
        let path = checkpoint_path(dir.path(), "acme", "list");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            br#"{"completed": ["Page 1", "page 2"], "zero_result": ["page 3"],
                "failed": {"page 4": "timeout", "page 1": "old"}, "current": "page 5"}"#,
        )
        .unwrap();

        let store = open_store(&dir);
        let agg = store.aggregate();
        assert_eq!(agg.total_success, 2);
        assert_eq!(agg.total_zero_result, 1);
        assert_eq!(agg.total_failed, 1);
        assert_eq!(agg.total_processed, 4);
        assert!(store.is_terminal(&WorkKey::new("page 1")));

        let on_disk = read_checkpoint(&path).unwrap().unwrap();
        assert_eq!(on_disk.schema_version, SCHEMA_VERSION);
        assert_eq!(on_disk.in_progress.as_deref(), Some("page 5"));
    }

    #[test]
    fn pending_filters_terminal_and_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.mark_success(&WorkKey::new("a"), counts(1)).unwrap();
        store.mark_failed(&WorkKey::new("b"), "x").unwrap();

        let keys: Vec<WorkKey> = ["a", "b", "c", "C "].into_iter().map(WorkKey::new).collect();
        let pending: Vec<String> = store
            .pending(&keys)
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();
        assert_eq!(pending, vec!["b", "c"]);

        let summary = store.summary_for(&keys);
        assert_eq!(
            summary,
            UnitSummary {
                success: 1,
                zero_result: 0,
                failed: 1,
                pending: 1
            }
        );
    }

    #[test]
    fn plan_drift_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let plan_a: Vec<WorkKey> = ["1", "2"].into_iter().map(WorkKey::new).collect();
        let plan_b: Vec<WorkKey> = ["1", "2", "3"].into_iter().map(WorkKey::new).collect();

        assert!(!store.record_plan(&plan_a).unwrap());
        assert!(!store.record_plan(&plan_a).unwrap());
        assert!(store.record_plan(&plan_b).unwrap());
    }

    #[test]
    fn completion_flag_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.mark_stage_complete().unwrap();
        assert!(open_store(&dir).is_stage_complete());
        store.clear_stage_complete().unwrap();
        assert!(!open_store(&dir).is_stage_complete());
    }

    #[test]
    fn reset_clears_everything() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.mark_success(&WorkKey::new("a"), counts(1)).unwrap();
        store.mark_stage_complete().unwrap();
        store.reset().unwrap();

        let snapshot = store.snapshot();
        assert!(snapshot.units.is_empty());
        assert_eq!(snapshot.completed_at, None);
        assert_eq!(snapshot.stage, "list");
    }

    #[test]
    fn remove_checkpoints_deletes_stage_files() {
        let dir = TempDir::new().unwrap();
        for stage in ["list", "detail"] {
            CheckpointStore::open(dir.path(), "acme", stage, RetryPolicy::no_retry())
                .unwrap()
                .persist()
                .unwrap();
        }
        assert_eq!(list_checkpoints(dir.path(), "acme").unwrap().len(), 2);
        assert_eq!(remove_checkpoints(dir.path(), "acme").unwrap(), 2);
        assert!(list_checkpoints(dir.path(), "acme").unwrap().is_empty());
    }

    #[test]
    fn unwritable_path_is_reported_after_retries() {
        let dir = TempDir::new().unwrap();
        let stage_dir = dir.path().join("stage");
        let store = CheckpointStore::open_at(
            stage_dir.join("list.json"),
            "acme",
            "list",
            RetryPolicy::new(2, Duration::from_millis(1)),
        )
        .unwrap();
        // A plain file where the checkpoint directory should be
        fs::write(&stage_dir, b"not a directory").unwrap();

        let err = store.mark_success(&WorkKey::new("a"), counts(1)).unwrap_err();
        assert!(matches!(err, CheckpointError::Unwritable { .. }));
    }

    #[derive(Debug, Clone)]
    enum Op {
        InProgress(u8),
        Success(u8, u64),
        Zero(u8),
        Failed(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::InProgress),
            (0u8..6, 0u64..20).prop_map(|(k, n)| Op::Success(k, n)),
            (0u8..6).prop_map(Op::Zero),
            (0u8..6).prop_map(Op::Failed),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn aggregates_match_recount(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir);
            let mut failures = 0;
            for op in ops {
                match op {
                    Op::InProgress(k) => { store.mark_in_progress(&WorkKey::new(format!("k{k}"))).unwrap(); }
                    Op::Success(k, n) => { store.mark_success(&WorkKey::new(format!("k{k}")), counts(n)).unwrap(); }
                    Op::Zero(k) => { store.mark_zero_result(&WorkKey::new(format!("k{k}")), "none").unwrap(); }
                    Op::Failed(k) => { store.mark_failed(&WorkKey::new(format!("k{k}")), "err").unwrap(); failures += 1; }
                }
            }
            let snapshot = store.snapshot();
            let recounted = Aggregate::recount(snapshot.units.values(), failures);
            prop_assert_eq!(snapshot.aggregate, recounted);
            let a = snapshot.aggregate;
            prop_assert_eq!(a.total_processed, a.total_success + a.total_zero_result + a.total_failed);
        }
    }
}
