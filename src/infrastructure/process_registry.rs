//! # Process Registry
//!
//! Tracks the OS pids (webdriver + browser) spawned under each scraper identity, on disk,
//! so that a stop request from any OS process terminates exactly the pids of one
//! identity. Pids registered by any *other* identity are never killed, even when they
//! also appear in the identity being terminated.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::infrastructure::atomic_file::write_atomic;
use crate::infrastructure::checkpoint_store::sanitize_component;
use crate::infrastructure::file_lock::{FileLock, FileLockOptions, LockError};
use crate::infrastructure::retry_manager::RetryPolicy;
use crate::utils::lock_or_recover;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry lock failed: {0}")]
    Lock(#[from] LockError),

    /// Writing failed after all retries. Fatal for the run.
    #[error("registry file {path} is unwritable: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize registry entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// On-disk record for one scraper identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRegistryEntry {
    pub scraper_name: String,
    pub pids: BTreeSet<u32>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessRegistryEntry {
    fn empty(scraper: &str) -> Self {
        Self {
            scraper_name: scraper.to_string(),
            pids: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Marker left by a supervisor asking a running pipeline to stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub requested_by: u32,
    pub requested_at: DateTime<Utc>,
}

/// Outcome of [`ProcessRegistry::terminate`] and [`ProcessRegistry::reap`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TerminateReport {
    pub scraper: String,
    /// Pids that were alive and were killed
    pub terminated: usize,
    /// Registered pids that were no longer running
    pub already_gone: usize,
    /// Pids skipped because another identity (or this coordinator) owns them
    pub protected: usize,
    /// Live descendants collected alongside the registered pids
    pub descendants: usize,
    /// Kill attempts that failed (permission denied and the like)
    pub failed: usize,
}

impl fmt::Display for TerminateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: terminated={} already_gone={} protected={} descendants={} failed={}",
            self.scraper,
            self.terminated,
            self.already_gone,
            self.protected,
            self.descendants,
            self.failed
        )
    }
}

/// View of the OS process table
pub trait ProcessControl: Send + Sync {
    /// Running processes as `pid -> parent pid`. Zombies are excluded.
    fn live_processes(&self) -> HashMap<u32, Option<u32>>;

    /// Forcefully terminate `pid`. Returns `false` when the signal could not be sent.
    fn kill(&self, pid: u32) -> bool;
}

/// [`ProcessControl`] backed by `sysinfo`
#[derive(Default)]
pub struct SystemProcesses {
    system: Mutex<System>,
}

impl SystemProcesses {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessControl for SystemProcesses {
    fn live_processes(&self) -> HashMap<u32, Option<u32>> {
        let mut system = lock_or_recover(&self.system);
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .iter()
            .filter(|(_, process)| {
                !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
            })
            .map(|(pid, process)| (pid.as_u32(), process.parent().map(Pid::as_u32)))
            .collect()
    }

    fn kill(&self, pid: u32) -> bool {
        let system = lock_or_recover(&self.system);
        system
            .process(Pid::from_u32(pid))
            .is_some_and(sysinfo::Process::kill)
    }
}

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// `<data_dir>/registry`
    pub dir: PathBuf,
    pub lock: FileLockOptions,
    pub retry: RetryPolicy,
}

impl RegistryConfig {
    #[must_use]
    pub fn under(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("registry"),
            lock: FileLockOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared-on-disk pid registry, constructed once per run and passed around by `Arc`
pub struct ProcessRegistry {
    config: RegistryConfig,
    processes: Box<dyn ProcessControl>,
}

impl fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProcessRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_process_control(config, Box::new(SystemProcesses::new()))
    }

    #[must_use]
    pub fn with_process_control(config: RegistryConfig, processes: Box<dyn ProcessControl>) -> Self {
        Self { config, processes }
    }

    #[must_use]
    pub fn entry_path(&self, scraper: &str) -> PathBuf {
        self.config
            .dir
            .join(format!("{}.json", sanitize_component(scraper)))
    }

    fn lock_path(&self, scraper: &str) -> PathBuf {
        self.config
            .dir
            .join(format!("{}.lock", sanitize_component(scraper)))
    }

    fn lock(&self, scraper: &str) -> Result<FileLock, RegistryError> {
        Ok(FileLock::acquire(&self.lock_path(scraper), self.config.lock)?)
    }

    /// Union `pids` into the identity's on-disk set. Repeat calls are harmless.
    pub fn register(&self, scraper: &str, pids: &[u32]) -> Result<(), RegistryError> {
        if pids.is_empty() {
            return Ok(());
        }
        let _lock = self.lock(scraper)?;
        let mut entry = self.read_entry(scraper)?;
        let before = entry.pids.len();
        entry.pids.extend(pids.iter().copied());
        if entry.pids.len() == before {
            return Ok(());
        }
        self.write_entry(&mut entry)?;
        debug!(scraper, ?pids, total = entry.pids.len(), "📝 Registered pids");
        Ok(())
    }

    /// Remove `pids` from the identity's set (session closed cleanly).
    pub fn unregister(&self, scraper: &str, pids: &[u32]) -> Result<(), RegistryError> {
        if pids.is_empty() {
            return Ok(());
        }
        let _lock = self.lock(scraper)?;
        let mut entry = self.read_entry(scraper)?;
        let before = entry.pids.len();
        for pid in pids {
            entry.pids.remove(pid);
        }
        if entry.pids.len() == before {
            return Ok(());
        }
        if entry.pids.is_empty() {
            self.remove_entry(scraper)?;
        } else {
            self.write_entry(&mut entry)?;
        }
        debug!(scraper, ?pids, remaining = entry.pids.len(), "Unregistered pids");
        Ok(())
    }

    /// Pids currently registered to `scraper`
    pub fn pids_for(&self, scraper: &str) -> Result<BTreeSet<u32>, RegistryError> {
        Ok(self.read_entry(scraper)?.pids)
    }

    /// Identities that currently have a registry file
    pub fn identities(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .foreign_entries(None)?
            .into_iter()
            .map(|entry| entry.scraper_name)
            .collect())
    }

    /// Kill every live pid registered to `scraper` (plus their live descendants) that no
    /// other identity has registered, then delete the identity's registry file.
    ///
    /// Individual kill failures are counted, never fatal. Calling this twice is a no-op
    /// the second time.
    pub fn terminate(&self, scraper: &str) -> Result<TerminateReport, RegistryError> {
        let _lock = self.lock(scraper)?;
        let entry = self.read_entry(scraper)?;
        let mut report = TerminateReport {
            scraper: scraper.to_string(),
            ..TerminateReport::default()
        };

        self.kill_unowned(scraper, &entry.pids, &mut report)?;

        self.remove_entry(scraper)?;
        info!(%report, "🧹 Terminated registered processes");
        Ok(report)
    }

    /// Kill the pids of one session that could not be closed (plus their live
    /// descendants) and drop them from the identity's set.
    ///
    /// Pids that could not be killed stay registered so that `terminate` retries them.
    pub fn reap(&self, scraper: &str, pids: &[u32]) -> Result<TerminateReport, RegistryError> {
        let mut report = TerminateReport {
            scraper: scraper.to_string(),
            ..TerminateReport::default()
        };
        if pids.is_empty() {
            return Ok(report);
        }
        let _lock = self.lock(scraper)?;
        let roots: BTreeSet<u32> = pids.iter().copied().collect();
        let survivors = self.kill_unowned(scraper, &roots, &mut report)?;

        let mut entry = self.read_entry(scraper)?;
        let before = entry.pids.len();
        entry
            .pids
            .retain(|pid| !roots.contains(pid) || survivors.contains(pid));
        if entry.pids.len() != before {
            if entry.pids.is_empty() {
                self.remove_entry(scraper)?;
            } else {
                self.write_entry(&mut entry)?;
            }
        }
        info!(%report, "🔪 Killed processes of an unclosable session");
        Ok(report)
    }

    /// Kill live `roots` and their descendants unless another identity (or this
    /// coordinator) owns them. Returns the roots whose kill failed.
    fn kill_unowned(
        &self,
        scraper: &str,
        roots: &BTreeSet<u32>,
        report: &mut TerminateReport,
    ) -> Result<BTreeSet<u32>, RegistryError> {
        let mut survivors = BTreeSet::new();
        if roots.is_empty() {
            return Ok(survivors);
        }
        let mut protected: HashSet<u32> = self
            .foreign_entries(Some(scraper))?
            .into_iter()
            .flat_map(|e| e.pids)
            .collect();
        protected.insert(std::process::id());

        let live = self.processes.live_processes();
        let descendants = collect_descendants(&live, roots);

        let mut targets: Vec<(u32, bool)> = roots.iter().map(|&p| (p, false)).collect();
        targets.extend(descendants.iter().map(|&p| (p, true)));

        for (pid, is_descendant) in targets {
            if protected.contains(&pid) {
                debug!(scraper, pid, "🛡️ Skipping pid owned by another identity");
                report.protected += 1;
                continue;
            }
            if !live.contains_key(&pid) {
                report.already_gone += 1;
                continue;
            }
            if self.processes.kill(pid) {
                report.terminated += 1;
                if is_descendant {
                    report.descendants += 1;
                }
            } else {
                warn!(scraper, pid, "Failed to kill process");
                report.failed += 1;
                if !is_descendant {
                    survivors.insert(pid);
                }
            }
        }
        Ok(survivors)
    }

    fn stop_path(&self, scraper: &str) -> PathBuf {
        self.config
            .dir
            .join(format!("{}.stop", sanitize_component(scraper)))
    }

    /// Leave a stop request for a pipeline of `scraper` running in another process
    pub fn request_stop(&self, scraper: &str) -> Result<(), RegistryError> {
        let path = self.stop_path(scraper);
        let request = StopRequest {
            requested_by: std::process::id(),
            requested_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&request)?;
        self.config
            .retry
            .run(|_| write_atomic(&path, &bytes), |_| true)
            .map_err(|source| RegistryError::Unwritable { path, source })
    }

    #[must_use]
    pub fn stop_requested(&self, scraper: &str) -> bool {
        self.stop_path(scraper).exists()
    }

    pub fn clear_stop_request(&self, scraper: &str) -> Result<(), RegistryError> {
        let path = self.stop_path(scraper);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RegistryError::Io { path, source }),
        }
    }

    fn read_entry(&self, scraper: &str) -> Result<ProcessRegistryEntry, RegistryError> {
        let path = self.entry_path(scraper);
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<ProcessRegistryEntry>(&bytes) {
                Ok(entry) => Ok(entry),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Unreadable registry entry, treating as empty");
                    Ok(ProcessRegistryEntry::empty(scraper))
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(ProcessRegistryEntry::empty(scraper))
            }
            Err(source) => Err(RegistryError::Io { path, source }),
        }
    }

    fn write_entry(&self, entry: &mut ProcessRegistryEntry) -> Result<(), RegistryError> {
        entry.updated_at = Utc::now();
        let path = self.entry_path(&entry.scraper_name);
        let bytes = serde_json::to_vec_pretty(entry)?;
        self.config
            .retry
            .run(|_| write_atomic(&path, &bytes), |_| true)
            .map_err(|source| RegistryError::Unwritable { path, source })
    }

    fn remove_entry(&self, scraper: &str) -> Result<(), RegistryError> {
        let path = self.entry_path(scraper);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RegistryError::Unwritable { path, source }),
        }
    }

    /// Every parseable entry in the registry directory except `exclude`'s own file
    fn foreign_entries(
        &self,
        exclude: Option<&str>,
    ) -> Result<Vec<ProcessRegistryEntry>, RegistryError> {
        let dir = &self.config.dir;
        let read_dir = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: dir.clone(),
                    source,
                });
            }
        };
        let own = exclude.map(|scraper| self.entry_path(scraper));

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let path = match dir_entry {
                Ok(dir_entry) => dir_entry.path(),
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "Failed to list registry entry");
                    continue;
                }
            };
            if path.extension().is_none_or(|ext| ext != "json") || own.as_ref() == Some(&path) {
                continue;
            }
            match fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice::<ProcessRegistryEntry>(&b).map_err(|e| e.to_string()))
            {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable registry file");
                }
            }
        }
        entries.sort_by(|a, b| a.scraper_name.cmp(&b.scraper_name));
        Ok(entries)
    }
}

/// Live descendants (children, grandchildren, ...) of `roots`, excluding the roots.
fn collect_descendants(live: &HashMap<u32, Option<u32>>, roots: &BTreeSet<u32>) -> BTreeSet<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (&pid, parent) in live {
        if let Some(parent) = parent {
            children.entry(*parent).or_default().push(pid);
        }
    }

    let mut found = BTreeSet::new();
    let mut queue: VecDeque<u32> = roots.iter().copied().collect();
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if !roots.contains(&child) && found.insert(child) {
                queue.push_back(child);
            }
        }
    }
    found
}
