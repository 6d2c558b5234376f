//! Cross-process advisory lock built on create-exclusive files.
//!
//! The lock file holds the owner's pid, a random ownership token and the acquisition
//! time. A lock whose recorded acquisition time is older than the staleness threshold is
//! reclaimed. Reclaimers serialize on a sibling `.reclaim` file and re-read the lock
//! before deleting it, so a lock taken after the stale one was removed is never deleted
//! by a slower waiter. Release deletes the file only if it still carries our token.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::infrastructure::atomic_file::with_suffix;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner_pid: u32,
    token: Uuid,
    acquired_at: DateTime<Utc>,
}

/// Lock acquisition settings
#[derive(Debug, Clone, Copy)]
pub struct FileLockOptions {
    pub stale_after: Duration,
    pub timeout: Duration,
}

impl Default for FileLockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: Uuid,
}

impl FileLock {
    /// Acquire the lock at `path`, polling until `options.timeout`.
    pub fn acquire(path: &Path, options: FileLockOptions) -> Result<Self, LockError> {
        let started = Instant::now();
        let token = Uuid::new_v4();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        loop {
            match try_create(path, token) {
                Ok(()) => {
                    debug!(lock = %path.display(), "🔒 Lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(seen) = stale_lock(path, options.stale_after) {
                        match reclaim(path, &seen, options.stale_after) {
                            Ok(true) => {
                                warn!(lock = %path.display(), ?seen, "Reclaimed stale lock");
                                continue;
                            }
                            Ok(false) => {}
                            Err(source) => {
                                return Err(LockError::Io {
                                    path: path.to_path_buf(),
                                    source,
                                });
                            }
                        }
                    }
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }

            let waited = started.elapsed();
            if waited >= options.timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn still_owned(&self) -> bool {
        fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok())
            .is_some_and(|record| record.token == self.token)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.still_owned() {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(lock = %self.path.display(), error = %err, "Failed to release lock");
            }
        } else {
            warn!(lock = %self.path.display(), "Lock was reclaimed by another holder");
        }
    }
}

fn try_create(path: &Path, token: Uuid) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let record = LockRecord {
        owner_pid: std::process::id(),
        token,
        acquired_at: Utc::now(),
    };
    let bytes = serde_json::to_vec(&record).map_err(io::Error::other)?;
    file.write_all(&bytes)?;
    file.sync_all()
}

/// What a waiter saw in a lock file it considers stale
#[derive(Debug, Clone, PartialEq, Eq)]
enum StaleLock {
    /// Parseable record acquired longer than the threshold ago
    Record(Uuid),
    /// Half-written or foreign file; judged by its mtime
    Unreadable(SystemTime),
}

/// The lock at `path` if it is stale. A file that vanished in the meantime is not stale
/// so the caller simply retries the create.
fn stale_lock(path: &Path, stale_after: Duration) -> Option<StaleLock> {
    let bytes = fs::read(path).ok()?;
    if let Ok(record) = serde_json::from_slice::<LockRecord>(&bytes) {
        let age = (Utc::now() - record.acquired_at).to_std().ok()?;
        return (age > stale_after).then_some(StaleLock::Record(record.token));
    }
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    let age = SystemTime::now().duration_since(modified).ok()?;
    (age > stale_after).then_some(StaleLock::Unreadable(modified))
}

/// Delete the lock at `path` if it still is the stale lock `seen`.
///
/// Returns `false` when another waiter holds the reclaim guard or the lock changed.
fn reclaim(path: &Path, seen: &StaleLock, stale_after: Duration) -> io::Result<bool> {
    let guard = with_suffix(path, ".reclaim");
    match OpenOptions::new().write(true).create_new(true).open(&guard) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            // A reclaimer that died inside the guard
            let abandoned = fs::metadata(&guard)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .is_some_and(|age| age > stale_after);
            if abandoned {
                let _ = fs::remove_file(&guard);
            }
            return Ok(false);
        }
        Err(err) => return Err(err),
    }

    let result = if stale_lock(path, stale_after).as_ref() == Some(seen) {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    } else {
        Ok(false)
    };
    if let Err(err) = fs::remove_file(&guard) {
        warn!(guard = %guard.display(), error = %err, "Failed to remove reclaim guard");
    }
    result
}
