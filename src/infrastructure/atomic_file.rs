//! Atomic file replacement.
//!
//! Write to a temp file in the target's directory, fsync it, rename it over the target,
//! then fsync the directory. A concurrent reader sees either the old or the new bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

/// Atomically replace `path` with `bytes`, creating parent directories as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    fs::create_dir_all(&parent)?;

    let temp_path = temp_path_for(path);
    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    // Directory fsync is best effort; not every platform supports opening a directory.
    if let Ok(dir) = File::open(&parent) {
        if let Err(sync_err) = dir.sync_all() {
            warn!(
                dir = %parent.display(),
                error = %sync_err,
                "directory fsync failed after atomic replace"
            );
        }
    }
    Ok(())
}

/// `<dir>/.<name>.<pid>.<rand>.tmp`; unique per writer so two writers never share a temp file.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "file".into(), |n| n.to_string_lossy().into_owned());
    let temp_name = format!(
        ".{name}.{}.{:08x}.tmp",
        std::process::id(),
        fastrand::u32(..)
    );
    path.with_file_name(temp_name)
}

/// Sibling path with an extra extension appended, e.g. `stage.json` -> `stage.json.corrupted`.
#[must_use]
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
