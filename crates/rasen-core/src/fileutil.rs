//! Atomic, lock-protected file I/O shared by the Plan, Recovery, Memory, and
//! Status stores (spec Section 3, 4.4, 5).
//!
//! Grounded in the donor's write-then-checksum artifact-writing style
//! (`loop-core/src/artifacts.rs`) plus the `fs2`-based pidfile-gate precedent
//! (`other_examples/8a506428_groblegark-oddjobs__crates-daemon-src-
//! lifecycle.rs.rs`): writers take an exclusive `fs2` lock, readers a shared
//! one, and every write goes through a temp-file + fsync + rename sequence
//! so a crash mid-write never leaves a partial file in place.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileUtilError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, FileUtilError>;

fn io_err(path: &Path, source: std::io::Error) -> FileUtilError {
    FileUtilError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Hold an exclusive advisory lock on a sidecar `<path>.lock` file for the
/// duration of a write. Using a sidecar rather than locking the target file
/// itself means the lock survives the rename-in-place swap.
pub struct WriteLock {
    _file: File,
}

/// Hold a shared advisory lock on a sidecar `<path>.lock` file for the
/// duration of a read. Compatible with concurrent shared readers; excluded
/// by a concurrent `WriteLock`.
pub struct ReadLock {
    _file: File,
}

fn lock_path(path: &Path) -> std::path::PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".lock");
    std::path::PathBuf::from(p)
}

impl WriteLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let lp = lock_path(path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lp)
            .map_err(|e| io_err(&lp, e))?;
        file.lock_exclusive().map_err(|e| io_err(&lp, e))?;
        Ok(Self { _file: file })
    }
}

impl ReadLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let lp = lock_path(path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lp)
            .map_err(|e| io_err(&lp, e))?;
        file.lock_shared().map_err(|e| io_err(&lp, e))?;
        Ok(Self { _file: file })
    }
}

/// Atomically write `contents` to `path`: write to a temp file in the same
/// directory, fsync it, then rename over the target. On any failure the
/// temp file is removed so no stray partial file remains.
///
/// Must be called while holding a `WriteLock` for `path`.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("rasen-store")
    ));

    let write_result = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp_path)?;
        f.write_all(contents)?;
        f.sync_all()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(&tmp_path, e));
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(path, e));
    }

    Ok(())
}

pub fn read_to_string_if_exists(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|e| io_err(path, e))
}
