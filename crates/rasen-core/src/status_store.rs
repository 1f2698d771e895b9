//! Status Store (spec Section 4.8): `status.json` under the state
//! directory, a single live snapshot for external observers (a status
//! command, a dashboard, a CI job).
//!
//! Grounded in the donor `loopd/src/postmortem.rs`'s `RunSummary` struct →
//! `serde_json::to_string_pretty` → atomic write idiom, adapted here to a
//! live-updated single snapshot instead of a write-once postmortem.

use crate::fileutil::{self, ReadLock, WriteLock};
use crate::types::StatusSnapshot;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusStoreError {
    #[error("io error: {0}")]
    Io(#[from] crate::fileutil::FileUtilError),
    #[error("failed to parse status store at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize status snapshot")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StatusStoreError>;

pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// All writes are atomic (Section 4.8); timestamps are ISO-8601 UTC via
    /// `chrono::DateTime<Utc>`'s own `serde` impl.
    pub fn write(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let _lock = WriteLock::acquire(&self.path)?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        fileutil::atomic_write(&self.path, &bytes)?;
        Ok(())
    }

    pub fn read(&self) -> Result<Option<StatusSnapshot>> {
        let _lock = ReadLock::acquire(&self.path)?;
        match fileutil::read_to_string_if_exists(&self.path)? {
            None => Ok(None),
            Some(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|source| StatusStoreError::Parse {
                    path: self.path.display().to_string(),
                    source,
                }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            pid: 1234,
            start_time: Utc::now(),
            iteration: 1,
            subtask_id: Some("a".into()),
            subtask_description: Some("do a".into()),
            subtasks_completed: 0,
            subtasks_total: 1,
            session_start_time: Some(Utc::now()),
            last_activity_at: Utc::now(),
            commits_this_session: 0,
            overall_status: "running".into(),
            consecutive_failures: 0,
            termination_reason: None,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::new(dir.path().join("status.json"));
        let snap = snapshot();
        store.write(&snap).unwrap();
        let read = store.read().unwrap().unwrap();
        assert_eq!(read.pid, snap.pid);
        assert_eq!(read.iteration, snap.iteration);
    }

    #[test]
    fn read_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::new(dir.path().join("status.json"));
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn last_activity_monotonic_across_writes() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::new(dir.path().join("status.json"));
        let mut snap = snapshot();
        store.write(&snap).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        snap.last_activity_at = Utc::now();
        snap.iteration = 2;
        store.write(&snap).unwrap();
        let read = store.read().unwrap().unwrap();
        assert_eq!(read.iteration, 2);
        assert!(read.last_activity_at >= snap.start_time);
    }
}
