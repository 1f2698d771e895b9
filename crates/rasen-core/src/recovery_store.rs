//! Recovery Store (spec Section 4.5): `attempt_history.json` and
//! `good_commits.json` under the state directory.
//!
//! Two append-only logs, grounded in the donor `loopd/src/storage.rs` CRUD
//! pattern, rewired to flat JSON arrays under `fileutil`'s lock discipline.
//! Good-commit records never shrink (Section 3, 8): this module never
//! exposes a delete or truncate operation on either log.

use crate::fileutil::{self, ReadLock, WriteLock};
use crate::types::{AttemptRecord, GoodCommitRecord, SubtaskId};
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryStoreError {
    #[error("io error: {0}")]
    Io(#[from] crate::fileutil::FileUtilError),
    #[error("failed to parse recovery store at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize recovery record")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RecoveryStoreError>;

pub struct RecoveryStore {
    attempts_path: PathBuf,
    good_commits_path: PathBuf,
}

fn load_vec<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let _lock = ReadLock::acquire(path)?;
    match fileutil::read_to_string_if_exists(path)? {
        None => Ok(Vec::new()),
        Some(contents) => {
            serde_json::from_str(&contents).map_err(|source| RecoveryStoreError::Parse {
                path: path.display().to_string(),
                source,
            })
        }
    }
}

impl RecoveryStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            attempts_path: state_dir.join("attempt_history.json"),
            good_commits_path: state_dir.join("good_commits.json"),
        }
    }

    fn load_attempts(&self) -> Result<Vec<AttemptRecord>> {
        load_vec(&self.attempts_path)
    }

    fn load_good_commits(&self) -> Result<Vec<GoodCommitRecord>> {
        load_vec(&self.good_commits_path)
    }

    pub fn record_attempt(
        &self,
        subtask_id: &SubtaskId,
        session_ordinal: u64,
        success: bool,
        approach: impl Into<String>,
        commit: Option<String>,
    ) -> Result<()> {
        let _lock = WriteLock::acquire(&self.attempts_path)?;
        let mut attempts = match fileutil::read_to_string_if_exists(&self.attempts_path)? {
            None => Vec::new(),
            Some(c) => serde_json::from_str::<Vec<AttemptRecord>>(&c).map_err(|source| {
                RecoveryStoreError::Parse {
                    path: self.attempts_path.display().to_string(),
                    source,
                }
            })?,
        };
        attempts.push(AttemptRecord {
            subtask_id: subtask_id.clone(),
            session_ordinal,
            success,
            approach: approach.into(),
            commit,
            timestamp: Utc::now(),
        });
        let bytes = serde_json::to_vec_pretty(&attempts)?;
        fileutil::atomic_write(&self.attempts_path, &bytes)?;
        Ok(())
    }

    pub fn record_good_commit(&self, commit: impl Into<String>, subtask_id: &SubtaskId) -> Result<()> {
        let _lock = WriteLock::acquire(&self.good_commits_path)?;
        let mut commits = match fileutil::read_to_string_if_exists(&self.good_commits_path)? {
            None => Vec::new(),
            Some(c) => serde_json::from_str::<Vec<GoodCommitRecord>>(&c).map_err(|source| {
                RecoveryStoreError::Parse {
                    path: self.good_commits_path.display().to_string(),
                    source,
                }
            })?,
        };
        commits.push(GoodCommitRecord {
            commit: commit.into(),
            subtask_id: subtask_id.clone(),
            timestamp: Utc::now(),
        });
        let bytes = serde_json::to_vec_pretty(&commits)?;
        fileutil::atomic_write(&self.good_commits_path, &bytes)?;
        Ok(())
    }

    /// Approach strings from failed attempts against `subtask_id`, oldest
    /// first, for Coder prompt injection (Section 4.5).
    pub fn failed_approaches(&self, subtask_id: &SubtaskId) -> Result<Vec<String>> {
        Ok(self
            .load_attempts()?
            .into_iter()
            .filter(|a| &a.subtask_id == subtask_id && !a.success)
            .map(|a| a.approach)
            .collect())
    }

    pub fn attempt_count(&self, subtask_id: &SubtaskId) -> Result<u64> {
        Ok(self
            .load_attempts()?
            .iter()
            .filter(|a| &a.subtask_id == subtask_id)
            .count() as u64)
    }

    pub fn last_good_commit(&self) -> Result<Option<String>> {
        Ok(self.load_good_commits()?.last().map(|r| r.commit.clone()))
    }

    /// All recorded attempts against `subtask_id`, oldest first.
    pub fn attempts_for(&self, subtask_id: &SubtaskId) -> Result<Vec<AttemptRecord>> {
        Ok(self
            .load_attempts()?
            .into_iter()
            .filter(|a| &a.subtask_id == subtask_id)
            .collect())
    }

    /// True when the `threshold` most recent attempts for `subtask_id` are
    /// all failures (Section 4.5, 4.11). Fewer than `threshold` attempts
    /// recorded is never thrashing.
    pub fn is_thrashing(&self, subtask_id: &SubtaskId, threshold: usize) -> Result<bool> {
        let attempts = self.attempts_for(subtask_id)?;
        if attempts.len() < threshold {
            return Ok(false);
        }
        Ok(attempts[attempts.len() - threshold..]
            .iter()
            .all(|a| !a.success))
    }

    /// All attempt records across every subtask, oldest first. Used by the
    /// Stall Detector's cross-subtask consecutive-failure predicate.
    pub fn all_attempts(&self) -> Result<Vec<AttemptRecord>> {
        self.load_attempts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, RecoveryStore) {
        let dir = TempDir::new().unwrap();
        let store = RecoveryStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn record_and_count_attempts() {
        let (_dir, store) = store();
        let id = SubtaskId::new("a");
        store.record_attempt(&id, 1, false, "tried x", None).unwrap();
        store.record_attempt(&id, 2, true, "tried y", Some("abc123".into())).unwrap();
        assert_eq!(store.attempt_count(&id).unwrap(), 2);
    }

    #[test]
    fn failed_approaches_filters_by_success() {
        let (_dir, store) = store();
        let id = SubtaskId::new("a");
        store.record_attempt(&id, 1, false, "approach 1", None).unwrap();
        store.record_attempt(&id, 2, true, "approach 2", Some("c1".into())).unwrap();
        store.record_attempt(&id, 3, false, "approach 3", None).unwrap();
        let failed = store.failed_approaches(&id).unwrap();
        assert_eq!(failed, vec!["approach 1", "approach 3"]);
    }

    #[test]
    fn good_commits_append_only_and_last_is_most_recent() {
        let (_dir, store) = store();
        let id = SubtaskId::new("a");
        store.record_good_commit("c1", &id).unwrap();
        store.record_good_commit("c2", &id).unwrap();
        assert_eq!(store.last_good_commit().unwrap(), Some("c2".to_string()));
        assert_eq!(store.load_good_commits().unwrap().len(), 2);
    }

    #[test]
    fn is_thrashing_true_when_last_n_all_fail() {
        let (_dir, store) = store();
        let id = SubtaskId::new("a");
        for i in 0..3 {
            store.record_attempt(&id, i, false, format!("try {i}"), None).unwrap();
        }
        assert!(store.is_thrashing(&id, 3).unwrap());
    }

    #[test]
    fn is_thrashing_false_when_one_recent_succeeds() {
        let (_dir, store) = store();
        let id = SubtaskId::new("a");
        store.record_attempt(&id, 1, false, "a", None).unwrap();
        store.record_attempt(&id, 2, true, "b", Some("c1".into())).unwrap();
        store.record_attempt(&id, 3, false, "c", None).unwrap();
        assert!(!store.is_thrashing(&id, 3).unwrap());
    }

    #[test]
    fn is_thrashing_false_below_threshold() {
        let (_dir, store) = store();
        let id = SubtaskId::new("a");
        store.record_attempt(&id, 1, false, "a", None).unwrap();
        assert!(!store.is_thrashing(&id, 3).unwrap());
    }
}
