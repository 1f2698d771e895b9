//! Plan Store (spec Section 4.4): `implementation_plan.json` under the
//! state directory.
//!
//! Grounded in the donor's CRUD-over-a-store shape (`loopd/src/storage.rs`)
//! and `loopd/src/scheduler.rs`'s `claim_next_run`/phase-transition pattern,
//! rewired from SQLite rows to a single JSON file under `fileutil`'s
//! atomic-write + lock discipline.

use crate::fileutil::{self, ReadLock, WriteLock};
use crate::types::{ImplementationPlan, Subtask, SubtaskId, SubtaskStatus};
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanStoreError {
    #[error("io error: {0}")]
    Io(#[from] crate::fileutil::FileUtilError),
    #[error("failed to parse plan store at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize plan")]
    Serialize(#[from] serde_json::Error),
    #[error("no plan exists yet")]
    NotFound,
    #[error("duplicate subtask id: {0}")]
    DuplicateId(String),
    #[error("subtask not found: {0}")]
    SubtaskNotFound(String),
}

pub type Result<T> = std::result::Result<T, PlanStoreError>;

/// File-backed store for the Implementation Plan.
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("implementation_plan.json"),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the plan exactly once (Section 3 lifecycle: created by the
    /// Initializer, never again). Subtask identifiers must be unique.
    pub fn create(&self, task_name: &str, subtasks: Vec<Subtask>) -> Result<ImplementationPlan> {
        let mut seen = std::collections::HashSet::new();
        for s in &subtasks {
            if !seen.insert(s.id.0.clone()) {
                return Err(PlanStoreError::DuplicateId(s.id.0.clone()));
            }
        }
        let plan = ImplementationPlan::new(task_name, subtasks);
        let _lock = WriteLock::acquire(&self.path)?;
        self.write_locked(&plan)?;
        Ok(plan)
    }

    /// Load the current plan. Shared-locked against concurrent readers.
    pub fn load(&self) -> Result<ImplementationPlan> {
        let _lock = ReadLock::acquire(&self.path)?;
        let contents = fileutil::read_to_string_if_exists(&self.path)?
            .ok_or(PlanStoreError::NotFound)?;
        serde_json::from_str(&contents).map_err(|source| PlanStoreError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn write_locked(&self, plan: &ImplementationPlan) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(plan)?;
        fileutil::atomic_write(&self.path, &bytes)?;
        Ok(())
    }

    /// Persist a full plan value (used by mutation helpers below, which
    /// read-modify-write under a single exclusive lock to avoid lost
    /// updates between concurrent writers).
    pub fn save(&self, plan: &mut ImplementationPlan) -> Result<()> {
        plan.updated_at = Utc::now();
        let _lock = WriteLock::acquire(&self.path)?;
        self.write_locked(plan)
    }

    /// Returns the first IN_PROGRESS subtask if any (resume-safety rule: an
    /// interrupted subtask is preferred over a fresh one), otherwise the
    /// first PENDING subtask, otherwise `None`. This ordering is a
    /// correctness invariant of the whole system (Section 4.4, 8).
    pub fn get_next_subtask(&self) -> Result<Option<Subtask>> {
        let plan = self.load()?;
        Ok(Self::next_from(&plan))
    }

    fn next_from(plan: &ImplementationPlan) -> Option<Subtask> {
        plan.subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::InProgress)
            .or_else(|| {
                plan.subtasks
                    .iter()
                    .find(|s| s.status == SubtaskStatus::Pending)
            })
            .cloned()
    }

    fn mutate(&self, id: &SubtaskId, f: impl FnOnce(&mut Subtask)) -> Result<()> {
        let _lock = WriteLock::acquire(&self.path)?;
        let contents = fileutil::read_to_string_if_exists(&self.path)?
            .ok_or(PlanStoreError::NotFound)?;
        let mut plan: ImplementationPlan =
            serde_json::from_str(&contents).map_err(|source| PlanStoreError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;
        let subtask = plan
            .find_mut(id)
            .ok_or_else(|| PlanStoreError::SubtaskNotFound(id.0.clone()))?;
        f(subtask);
        plan.updated_at = Utc::now();
        self.write_locked(&plan)
    }

    pub fn mark_in_progress(&self, id: &SubtaskId) -> Result<()> {
        self.mutate(id, |s| s.status = SubtaskStatus::InProgress)
    }

    pub fn mark_complete(&self, id: &SubtaskId) -> Result<()> {
        self.mutate(id, |s| s.status = SubtaskStatus::Completed)
    }

    pub fn mark_failed(&self, id: &SubtaskId) -> Result<()> {
        self.mutate(id, |s| s.status = SubtaskStatus::Failed)
    }

    /// Revert a subtask to PENDING (Review/QA rejection bound exceeded;
    /// Section 4.1, 4.9, 4.10).
    pub fn revert_to_pending(&self, id: &SubtaskId) -> Result<()> {
        self.mutate(id, |s| s.status = SubtaskStatus::Pending)
    }

    pub fn increment_attempts(&self, id: &SubtaskId, approach: Option<String>) -> Result<()> {
        self.mutate(id, |s| {
            s.attempts += 1;
            if let Some(a) = approach {
                s.last_approach = Some(a);
            }
        })
    }

    pub fn completion_stats(&self) -> Result<(usize, usize)> {
        Ok(self.load()?.completion_stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, PlanStore) {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn create_then_load_round_trips_up_to_updated_at() {
        let (_dir, store) = store();
        let created = store
            .create("task", vec![Subtask::new("a", "do a"), Subtask::new("b", "do b")])
            .unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.task_name, created.task_name);
        assert_eq!(loaded.subtasks.len(), 2);
        assert_eq!(loaded.created_at, created.created_at);
    }

    #[test]
    fn create_rejects_duplicate_ids() {
        let (_dir, store) = store();
        let result = store.create("task", vec![Subtask::new("a", "x"), Subtask::new("a", "y")]);
        assert!(matches!(result, Err(PlanStoreError::DuplicateId(_))));
    }

    #[test]
    fn get_next_subtask_prefers_in_progress_over_pending() {
        let (_dir, store) = store();
        store
            .create(
                "task",
                vec![Subtask::new("a", "x"), Subtask::new("b", "y")],
            )
            .unwrap();
        store.mark_in_progress(&SubtaskId::new("b")).unwrap();
        let next = store.get_next_subtask().unwrap().unwrap();
        assert_eq!(next.id, SubtaskId::new("b"));
    }

    #[test]
    fn get_next_subtask_falls_back_to_pending() {
        let (_dir, store) = store();
        store.create("task", vec![Subtask::new("a", "x")]).unwrap();
        let next = store.get_next_subtask().unwrap().unwrap();
        assert_eq!(next.id, SubtaskId::new("a"));
    }

    #[test]
    fn get_next_subtask_never_returns_completed_or_failed_while_others_exist() {
        let (_dir, store) = store();
        store
            .create(
                "task",
                vec![Subtask::new("a", "x"), Subtask::new("b", "y")],
            )
            .unwrap();
        store.mark_complete(&SubtaskId::new("a")).unwrap();
        let next = store.get_next_subtask().unwrap().unwrap();
        assert_eq!(next.id, SubtaskId::new("b"));
    }

    #[test]
    fn get_next_subtask_none_when_all_resolved() {
        let (_dir, store) = store();
        store.create("task", vec![Subtask::new("a", "x")]).unwrap();
        store.mark_complete(&SubtaskId::new("a")).unwrap();
        assert!(store.get_next_subtask().unwrap().is_none());
    }

    #[test]
    fn mark_complete_updates_status() {
        let (_dir, store) = store();
        store.create("task", vec![Subtask::new("a", "x")]).unwrap();
        store.mark_complete(&SubtaskId::new("a")).unwrap();
        let plan = store.load().unwrap();
        assert_eq!(plan.subtasks[0].status, SubtaskStatus::Completed);
    }

    #[test]
    fn increment_attempts_records_approach() {
        let (_dir, store) = store();
        store.create("task", vec![Subtask::new("a", "x")]).unwrap();
        store
            .increment_attempts(&SubtaskId::new("a"), Some("tried recursion".into()))
            .unwrap();
        let plan = store.load().unwrap();
        assert_eq!(plan.subtasks[0].attempts, 1);
        assert_eq!(
            plan.subtasks[0].last_approach.as_deref(),
            Some("tried recursion")
        );
    }

    #[test]
    fn revert_to_pending_resets_status() {
        let (_dir, store) = store();
        store.create("task", vec![Subtask::new("a", "x")]).unwrap();
        store.mark_in_progress(&SubtaskId::new("a")).unwrap();
        store.revert_to_pending(&SubtaskId::new("a")).unwrap();
        let plan = store.load().unwrap();
        assert_eq!(plan.subtasks[0].status, SubtaskStatus::Pending);
    }

    #[test]
    fn load_before_create_errors_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.load(), Err(PlanStoreError::NotFound)));
    }

    #[test]
    fn completion_stats_counts_correctly() {
        let (_dir, store) = store();
        store
            .create(
                "task",
                vec![Subtask::new("a", "x"), Subtask::new("b", "y")],
            )
            .unwrap();
        store.mark_complete(&SubtaskId::new("a")).unwrap();
        assert_eq!(store.completion_stats().unwrap(), (1, 2));
    }
}
