//! Core data model for the orchestrator (spec Section 3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, stable subtask identifier chosen by the Initializer session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubtaskId(pub String);

impl SubtaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SubtaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Subtask lifecycle status (Section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// A single unit of work in the Implementation Plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub description: String,
    pub status: SubtaskStatus,
    /// Number of Coder attempts made against this subtask.
    pub attempts: u32,
    /// Free-text note on the last approach tried, for failed-approach injection.
    pub last_approach: Option<String>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: SubtaskId::new(id),
            description: description.into(),
            status: SubtaskStatus::Pending,
            attempts: 0,
            last_approach: None,
        }
    }
}

/// Ordered sequence of Subtasks with task-level metadata (Section 3).
///
/// Invariant: identifiers are unique; ordering is meaningful (dependency
/// order chosen by the Initializer); only the supervisor mutates status and
/// attempt counters once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub task_name: String,
    pub subtasks: Vec<Subtask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImplementationPlan {
    pub fn new(task_name: impl Into<String>, subtasks: Vec<Subtask>) -> Self {
        let now = Utc::now();
        Self {
            task_name: task_name.into(),
            subtasks,
            created_at: now,
            updated_at: now,
        }
    }

    /// Count of (completed, total) subtasks.
    pub fn completion_stats(&self) -> (usize, usize) {
        let completed = self
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .count();
        (completed, self.subtasks.len())
    }

    pub fn all_completed(&self) -> bool {
        !self.subtasks.is_empty()
            && self
                .subtasks
                .iter()
                .all(|s| s.status == SubtaskStatus::Completed)
    }

    pub fn find(&self, id: &SubtaskId) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| &s.id == id)
    }

    pub fn find_mut(&mut self, id: &SubtaskId) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| &s.id == id)
    }
}

/// Append-only record of one session's outcome against a subtask (Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub subtask_id: SubtaskId,
    pub session_ordinal: u64,
    pub success: bool,
    pub approach: String,
    pub commit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only record of a commit observed as the result of a successful
/// session (Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodCommitRecord {
    pub commit: String,
    pub subtask_id: SubtaskId,
    pub timestamp: DateTime<Utc>,
}

/// Cross-session memory entry kind (Section 3, 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Pattern,
    Decision,
    Fix,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Decision => "decision",
            Self::Fix => "fix",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pattern" => Some(Self::Pattern),
            "decision" => Some(Self::Decision),
            "fix" => Some(Self::Fix),
            _ => None,
        }
    }
}

/// A single append-only, human-readable memory entry (Section 3, 4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// The agent role the Session Runner is dispatching for (Section 4.2, 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Initializer,
    Coder,
    Reviewer,
    Qa,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializer => "initializer",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Qa => "qa",
        }
    }

    /// Role requires no mutation (Section 4.2): the runner relies on prompt
    /// instructions plus the Post-Session Processor's commit check, not a
    /// sandbox.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Reviewer | Self::Qa)
    }
}

/// Outcome classification of one Session Runner round-trip (Section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Continue,
    Complete,
    Blocked,
    Failed,
    Timeout,
}

/// Result of one Session Runner invocation (Section 3).
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub status: SessionStatus,
    pub raw_output: String,
    pub commits_observed: u32,
    pub events: Vec<crate::events::Event>,
    pub duration_ms: u64,
}

/// In-memory, per-run loop state (Section 3). Never persisted directly; it is
/// reconstructed deterministically from the on-disk stores on resume, except
/// for the dual-confirm counter which resets harmlessly to zero.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub iteration: u64,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub current_subtask: Option<SubtaskId>,
    pub completion_confirmations: u32,
    pub consecutive_failures: u32,
    pub total_commits: u64,
}

/// One recorded QA iteration within a QA History (Section 3, 4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaIteration {
    pub iteration: u32,
    pub approved: bool,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Per-sub-loop accumulator of QA iterations and recurring-issue counts
/// (Section 3, 4.10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaHistory {
    pub iterations: Vec<QaIteration>,
    /// Count per normalized issue string.
    pub issue_counts: std::collections::BTreeMap<String, u32>,
}

impl QaHistory {
    /// Normalize an issue string for recurrence comparison (Section 4.10):
    /// lower-cased, whitespace-stripped, truncated to a fixed length.
    pub fn normalize_issue(issue: &str) -> String {
        const MAX_LEN: usize = 120;
        let collapsed: String = issue.split_whitespace().collect::<Vec<_>>().join(" ");
        let lowered = collapsed.to_lowercase();
        lowered.chars().take(MAX_LEN).collect()
    }

    pub fn record(&mut self, iteration: u32, approved: bool, issues: Vec<String>) {
        for issue in &issues {
            let key = Self::normalize_issue(issue);
            *self.issue_counts.entry(key).or_insert(0) += 1;
        }
        self.iterations.push(QaIteration {
            iteration,
            approved,
            issues,
            timestamp: Utc::now(),
        });
    }

    /// Issues whose normalized form has reached the recurring-issue threshold.
    pub fn recurring_issues(&self, threshold: u32) -> Vec<(String, u32)> {
        self.issue_counts
            .iter()
            .filter(|(_, count)| **count >= threshold)
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

/// Live, readable progress snapshot for external observers (Section 3, 4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub iteration: u64,
    pub subtask_id: Option<String>,
    pub subtask_description: Option<String>,
    pub subtasks_completed: usize,
    pub subtasks_total: usize,
    pub session_start_time: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub commits_this_session: u32,
    pub overall_status: String,
    pub consecutive_failures: u32,
    pub termination_reason: Option<String>,
}

/// Specific termination reason emitted by the Loop Driver (Section 4.1, 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Complete,
    MaxIterations,
    MaxRuntime,
    ConsecutiveFailures,
    Stalled,
    LoopThrashing,
    UserCancelled,
    SessionTimeout,
    Error,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::MaxIterations => "max_iterations",
            Self::MaxRuntime => "max_runtime",
            Self::ConsecutiveFailures => "consecutive_failures",
            Self::Stalled => "stalled",
            Self::LoopThrashing => "loop_thrashing",
            Self::UserCancelled => "user_cancelled",
            Self::SessionTimeout => "session_timeout",
            Self::Error => "error",
        }
    }

    /// Exit code mapping for the CLI (Section 6): 0 success, 1 general
    /// error, 2 limit reached, 130 interrupted.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::MaxIterations | Self::MaxRuntime => 2,
            Self::UserCancelled => 130,
            Self::ConsecutiveFailures
            | Self::Stalled
            | Self::LoopThrashing
            | Self::SessionTimeout
            | Self::Error => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtask_new_defaults_to_pending() {
        let s = Subtask::new("a", "do a");
        assert_eq!(s.status, SubtaskStatus::Pending);
        assert_eq!(s.attempts, 0);
    }

    #[test]
    fn plan_completion_stats() {
        let mut plan = ImplementationPlan::new("t", vec![Subtask::new("a", "d")]);
        assert_eq!(plan.completion_stats(), (0, 1));
        plan.subtasks[0].status = SubtaskStatus::Completed;
        assert_eq!(plan.completion_stats(), (1, 1));
        assert!(plan.all_completed());
    }

    #[test]
    fn normalize_issue_collapses_whitespace_and_case() {
        assert_eq!(
            QaHistory::normalize_issue("  Missing   Password Validation "),
            "missing password validation"
        );
    }

    #[test]
    fn qa_history_tracks_recurrence() {
        let mut hist = QaHistory::default();
        hist.record(1, false, vec!["Missing password validation".into()]);
        hist.record(2, false, vec!["unrelated".into()]);
        hist.record(3, false, vec!["missing   PASSWORD validation".into()]);
        let recurring = hist.recurring_issues(2);
        assert_eq!(recurring.len(), 1);
        assert_eq!(recurring[0].1, 2);
    }

    #[test]
    fn termination_reason_exit_codes() {
        assert_eq!(TerminationReason::Complete.exit_code(), 0);
        assert_eq!(TerminationReason::MaxIterations.exit_code(), 2);
        assert_eq!(TerminationReason::UserCancelled.exit_code(), 130);
        assert_eq!(TerminationReason::Stalled.exit_code(), 1);
    }
}
