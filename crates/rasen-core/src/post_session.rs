//! Post-Session Processor (spec Section 4.3): the trust boundary. Never
//! believes the assistant's self-report; reconciles against observable
//! reality (VCS side effects, structured completion evidence).
//!
//! Grounded in the donor `loopd/src/lib.rs`'s `process_run` reconciliation
//! step and `loopd/src/postmortem.rs`'s summary-on-completion idiom,
//! rewritten as the 9-step procedure in spec Section 4.3.

use crate::config::Config;
use crate::events::{self, Topic};
use crate::memory_store::MemoryStore;
use crate::recovery_store::RecoveryStore;
use crate::types::{AgentRole, MemoryKind, SessionResult, SubtaskId};
use crate::validator;
use crate::vcs::VcsGateway;

/// Outcome of reconciling one session against observed reality.
#[derive(Debug, Clone)]
pub struct ReconciliationOutcome {
    /// Whether the subtask advanced (i.e. should be marked COMPLETED).
    pub subtask_advanced: bool,
    pub commits_observed: u32,
    pub approach: String,
    pub commit: Option<String>,
}

/// Heuristic extraction of an "approach" summary from assistant output
/// (Section 4.3 step 5): first line mentioning "approach" or "trying", else
/// first non-empty line, truncated to ~200 characters.
pub fn extract_approach(output: &str) -> String {
    const MAX_LEN: usize = 200;
    let lower_contains = |line: &str| {
        let l = line.to_lowercase();
        l.contains("approach") || l.contains("trying")
    };

    let chosen = output
        .lines()
        .find(|l| lower_contains(l))
        .or_else(|| output.lines().find(|l| !l.trim().is_empty()))
        .unwrap_or("")
        .trim();

    chosen.chars().take(MAX_LEN).collect()
}

/// Run the Post-Session Processor's 9-step reconciliation procedure.
///
/// `before_head`/`after_head` are the VCS head identifiers observed
/// immediately before and after the session.
#[allow(clippy::too_many_arguments)]
pub fn reconcile(
    vcs: &dyn VcsGateway,
    repo: &std::path::Path,
    recovery: &RecoveryStore,
    memory: Option<&MemoryStore>,
    config: &Config,
    role: AgentRole,
    subtask_id: &SubtaskId,
    session_ordinal: u64,
    before_head: &str,
    result: &SessionResult,
) -> Result<ReconciliationOutcome, crate::recovery_store::RecoveryStoreError> {
    // Step 1: commits added since the "before" head.
    let commits_observed = vcs.commits_since(repo, before_head).unwrap_or(0);

    // Step 2: is completion claimed?
    let claimed = events::claims_completion(&result.events);

    // Step 3/4: backpressure + commit requirement.
    let is_initializer = matches!(role, AgentRole::Initializer);
    let mut success = false;
    if claimed {
        let backpressure_ok = if is_initializer {
            true
        } else if let Some(payload) = events::completion_payload(&result.events) {
            let evidence = validator::parse_payload(payload);
            validator::is_valid(evidence, &config.backpressure)
        } else {
            false
        };

        let commit_ok = is_initializer || commits_observed > 0;
        success = backpressure_ok && commit_ok;
    }

    // Step 5: approach heuristic.
    let approach = extract_approach(&result.raw_output);

    // Step 6: record the attempt.
    let commit = if commits_observed > 0 {
        vcs.head(repo).ok()
    } else {
        None
    };
    recovery.record_attempt(subtask_id, session_ordinal, success, approach.clone(), commit.clone())?;

    // Step 7: on success, record the good commit (if any commits occurred).
    if success {
        if let Some(ref c) = commit {
            recovery.record_good_commit(c, subtask_id)?;
        }
    }

    // Step 9: scan for explicit memory markers on success.
    if success {
        if let Some(store) = memory {
            for marker in events::extract_memory_markers(&result.raw_output) {
                if let Some(kind) = MemoryKind::parse(&marker.kind) {
                    let _ = store.append(kind, marker.content, Vec::new());
                }
            }
        }
    }

    Ok(ReconciliationOutcome {
        subtask_advanced: success,
        commits_observed,
        approach,
        commit,
    })
}

/// True when the session's events indicate the assistant is logically
/// read-only in behavior for a review/QA session — i.e. no commits
/// occurred, as the rendered prompt required (Section 4.2).
pub fn read_only_violation(role: AgentRole, commits_observed: u32) -> bool {
    role.is_read_only() && commits_observed > 0
}

/// Did the session report `build.blocked`?
pub fn is_blocked(result: &SessionResult) -> bool {
    events::has_topic(&result.events, &Topic::BuildBlocked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{SessionStatus};
    use crate::vcs::FakeVcsGateway;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn make_result(raw_output: &str) -> SessionResult {
        SessionResult {
            status: SessionStatus::Continue,
            raw_output: raw_output.to_string(),
            commits_observed: 0,
            events: events::extract_events(raw_output),
            duration_ms: 10,
        }
    }

    #[test]
    fn extract_approach_prefers_approach_line() {
        let output = "did some stuff\nApproach: using a trie\nmore stuff";
        assert_eq!(extract_approach(output), "Approach: using a trie");
    }

    #[test]
    fn extract_approach_falls_back_to_first_nonempty_line() {
        let output = "\n\nfirst real line\nsecond line";
        assert_eq!(extract_approach(output), "first real line");
    }

    #[test]
    fn extract_approach_truncates_to_200_chars() {
        let long = "x".repeat(300);
        let output = format!("approach: {long}");
        assert_eq!(extract_approach(&output).chars().count(), 200);
    }

    #[test]
    fn reconcile_rejects_build_done_without_commits() {
        let dir = TempDir::new().unwrap();
        let recovery = RecoveryStore::new(dir.path());
        let vcs = FakeVcsGateway::new();
        let repo = PathBuf::from("/repo");
        let config = Config::default();
        let result = make_result(
            r#"working on it <event topic="build.done">tests: pass, lint: pass</event>"#,
        );
        let outcome = reconcile(
            &vcs,
            &repo,
            &recovery,
            None,
            &config,
            AgentRole::Coder,
            &SubtaskId::new("a"),
            1,
            "0",
            &result,
        )
        .unwrap();
        assert!(!outcome.subtask_advanced);
    }

    #[test]
    fn reconcile_accepts_build_done_with_commit_and_evidence() {
        let dir = TempDir::new().unwrap();
        let recovery = RecoveryStore::new(dir.path());
        let vcs = FakeVcsGateway::new();
        let repo = PathBuf::from("/repo");
        vcs.commit(&repo, "c1");
        let config = Config::default();
        let result = make_result(
            r#"<event topic="build.done">tests: pass, lint: pass</event>"#,
        );
        let outcome = reconcile(
            &vcs,
            &repo,
            &recovery,
            None,
            &config,
            AgentRole::Coder,
            &SubtaskId::new("a"),
            1,
            "0",
            &result,
        )
        .unwrap();
        assert!(outcome.subtask_advanced);
        assert_eq!(recovery.last_good_commit().unwrap(), Some("c1".to_string()));
    }

    #[test]
    fn reconcile_initializer_waives_commit_requirement() {
        let dir = TempDir::new().unwrap();
        let recovery = RecoveryStore::new(dir.path());
        let vcs = FakeVcsGateway::new();
        let repo = PathBuf::from("/repo");
        let config = Config::default();
        let result = make_result(r#"<event topic="init.done"></event>"#);
        let outcome = reconcile(
            &vcs,
            &repo,
            &recovery,
            None,
            &config,
            AgentRole::Initializer,
            &SubtaskId::new("plan"),
            1,
            "0",
            &result,
        )
        .unwrap();
        assert!(outcome.subtask_advanced);
    }

    #[test]
    fn reconcile_extracts_memory_markers_on_success() {
        let dir = TempDir::new().unwrap();
        let recovery = RecoveryStore::new(dir.path());
        let memory = MemoryStore::new(dir.path().join("memories.md"));
        let vcs = FakeVcsGateway::new();
        let repo = PathBuf::from("/repo");
        vcs.commit(&repo, "c1");
        let config = Config::default();
        let result = make_result(
            "<event topic=\"build.done\">tests: pass, lint: pass</event>\n<!-- memory: fix: handle empty input -->",
        );
        reconcile(
            &vcs,
            &repo,
            &recovery,
            Some(&memory),
            &config,
            AgentRole::Coder,
            &SubtaskId::new("a"),
            1,
            "0",
            &result,
        )
        .unwrap();
        let entries = memory.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "handle empty input");
    }

    #[test]
    fn is_blocked_detects_build_blocked() {
        let result = make_result(r#"<event topic="build.blocked">missing deps</event>"#);
        assert!(is_blocked(&result));
    }

    #[test]
    fn read_only_violation_flags_commits_from_reviewer() {
        assert!(read_only_violation(AgentRole::Reviewer, 1));
        assert!(!read_only_violation(AgentRole::Reviewer, 0));
        assert!(!read_only_violation(AgentRole::Coder, 1));
    }
}
