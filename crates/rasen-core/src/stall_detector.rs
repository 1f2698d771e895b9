//! Stall Detector (spec Section 4.11): three independent predicates over
//! attempt history and recent session results.
//!
//! Grounded in the donor `loopd/src/watchdog.rs`'s `SignalContext` /
//! priority-ordered signal evaluation and hard-cap-triggers-terminal-
//! decision shape. The Jaccard word-set similarity used for circular-
//! approach detection is freshly written: the donor's own
//! `compute_output_similarity` is a line-match ratio, not the word-set
//! Jaccard measure Section 4.11 specifies.
//!
//! Per Section 9 ("Cyclic / shared state"), the detector holds no mutable
//! state of its own across iterations — it reads the Recovery Store fresh
//! each call — avoiding duplicated caches going out of sync.

use crate::config::StallDetectionConfig;
use crate::recovery_store::RecoveryStore;
use crate::types::SubtaskId;
use std::collections::HashSet;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "was", "are", "will", "have", "from", "into",
];

/// Positive stall/thrashing verdicts, each mapping to a specific
/// termination reason (Section 4.1, 4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    NoCommitStall,
    ConsecutiveFailures,
    CircularApproach,
}

fn word_set(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

/// Jaccard similarity between the word sets of two approach strings.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let wa = word_set(a);
    let wb = word_set(b);
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let intersection = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// No-commit stall: per subtask, `max_no_commit_sessions` consecutive
/// session results (most recent first in `recent_commit_counts`) with zero
/// commits trips this predicate. Resets as soon as any of those sessions
/// made a commit.
pub fn no_commit_stall(recent_commit_counts: &[u32], threshold: u32) -> bool {
    let threshold = threshold as usize;
    if recent_commit_counts.len() < threshold {
        return false;
    }
    recent_commit_counts[..threshold].iter().all(|&c| c == 0)
}

/// Consecutive failures across any subtasks: trips at `max_consecutive_failures`.
pub fn consecutive_failures_stall(consecutive_failures: u32, threshold: u32) -> bool {
    consecutive_failures >= threshold
}

/// Circular approaches: compute Jaccard similarity of the newest approach
/// against each of the last three recorded approaches (oldest first in
/// `history`, newest approach already appended). Trips when at least two of
/// those three comparisons are >= `threshold`.
pub fn circular_approach(history: &[String], threshold: f64) -> bool {
    if history.len() < 2 {
        return false;
    }
    let newest = history.last().unwrap();
    let prior = &history[..history.len() - 1];
    let window_start = prior.len().saturating_sub(3);
    let window = &prior[window_start..];
    let hits = window
        .iter()
        .filter(|a| jaccard_similarity(newest, a) >= threshold)
        .count();
    hits >= 2 && window.len() >= 2
}

/// Evaluate all three predicates for the current subtask. Returns the first
/// positive verdict found, in priority order: no-commit, consecutive
/// failures, circular approach — matching the donor watchdog's
/// priority-ordered evaluation shape.
pub fn evaluate(
    recovery: &RecoveryStore,
    subtask_id: &SubtaskId,
    recent_commit_counts: &[u32],
    consecutive_failures: u32,
    config: &StallDetectionConfig,
) -> Result<Option<StallVerdict>, crate::recovery_store::RecoveryStoreError> {
    if no_commit_stall(recent_commit_counts, config.max_no_commit_sessions) {
        return Ok(Some(StallVerdict::NoCommitStall));
    }
    if consecutive_failures_stall(consecutive_failures, config.max_consecutive_failures) {
        return Ok(Some(StallVerdict::ConsecutiveFailures));
    }
    let approaches: Vec<String> = recovery
        .attempts_for(subtask_id)?
        .into_iter()
        .map(|a| a.approach)
        .collect();
    if circular_approach(&approaches, config.circular_fix_threshold) {
        return Ok(Some(StallVerdict::CircularApproach));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery_store::RecoveryStore;
    use tempfile::TempDir;

    #[test]
    fn jaccard_identical_strings_is_one() {
        assert!((jaccard_similarity("fix the bug here", "fix the bug here") - 1.0).abs() < 0.01);
    }

    #[test]
    fn jaccard_disjoint_strings_is_zero() {
        assert_eq!(jaccard_similarity("apples oranges bananas", "trucks planes boats"), 0.0);
    }

    #[test]
    fn no_commit_stall_trips_at_threshold() {
        assert!(no_commit_stall(&[0, 0, 0], 3));
        assert!(!no_commit_stall(&[0, 0], 3));
        assert!(!no_commit_stall(&[1, 0, 0], 3));
    }

    #[test]
    fn consecutive_failures_trips_at_threshold() {
        assert!(consecutive_failures_stall(5, 5));
        assert!(!consecutive_failures_stall(4, 5));
    }

    #[test]
    fn circular_approach_trips_with_two_of_three_similar() {
        let history = vec![
            "rewrote the parser using recursion".to_string(),
            "tried using a different database schema".to_string(),
            "rewrote parser again with recursion logic".to_string(),
            "rewrote the parser recursion approach again".to_string(),
        ];
        assert!(circular_approach(&history, 0.3));
    }

    #[test]
    fn circular_approach_false_when_all_different() {
        let history = vec![
            "added caching layer for queries".to_string(),
            "refactored the http client module".to_string(),
            "wrote new integration tests suite".to_string(),
        ];
        assert!(!circular_approach(&history, 0.3));
    }

    #[test]
    fn circular_approach_false_with_too_few_approaches() {
        let history = vec!["only one approach so far".to_string()];
        assert!(!circular_approach(&history, 0.3));
    }

    #[test]
    fn evaluate_prioritizes_no_commit_over_others() {
        let dir = TempDir::new().unwrap();
        let recovery = RecoveryStore::new(dir.path());
        let id = SubtaskId::new("a");
        let cfg = StallDetectionConfig::default();
        let verdict = evaluate(&recovery, &id, &[0, 0, 0], 10, &cfg).unwrap();
        assert_eq!(verdict, Some(StallVerdict::NoCommitStall));
    }

    #[test]
    fn evaluate_none_when_healthy() {
        let dir = TempDir::new().unwrap();
        let recovery = RecoveryStore::new(dir.path());
        let id = SubtaskId::new("a");
        let cfg = StallDetectionConfig::default();
        let verdict = evaluate(&recovery, &id, &[1, 1, 1], 0, &cfg).unwrap();
        assert_eq!(verdict, None);
    }
}
