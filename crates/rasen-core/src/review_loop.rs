//! Review Sub-loop (spec Section 4.9): a bounded Reviewer-then-Coder-fix
//! cycle run after a subtask's Coder session reports success.
//!
//! Grounded in the donor `loopd/src/watchdog.rs`'s rewrite-count-bounded
//! evaluation loop (`RewriteResult`, `max_rewrites`), rewired from a
//! rewrite-the-prompt-and-retry shape to a Reviewer/Coder ping-pong bounded
//! by `review.max_loops`.

use crate::config::Config;
use crate::events::{self, Topic};
use crate::plan_store::PlanStore;
use crate::post_session;
use crate::prompt::{self, PromptContext};
use crate::recovery_store::RecoveryStore;
use crate::session_runner::SessionRunner;
use crate::types::{AgentRole, SubtaskId};
use crate::vcs::VcsGateway;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReviewLoopError {
    #[error(transparent)]
    Session(#[from] crate::session_runner::SessionError),
    #[error(transparent)]
    Recovery(#[from] crate::recovery_store::RecoveryStoreError),
    #[error(transparent)]
    Plan(#[from] crate::plan_store::PlanStoreError),
}

/// Outcome of running the Review sub-loop to completion (Section 4.9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// The Reviewer approved within the allotted loops.
    Approved,
    /// `review.max_loops` was exhausted without approval: the subtask is
    /// reverted to PENDING and the loop records why.
    BoundExceeded { last_feedback: Option<String> },
}

/// Run the Review sub-loop for one subtask (Section 4.9): dispatch a
/// Reviewer session; if it requests changes, dispatch a Coder fix session
/// and try again, up to `config.review.max_loops` Reviewer dispatches.
#[allow(clippy::too_many_arguments)]
pub fn run(
    runner: &dyn SessionRunner,
    vcs: &dyn VcsGateway,
    repo: &Path,
    state_dir: &Path,
    plan_store: &PlanStore,
    recovery: &RecoveryStore,
    config: &Config,
    task_name: &str,
    subtask_id: &SubtaskId,
    subtask_description: &str,
    session_ordinal_start: u64,
) -> Result<(ReviewOutcome, u64), ReviewLoopError> {
    let mut ordinal = session_ordinal_start;
    let mut feedback: Option<String> = None;
    let timeout = Duration::from_secs(config.orchestrator.session_timeout_seconds);

    for _loop_index in 0..config.review.max_loops {
        let ctx = PromptContext {
            task_name: task_name.to_string(),
            subtask_id: Some(subtask_id.0.clone()),
            subtask_description: Some(subtask_description.to_string()),
            feedback: feedback.clone(),
            ..Default::default()
        };
        let template = prompt::resolve_template(state_dir, AgentRole::Reviewer);
        let rendered = prompt::render(&template, &ctx);

        let before_head = vcs.head(repo).unwrap_or_else(|_| "0".to_string());
        let result = runner.run_session(AgentRole::Reviewer, &rendered, repo, state_dir, timeout)?;
        ordinal += 1;

        let commits_observed = vcs.commits_since(repo, &before_head).unwrap_or(0);
        if post_session::read_only_violation(AgentRole::Reviewer, commits_observed) {
            tracing::warn!(subtask = %subtask_id, "reviewer session produced commits; ignoring review verdict this round");
        }

        if events::has_topic(&result.events, &Topic::ReviewApproved) {
            recovery.record_attempt(subtask_id, ordinal, true, "review: approved", None)?;
            return Ok((ReviewOutcome::Approved, ordinal));
        }

        let requested = events::has_topic(&result.events, &Topic::ReviewChangesRequested);
        let notes = if requested {
            result
                .events
                .iter()
                .find(|e| e.topic == Topic::ReviewChangesRequested)
                .map(|e| e.payload.clone())
        } else {
            None
        };
        recovery.record_attempt(
            subtask_id,
            ordinal,
            false,
            format!("review: changes requested: {}", notes.clone().unwrap_or_default()),
            None,
        )?;
        feedback = notes;

        // Dispatch a Coder fix session before trying the Reviewer again.
        let fix_ctx = PromptContext {
            task_name: task_name.to_string(),
            subtask_id: Some(subtask_id.0.clone()),
            subtask_description: Some(subtask_description.to_string()),
            failed_approaches: recovery.failed_approaches(subtask_id)?,
            feedback: feedback.clone(),
            ..Default::default()
        };
        let fix_template = prompt::resolve_template(state_dir, AgentRole::Coder);
        let fix_rendered = prompt::render(&fix_template, &fix_ctx);
        let fix_before_head = vcs.head(repo).unwrap_or_else(|_| "0".to_string());
        let fix_result = runner.run_session(AgentRole::Coder, &fix_rendered, repo, state_dir, timeout)?;
        ordinal += 1;

        let outcome = post_session::reconcile(
            vcs,
            repo,
            recovery,
            None,
            config,
            AgentRole::Coder,
            subtask_id,
            ordinal,
            &fix_before_head,
            &fix_result,
        )?;
        if !outcome.subtask_advanced {
            plan_store.increment_attempts(subtask_id, Some(outcome.approach))?;
        }
    }

    plan_store.revert_to_pending(subtask_id)?;
    Ok((ReviewOutcome::BoundExceeded { last_feedback: feedback }, ordinal))
}
