//! QA Sub-loop (spec Section 4.10): a bounded end-to-end QA session cycle
//! run after all subtasks are COMPLETED, with recurring-issue escalation.
//!
//! Grounded in the donor `loopd/src/watchdog.rs`'s bounded-iteration
//! evaluate-then-act shape and `loopd/src/postmortem.rs`'s write-a-summary-
//! document idiom, rewired to `QaHistory`'s recurring-issue bookkeeping
//! (Section 3) and a human-escalation markdown artifact instead of a JSON
//! postmortem.

use crate::config::Config;
use crate::events::{self, Topic};
use crate::post_session;
use crate::prompt::{self, PromptContext};
use crate::recovery_store::RecoveryStore;
use crate::session_runner::SessionRunner;
use crate::types::{AgentRole, QaHistory, SubtaskId};
use crate::vcs::VcsGateway;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QaLoopError {
    #[error(transparent)]
    Session(#[from] crate::session_runner::SessionError),
    #[error(transparent)]
    Recovery(#[from] crate::recovery_store::RecoveryStoreError),
    #[error("failed to write QA escalation artifact: {0}")]
    Escalation(#[from] std::io::Error),
}

/// Outcome of running the QA sub-loop to completion (Section 4.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QaOutcome {
    Approved,
    /// `qa.max_iterations` was exhausted without approval: an escalation
    /// artifact was written and the driver should terminate with `error`.
    Exhausted,
}

const ESCALATION_FILE_NAME: &str = "QA_ESCALATION.md";

/// Render the human-escalation document (Section 6): recurring issues and
/// their counts, the full QA iteration history, and recommended actions.
fn render_escalation(task_name: &str, history: &QaHistory, threshold: u32) -> String {
    let mut out = String::new();
    out.push_str(&format!("# QA Escalation: {task_name}\n\n"));
    out.push_str(
        "QA did not approve this task within the configured iteration budget. \
         Automated recovery has stopped; this requires human attention.\n\n",
    );

    out.push_str("## Recurring issues\n\n");
    let recurring = history.recurring_issues(threshold);
    if recurring.is_empty() {
        out.push_str("(no single issue recurred at or above the configured threshold)\n\n");
    } else {
        for (issue, count) in &recurring {
            out.push_str(&format!("- ({count}x) {issue}\n"));
        }
        out.push('\n');
    }

    out.push_str("## Full QA iteration history\n\n");
    for iteration in &history.iterations {
        out.push_str(&format!(
            "### Iteration {} — {}\n",
            iteration.iteration,
            if iteration.approved { "approved" } else { "rejected" }
        ));
        if iteration.issues.is_empty() {
            out.push_str("(no issues reported)\n\n");
        } else {
            for issue in &iteration.issues {
                out.push_str(&format!("- {issue}\n"));
            }
            out.push('\n');
        }
    }

    out.push_str("## Recommended actions\n\n");
    out.push_str(
        "- Review the recurring issues above; they were reported across multiple \
         QA passes without resolution.\n\
         - Consider whether the Implementation Plan needs a new subtask addressing \
         the recurring issue directly.\n\
         - Resume with `rasen resume` after addressing the issue manually, or adjust \
         `qa.max_iterations` if the task is simply larger than the configured budget.\n",
    );
    out
}

/// Run the QA sub-loop (Section 4.10): dispatch QA sessions until approved
/// or `config.qa.max_iterations` is exhausted. On exhaustion, write the
/// escalation artifact at the repository root.
#[allow(clippy::too_many_arguments)]
pub fn run(
    runner: &dyn SessionRunner,
    vcs: &dyn VcsGateway,
    repo: &Path,
    state_dir: &Path,
    recovery: &RecoveryStore,
    config: &Config,
    task_name: &str,
    session_ordinal_start: u64,
) -> Result<(QaOutcome, QaHistory, u64), QaLoopError> {
    let mut ordinal = session_ordinal_start;
    let mut history = QaHistory::default();
    let mut feedback: Option<String> = None;
    let timeout = Duration::from_secs(config.orchestrator.session_timeout_seconds);

    for iteration in 1..=config.qa.max_iterations {
        let ctx = PromptContext {
            task_name: task_name.to_string(),
            feedback: feedback.clone(),
            ..Default::default()
        };
        let template = prompt::resolve_template(state_dir, crate::types::AgentRole::Qa);
        let rendered = prompt::render(&template, &ctx);

        let before_head = vcs.head(repo).unwrap_or_else(|_| "0".to_string());
        let result = runner.run_session(crate::types::AgentRole::Qa, &rendered, repo, state_dir, timeout)?;
        ordinal += 1;

        let commits_observed = vcs.commits_since(repo, &before_head).unwrap_or(0);
        if crate::post_session::read_only_violation(crate::types::AgentRole::Qa, commits_observed) {
            tracing::warn!(task = %task_name, "qa session produced commits; ignoring qa verdict this round");
        }

        let approved = events::has_topic(&result.events, &Topic::QaApproved);
        let issues: Vec<String> = result
            .events
            .iter()
            .find(|e| e.topic == Topic::QaRejected)
            .map(|e| {
                e.payload
                    .lines()
                    .map(|l| l.trim_start_matches(['-', '*']).trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        history.record(iteration, approved, issues.clone());
        recovery.record_attempt(
            &SubtaskId::new("__qa__"),
            ordinal,
            approved,
            format!("qa iteration {iteration}"),
            None,
        )?;

        if approved {
            return Ok((QaOutcome::Approved, history, ordinal));
        }

        // A recurring issue trips the escalation regardless of how many
        // iterations remain in the budget (Section 4.10).
        if !history.recurring_issues(config.qa.recurring_issue_threshold).is_empty() {
            let doc = render_escalation(task_name, &history, config.qa.recurring_issue_threshold);
            std::fs::write(repo.join(ESCALATION_FILE_NAME), doc)?;
            return Ok((QaOutcome::Exhausted, history, ordinal));
        }

        feedback = Some(issues.join("\n"));

        // Dispatch a Coder fix session before trying QA again.
        let fix_ctx = PromptContext {
            task_name: task_name.to_string(),
            failed_approaches: recovery.failed_approaches(&SubtaskId::new("__qa__"))?,
            feedback: feedback.clone(),
            ..Default::default()
        };
        let fix_template = prompt::resolve_template(state_dir, AgentRole::Coder);
        let fix_rendered = prompt::render(&fix_template, &fix_ctx);
        let fix_before_head = vcs.head(repo).unwrap_or_else(|_| "0".to_string());
        let fix_result = runner.run_session(AgentRole::Coder, &fix_rendered, repo, state_dir, timeout)?;
        ordinal += 1;
        post_session::reconcile(
            vcs,
            repo,
            recovery,
            None,
            config,
            AgentRole::Coder,
            &SubtaskId::new("__qa__"),
            ordinal,
            &fix_before_head,
            &fix_result,
        )?;
    }

    let doc = render_escalation(task_name, &history, config.qa.recurring_issue_threshold);
    std::fs::write(repo.join(ESCALATION_FILE_NAME), doc)?;
    Ok((QaOutcome::Exhausted, history, ordinal))
}
