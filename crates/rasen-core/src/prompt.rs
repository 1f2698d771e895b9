//! Prompt rendering (spec Section 4.2, 6): fills a role's template with
//! current context (subtask id/description, failed-approach list, a
//! budgeted memory excerpt, review/QA feedback when applicable).
//!
//! Templates resolve from the state directory first, else bundled defaults
//! (Section 6: `prompts/{initializer,coder,reviewer,qa}.md`), matching the
//! donor's config-then-default resolution order in `loop_core::config`.

use crate::types::AgentRole;
use std::path::Path;

/// Context substituted into a rendered prompt. Fields not applicable to a
/// given role are simply left unused by that role's template.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub task_name: String,
    pub subtask_id: Option<String>,
    pub subtask_description: Option<String>,
    pub failed_approaches: Vec<String>,
    pub memory_excerpt: String,
    pub feedback: Option<String>,
}

fn default_template(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Initializer => {
            "# Role: Initializer\n\n\
             Task: {{task_name}}\n\n\
             Break the task into an ordered list of subtasks with stable ids \
             and write the implementation plan. When the plan is written, emit:\n\
             <event topic=\"init.done\"></event>\n"
        }
        AgentRole::Coder => {
            "# Role: Coder\n\n\
             Task: {{task_name}}\n\
             Subtask: {{subtask_id}} — {{subtask_description}}\n\n\
             Previously tried approaches (avoid repeating these):\n\
             {{failed_approaches}}\n\n\
             Relevant memory:\n\
             {{memory_excerpt}}\n\n\
             {{feedback_section}}\
             Implement the subtask, commit your work, and when finished emit:\n\
             <event topic=\"build.done\">tests: pass, lint: pass</event>\n\
             If you cannot proceed, emit:\n\
             <event topic=\"build.blocked\">reason</event>\n"
        }
        AgentRole::Reviewer => {
            "# Role: Reviewer (read-only — do not modify any files)\n\n\
             Task: {{task_name}}\n\
             Subtask: {{subtask_id}} — {{subtask_description}}\n\n\
             {{feedback_section}}\
             Review the latest changes. Emit exactly one of:\n\
             <event topic=\"review.approved\"></event>\n\
             <event topic=\"review.changes_requested\">specific feedback</event>\n"
        }
        AgentRole::Qa => {
            "# Role: QA (read-only — do not modify any files)\n\n\
             Task: {{task_name}}\n\n\
             {{feedback_section}}\
             Exercise the full implementation end to end. Emit exactly one of:\n\
             <event topic=\"qa.approved\"></event>\n\
             <event topic=\"qa.rejected\">itemized list of issues</event>\n"
        }
    }
}

/// Resolve a role's template: `<state_dir>/prompts/<role>.md` if present,
/// else the bundled default.
pub fn resolve_template(state_dir: &Path, role: AgentRole) -> String {
    let path = state_dir.join("prompts").join(format!("{}.md", role.as_str()));
    std::fs::read_to_string(&path).unwrap_or_else(|_| default_template(role).to_string())
}

/// Render a template against a context by simple `{{token}}` substitution —
/// no templating engine dependency, matching the donor's own manual
/// `{{ ... }}` substitution style in `loopd/src/git.rs`'s worktree path
/// expansion.
pub fn render(template: &str, ctx: &PromptContext) -> String {
    let failed_approaches = if ctx.failed_approaches.is_empty() {
        "(none yet)".to_string()
    } else {
        ctx.failed_approaches
            .iter()
            .map(|a| format!("- {a}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let feedback_section = ctx
        .feedback
        .as_ref()
        .map(|f| format!("Feedback from the previous round:\n{f}\n\n"))
        .unwrap_or_default();

    template
        .replace("{{task_name}}", &ctx.task_name)
        .replace("{{subtask_id}}", ctx.subtask_id.as_deref().unwrap_or(""))
        .replace(
            "{{subtask_description}}",
            ctx.subtask_description.as_deref().unwrap_or(""),
        )
        .replace("{{failed_approaches}}", &failed_approaches)
        .replace("{{memory_excerpt}}", &ctx.memory_excerpt)
        .replace("{{feedback_section}}", &feedback_section)
}

/// Write the most-recently-rendered prompt for debugging (Section 6:
/// `prompt_<role>[_<subtask>].md`).
pub fn debug_prompt_path(state_dir: &Path, role: AgentRole, subtask_id: Option<&str>) -> std::path::PathBuf {
    match subtask_id {
        Some(id) => state_dir.join(format!("prompt_{}_{}.md", role.as_str(), id)),
        None => state_dir.join(format!("prompt_{}.md", role.as_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_all_known_tokens() {
        let ctx = PromptContext {
            task_name: "Build a widget".into(),
            subtask_id: Some("a1".into()),
            subtask_description: Some("wire up the widget".into()),
            failed_approaches: vec!["tried recursion".into()],
            memory_excerpt: "- (fix) always validate input".into(),
            feedback: None,
        };
        let rendered = render(default_template(AgentRole::Coder), &ctx);
        assert!(rendered.contains("Build a widget"));
        assert!(rendered.contains("a1"));
        assert!(rendered.contains("wire up the widget"));
        assert!(rendered.contains("tried recursion"));
        assert!(rendered.contains("always validate input"));
    }

    #[test]
    fn render_shows_placeholder_for_empty_failed_approaches() {
        let ctx = PromptContext {
            task_name: "t".into(),
            ..Default::default()
        };
        let rendered = render(default_template(AgentRole::Coder), &ctx);
        assert!(rendered.contains("(none yet)"));
    }

    #[test]
    fn render_includes_feedback_section_when_present() {
        let ctx = PromptContext {
            task_name: "t".into(),
            feedback: Some("please add tests".into()),
            ..Default::default()
        };
        let rendered = render(default_template(AgentRole::Reviewer), &ctx);
        assert!(rendered.contains("please add tests"));
    }

    #[test]
    fn resolve_template_prefers_state_dir_override() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("prompts")).unwrap();
        std::fs::write(dir.path().join("prompts/coder.md"), "custom coder template").unwrap();
        let resolved = resolve_template(dir.path(), AgentRole::Coder);
        assert_eq!(resolved, "custom coder template");
    }

    #[test]
    fn resolve_template_falls_back_to_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let resolved = resolve_template(dir.path(), AgentRole::Qa);
        assert!(resolved.contains("qa.approved"));
    }
}
