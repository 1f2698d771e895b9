//! Loop Driver (spec Section 4.1): top-level orchestration state machine.
//!
//! Grounded in the donor `loopd/src/scheduler.rs`'s top-of-loop
//! check-then-dispatch shape (budget checks, claim next unit of work,
//! dispatch, record outcome), rewired from a concurrent multi-run scheduler
//! to a single-run sequential state machine over
//! INIT_NEEDED/CODING/QA_FINAL/CONFIRMING/TERMINATED.

use crate::config::Config;
use crate::memory_store::MemoryStore;
use crate::plan_store::PlanStore;
use crate::post_session;
use crate::prompt::{self, PromptContext};
use crate::qa_loop::{self, QaOutcome};
use crate::recovery_store::RecoveryStore;
use crate::review_loop::{self, ReviewOutcome};
use crate::session_runner::SessionRunner;
use crate::stall_detector::{self, StallVerdict};
use crate::status_store::StatusStore;
use crate::types::{
    AgentRole, LoopState, Subtask, SubtaskId, SubtaskStatus, TerminationReason,
};
use crate::vcs::VcsGateway;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Plan(#[from] crate::plan_store::PlanStoreError),
    #[error(transparent)]
    Recovery(#[from] crate::recovery_store::RecoveryStoreError),
    #[error(transparent)]
    Status(#[from] crate::status_store::StatusStoreError),
    #[error(transparent)]
    Session(#[from] crate::session_runner::SessionError),
    #[error(transparent)]
    Review(#[from] crate::review_loop::ReviewLoopError),
    #[error(transparent)]
    Qa(#[from] crate::qa_loop::QaLoopError),
}

/// One-shot process-wide shutdown flag (spec Section 9): set by a signal
/// handler, observed at the top of each iteration and after each sub-loop.
/// The only piece of global mutable state in the supervisor.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Internal state-machine position (Section 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InitNeeded,
    Coding,
    QaFinal,
    Confirming,
    Terminated(TerminationReason),
}

/// Everything the driver needs to run one project (paths, stores, gateways).
pub struct Driver<'a> {
    pub runner: &'a dyn SessionRunner,
    pub vcs: &'a dyn VcsGateway,
    pub repo: PathBuf,
    pub state_dir: PathBuf,
    pub plan_store: PlanStore,
    pub recovery: RecoveryStore,
    pub memory: Option<MemoryStore>,
    pub status: StatusStore,
    pub config: Config,
    pub task_name: String,
    pub shutdown: ShutdownFlag,
}

impl<'a> Driver<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: &'a dyn SessionRunner,
        vcs: &'a dyn VcsGateway,
        repo: PathBuf,
        state_dir: PathBuf,
        config: Config,
        task_name: String,
        shutdown: ShutdownFlag,
    ) -> Self {
        let plan_store = PlanStore::new(&state_dir);
        let recovery = RecoveryStore::new(&state_dir);
        let memory = if config.memory.enabled {
            Some(MemoryStore::new(config.memory.path.clone()))
        } else {
            None
        };
        let status = StatusStore::new(config.background.status_file.clone());
        Self {
            runner,
            vcs,
            repo,
            state_dir,
            plan_store,
            recovery,
            memory,
            status,
            config,
            task_name,
            shutdown,
        }
    }

    fn write_status(&self, state: &LoopState, overall_status: &str, termination_reason: Option<TerminationReason>) {
        let (completed, total) = self.plan_store.completion_stats().unwrap_or((0, 0));
        let snapshot = crate::types::StatusSnapshot {
            pid: std::process::id(),
            start_time: state.start_timestamp.unwrap_or_else(Utc::now),
            iteration: state.iteration,
            subtask_id: state.current_subtask.as_ref().map(|s| s.0.clone()),
            subtask_description: state
                .current_subtask
                .as_ref()
                .and_then(|id| self.plan_store.load().ok().and_then(|p| p.find(id).map(|s| s.description.clone()))),
            subtasks_completed: completed,
            subtasks_total: total,
            session_start_time: Some(Utc::now()),
            last_activity_at: Utc::now(),
            commits_this_session: 0,
            overall_status: overall_status.to_string(),
            consecutive_failures: state.consecutive_failures,
            termination_reason: termination_reason.map(|r| r.as_str().to_string()),
        };
        let _ = self.status.write(&snapshot);
    }

    fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.config.orchestrator.session_timeout_seconds)
    }

    fn sleep_inter_session(&self) {
        std::thread::sleep(Duration::from_secs(self.config.orchestrator.session_delay_seconds));
    }

    fn build_prompt_context(&self, subtask: Option<&Subtask>) -> PromptContext {
        let memory_excerpt = self
            .memory
            .as_ref()
            .and_then(|m| m.format_for_injection(self.config.memory.max_tokens).ok())
            .unwrap_or_default();
        let failed_approaches = subtask
            .map(|s| self.recovery.failed_approaches(&s.id).unwrap_or_default())
            .unwrap_or_default();
        PromptContext {
            task_name: self.task_name.clone(),
            subtask_id: subtask.map(|s| s.id.0.clone()),
            subtask_description: subtask.map(|s| s.description.clone()),
            failed_approaches,
            memory_excerpt,
            feedback: None,
        }
    }

    /// Run one Initializer session; returns true on accepted completion.
    fn run_initializer(&self, ordinal: u64) -> Result<bool, DriverError> {
        let ctx = self.build_prompt_context(None);
        let template = prompt::resolve_template(&self.state_dir, AgentRole::Initializer);
        let rendered = prompt::render(&template, &ctx);
        let before_head = self.vcs.head(&self.repo).unwrap_or_else(|_| "0".to_string());
        let result = self.runner.run_session(
            AgentRole::Initializer,
            &rendered,
            &self.repo,
            &self.state_dir,
            self.session_timeout(),
        )?;
        let outcome = post_session::reconcile(
            self.vcs,
            &self.repo,
            &self.recovery,
            self.memory.as_ref(),
            &self.config,
            AgentRole::Initializer,
            &SubtaskId::new("__init__"),
            ordinal,
            &before_head,
            &result,
        )?;
        Ok(outcome.subtask_advanced && self.plan_store.exists())
    }

    /// Run one Coder session against `subtask`; returns whether the
    /// subtask advanced (Section 4.3's "subtask advanced" boolean).
    fn run_coder(&self, subtask: &Subtask, ordinal: u64) -> Result<bool, DriverError> {
        let ctx = self.build_prompt_context(Some(subtask));
        let template = prompt::resolve_template(&self.state_dir, AgentRole::Coder);
        let rendered = prompt::render(&template, &ctx);
        let before_head = self.vcs.head(&self.repo).unwrap_or_else(|_| "0".to_string());
        let result = self.runner.run_session(
            AgentRole::Coder,
            &rendered,
            &self.repo,
            &self.state_dir,
            self.session_timeout(),
        )?;
        let outcome = post_session::reconcile(
            self.vcs,
            &self.repo,
            &self.recovery,
            self.memory.as_ref(),
            &self.config,
            AgentRole::Coder,
            &subtask.id,
            ordinal,
            &before_head,
            &result,
        )?;
        if outcome.subtask_advanced {
            self.plan_store.mark_complete(&subtask.id)?;
        } else {
            self.plan_store.increment_attempts(&subtask.id, Some(outcome.approach))?;
        }
        Ok(outcome.subtask_advanced)
    }

    /// Run a single-subtask QA check (Section 9 open question resolution:
    /// one session, approve or revert to PENDING).
    fn run_subtask_qa(&self, subtask: &Subtask, ordinal: u64) -> Result<bool, DriverError> {
        let ctx = PromptContext {
            task_name: self.task_name.clone(),
            subtask_id: Some(subtask.id.0.clone()),
            subtask_description: Some(subtask.description.clone()),
            ..Default::default()
        };
        let template = prompt::resolve_template(&self.state_dir, AgentRole::Qa);
        let rendered = prompt::render(&template, &ctx);
        let before_head = self.vcs.head(&self.repo).unwrap_or_else(|_| "0".to_string());
        let result = self.runner.run_session(
            AgentRole::Qa,
            &rendered,
            &self.repo,
            &self.state_dir,
            self.session_timeout(),
        )?;
        let commits = self.vcs.commits_since(&self.repo, &before_head).unwrap_or(0);
        if post_session::read_only_violation(AgentRole::Qa, commits) {
            tracing::warn!(subtask = %subtask.id, "per-subtask qa session produced commits; ignoring verdict");
        }
        let approved = crate::events::has_topic(&result.events, &crate::events::Topic::QaApproved);
        self.recovery.record_attempt(&subtask.id, ordinal, approved, "per-subtask qa", None)?;
        if !approved {
            self.plan_store.revert_to_pending(&subtask.id)?;
        }
        Ok(approved)
    }

    fn stalled_verdict(&self, subtask_id: Option<&SubtaskId>, state: &LoopState) -> Result<Option<StallVerdict>, DriverError> {
        let Some(subtask_id) = subtask_id else { return Ok(None) };
        let recent_commit_counts: Vec<u32> = self
            .recovery
            .attempts_for(subtask_id)?
            .iter()
            .rev()
            .map(|a| u32::from(a.commit.is_some()))
            .collect();
        Ok(stall_detector::evaluate(
            &self.recovery,
            subtask_id,
            &recent_commit_counts,
            state.consecutive_failures,
            &self.config.stall_detection,
        )?)
    }

    fn verdict_to_reason(verdict: StallVerdict) -> TerminationReason {
        match verdict {
            StallVerdict::NoCommitStall => TerminationReason::Stalled,
            StallVerdict::ConsecutiveFailures => TerminationReason::ConsecutiveFailures,
            StallVerdict::CircularApproach => TerminationReason::LoopThrashing,
        }
    }

    /// Run the Loop Driver to termination (Section 4.1). Blocking; sleeps
    /// the inter-session delay between dispatches.
    pub fn run(&mut self) -> Result<TerminationReason, DriverError> {
        let mut state = LoopState {
            start_timestamp: Some(Utc::now()),
            ..Default::default()
        };
        let mut ordinal: u64 = 0;
        let mut phase = if self.plan_store.exists() {
            Phase::Coding
        } else {
            Phase::InitNeeded
        };

        loop {
            state.iteration += 1;
            self.write_status(&state, "running", None);

            if self.shutdown.is_set() {
                phase = Phase::Terminated(TerminationReason::UserCancelled);
            } else if state.iteration > self.config.orchestrator.max_iterations {
                phase = Phase::Terminated(TerminationReason::MaxIterations);
            } else if let Some(start) = state.start_timestamp {
                let elapsed = (Utc::now() - start).num_seconds().max(0) as u64;
                if elapsed > self.config.orchestrator.max_runtime_seconds {
                    phase = Phase::Terminated(TerminationReason::MaxRuntime);
                }
            }

            if !matches!(phase, Phase::Terminated(_)) {
                if let Some(verdict) = self.stalled_verdict(state.current_subtask.as_ref(), &state)? {
                    phase = Phase::Terminated(Self::verdict_to_reason(verdict));
                }
            }

            phase = match phase {
                Phase::Terminated(reason) => {
                    self.write_status(&state, "terminated", Some(reason));
                    return Ok(reason);
                }
                Phase::InitNeeded => {
                    ordinal += 1;
                    match self.run_initializer(ordinal) {
                        Ok(true) => Phase::Coding,
                        Ok(false) => {
                            state.consecutive_failures += 1;
                            if state.consecutive_failures >= self.config.stall_detection.max_consecutive_failures {
                                Phase::Terminated(TerminationReason::ConsecutiveFailures)
                            } else {
                                Phase::InitNeeded
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                Phase::Coding => {
                    let next = self.plan_store.get_next_subtask()?;
                    match next {
                        None => Phase::QaFinal,
                        Some(subtask) => {
                            state.current_subtask = Some(subtask.id.clone());
                            if subtask.status == SubtaskStatus::Pending {
                                self.plan_store.mark_in_progress(&subtask.id)?;
                            }
                            // Cheap per-call guard (Section 4.5) before asking the
                            // Coder to retry: if the last 3 attempts against this
                            // subtask all failed, don't spend another session
                            // finding that out again.
                            if self.recovery.is_thrashing(&subtask.id, 3)? {
                                Phase::Terminated(TerminationReason::ConsecutiveFailures)
                            } else {
                                ordinal += 1;
                                let advanced = self.run_coder(&subtask, ordinal)?;
                                if !advanced {
                                    state.consecutive_failures += 1;
                                    self.sleep_inter_session();
                                    if state.consecutive_failures >= self.config.stall_detection.max_consecutive_failures {
                                        Phase::Terminated(TerminationReason::ConsecutiveFailures)
                                    } else {
                                        Phase::Coding
                                    }
                                } else {
                                    state.consecutive_failures = 0;
                                    state.total_commits += 1;

                                    let mut still_ok = true;
                                    if self.config.review_active() && self.config.review.per_subtask {
                                        ordinal += 1;
                                        let (outcome, new_ordinal) = review_loop::run(
                                            self.runner,
                                            self.vcs,
                                            &self.repo,
                                            &self.state_dir,
                                            &self.plan_store,
                                            &self.recovery,
                                            &self.config,
                                            &self.task_name,
                                            &subtask.id,
                                            &subtask.description,
                                            ordinal,
                                        )?;
                                        ordinal = new_ordinal;
                                        if matches!(outcome, ReviewOutcome::BoundExceeded { .. }) {
                                            still_ok = false;
                                        }
                                    }

                                    if still_ok && self.config.qa_active() && self.config.qa.per_subtask {
                                        ordinal += 1;
                                        if !self.run_subtask_qa(&subtask, ordinal)? {
                                            still_ok = false;
                                        }
                                    }

                                    self.sleep_inter_session();
                                    Phase::Coding
                                }
                            }
                        }
                    }
                }
                Phase::QaFinal => {
                    if !self.config.qa_active() || self.config.qa.per_subtask {
                        Phase::Confirming
                    } else {
                        ordinal += 1;
                        let (outcome, _history, new_ordinal) = qa_loop::run(
                            self.runner,
                            self.vcs,
                            &self.repo,
                            &self.state_dir,
                            &self.recovery,
                            &self.config,
                            &self.task_name,
                            ordinal,
                        )?;
                        ordinal = new_ordinal;
                        match outcome {
                            QaOutcome::Approved => Phase::Confirming,
                            QaOutcome::Exhausted => Phase::Terminated(TerminationReason::Error),
                        }
                    }
                }
                Phase::Confirming => {
                    state.completion_confirmations += 1;
                    if state.completion_confirmations >= 2 {
                        Phase::Terminated(TerminationReason::Complete)
                    } else {
                        self.sleep_inter_session();
                        // Re-check the plan hasn't regressed during the delay.
                        if self.plan_store.load()?.all_completed() {
                            Phase::Confirming
                        } else {
                            state.completion_confirmations = 0;
                            Phase::Coding
                        }
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, Topic};
    use crate::session_runner::SessionRunner;
    use crate::types::{SessionResult, SessionStatus, Subtask};
    use crate::vcs::FakeVcsGateway;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Scripted `SessionRunner` that also performs a fake commit on the
    /// `FakeVcsGateway` for any response claiming `build.done`/`init.done`,
    /// mimicking the real subprocess's side effect of committing code.
    struct ScriptedRunner<'a> {
        responses: RefCell<Vec<(AgentRole, SessionResult)>>,
        vcs: &'a FakeVcsGateway,
        repo: PathBuf,
    }

    impl<'a> SessionRunner for ScriptedRunner<'a> {
        fn run_session(
            &self,
            role: AgentRole,
            _prompt: &str,
            _working_dir: &Path,
            _state_dir: &Path,
            _timeout: Duration,
        ) -> crate::session_runner::Result<SessionResult> {
            let mut responses = self.responses.borrow_mut();
            assert!(!responses.is_empty(), "ran out of scripted responses");
            let (expected_role, result) = responses.remove(0);
            assert_eq!(expected_role, role);
            if crate::events::claims_completion(&result.events) {
                let next_id = format!("c{}", self.vcs.heads.borrow().get(&self.repo).map_or(0, Vec::len) + 1);
                self.vcs.commit(&self.repo, &next_id);
            }
            Ok(result)
        }
    }

    fn build_done() -> SessionResult {
        SessionResult {
            status: SessionStatus::Continue,
            raw_output: String::new(),
            commits_observed: 0,
            events: vec![Event {
                topic: Topic::BuildDone,
                payload: "tests: pass, lint: pass".to_string(),
            }],
            duration_ms: 1,
        }
    }

    #[test]
    fn happy_path_three_subtasks_reaches_complete() {
        let dir = TempDir::new().unwrap();
        let plan_store = PlanStore::new(dir.path());
        plan_store
            .create(
                "task",
                vec![Subtask::new("a", "do a"), Subtask::new("b", "do b"), Subtask::new("c", "do c")],
            )
            .unwrap();

        let vcs = FakeVcsGateway::new();
        let repo = dir.path().to_path_buf();

        let runner = ScriptedRunner {
            responses: RefCell::new(vec![
                (AgentRole::Coder, build_done()),
                (AgentRole::Coder, build_done()),
                (AgentRole::Coder, build_done()),
            ]),
            vcs: &vcs,
            repo: repo.clone(),
        };

        let mut config = Config::default();
        config.orchestrator.session_delay_seconds = 0;
        config.review.enabled = false;
        config.qa.enabled = false;

        let mut driver = Driver::new(
            &runner,
            &vcs,
            repo,
            dir.path().to_path_buf(),
            config,
            "task".to_string(),
            ShutdownFlag::new(),
        );
        let reason = driver.run().unwrap();
        assert_eq!(reason, TerminationReason::Complete);
        let plan = driver.plan_store.load().unwrap();
        assert_eq!(plan.completion_stats(), (3, 3));
    }

    #[test]
    fn shutdown_flag_terminates_with_user_cancelled() {
        let dir = TempDir::new().unwrap();
        let plan_store = PlanStore::new(dir.path());
        plan_store.create("task", vec![Subtask::new("a", "do a")]).unwrap();
        let vcs = FakeVcsGateway::new();
        let runner = ScriptedRunner {
            responses: RefCell::new(vec![]),
            vcs: &vcs,
            repo: dir.path().to_path_buf(),
        };
        let mut config = Config::default();
        config.orchestrator.session_delay_seconds = 0;
        let shutdown = ShutdownFlag::new();
        shutdown.set();
        let mut driver = Driver::new(
            &runner,
            &vcs,
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            config,
            "task".to_string(),
            shutdown,
        );
        let reason = driver.run().unwrap();
        assert_eq!(reason, TerminationReason::UserCancelled);
    }

    #[test]
    fn no_commit_sessions_trigger_stalled() {
        let dir = TempDir::new().unwrap();
        let plan_store = PlanStore::new(dir.path());
        plan_store.create("task", vec![Subtask::new("a", "do a")]).unwrap();
        let vcs = FakeVcsGateway::new();
        let no_commit_result = SessionResult {
            status: SessionStatus::Continue,
            raw_output: "still working on it".to_string(),
            commits_observed: 0,
            events: vec![],
            duration_ms: 1,
        };
        let runner = ScriptedRunner {
            responses: RefCell::new(vec![
                (AgentRole::Coder, no_commit_result.clone()),
                (AgentRole::Coder, no_commit_result.clone()),
                (AgentRole::Coder, no_commit_result),
            ]),
            vcs: &vcs,
            repo: dir.path().to_path_buf(),
        };
        let mut config = Config::default();
        config.orchestrator.session_delay_seconds = 0;
        config.stall_detection.max_no_commit_sessions = 3;
        config.stall_detection.max_consecutive_failures = 100;
        let mut driver = Driver::new(
            &runner,
            &vcs,
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            config,
            "task".to_string(),
            ShutdownFlag::new(),
        );
        let reason = driver.run().unwrap();
        assert_eq!(reason, TerminationReason::Stalled);
    }

    #[test]
    fn is_thrashing_guard_stops_dispatch_after_three_recorded_failures() {
        let dir = TempDir::new().unwrap();
        let plan_store = PlanStore::new(dir.path());
        plan_store.create("task", vec![Subtask::new("a", "do a")]).unwrap();
        let vcs = FakeVcsGateway::new();
        let failed_result = SessionResult {
            status: SessionStatus::Continue,
            raw_output: "still working on it".to_string(),
            commits_observed: 0,
            events: vec![],
            duration_ms: 1,
        };
        // Exactly three scripted responses: if the is_thrashing guard were
        // not wired in, the driver would ask for a fourth and panic.
        let runner = ScriptedRunner {
            responses: RefCell::new(vec![
                (AgentRole::Coder, failed_result.clone()),
                (AgentRole::Coder, failed_result.clone()),
                (AgentRole::Coder, failed_result),
            ]),
            vcs: &vcs,
            repo: dir.path().to_path_buf(),
        };
        let mut config = Config::default();
        config.orchestrator.session_delay_seconds = 0;
        config.stall_detection.max_no_commit_sessions = 100;
        config.stall_detection.max_consecutive_failures = 100;
        // Isolate the is_thrashing guard from the Stall Detector's own
        // circular-approach predicate, which would otherwise also trip here
        // since every scripted attempt records the same approach text.
        config.stall_detection.circular_fix_threshold = 2.0;
        let mut driver = Driver::new(
            &runner,
            &vcs,
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            config,
            "task".to_string(),
            ShutdownFlag::new(),
        );
        let reason = driver.run().unwrap();
        assert_eq!(reason, TerminationReason::ConsecutiveFailures);
    }
}
