//! Supervisor configuration (spec Section 6 `config.yml`).
//!
//! This module defines the `Config` type and its defaults for every option
//! named in Section 6's recognized-options list. Parsing `config.yml` itself
//! is a thin `serde_yaml` wrapper around this type — the out-of-scope item is
//! a hand-rolled YAML grammar, not the presence of a typed config struct.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iterations: u64,
    pub max_runtime_seconds: u64,
    pub session_delay_seconds: u64,
    pub session_timeout_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            max_runtime_seconds: 6 * 3600,
            session_delay_seconds: 5,
            session_timeout_seconds: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_tokens: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("memories.md"),
            max_tokens: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub require_tests: bool,
    pub require_lint: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            require_tests: true,
            require_lint: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub status_file: PathBuf,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from("rasen.pid"),
            log_file: PathBuf::from("rasen.log"),
            status_file: PathBuf::from("status.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StallDetectionConfig {
    pub max_no_commit_sessions: u32,
    pub max_consecutive_failures: u32,
    pub circular_fix_threshold: f64,
}

impl Default for StallDetectionConfig {
    fn default() -> Self {
        Self {
            max_no_commit_sessions: 3,
            max_consecutive_failures: 5,
            circular_fix_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub enabled: bool,
    pub per_subtask: bool,
    pub max_loops: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_subtask: true,
            max_loops: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    pub enabled: bool,
    pub per_subtask: bool,
    pub max_iterations: u32,
    pub recurring_issue_threshold: u32,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_subtask: false,
            max_iterations: 50,
            recurring_issue_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    pub enabled: bool,
    pub base_path: PathBuf,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_path: PathBuf::from("../.rasen-worktrees"),
        }
    }
}

/// Top-level supervisor configuration (Section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub memory: MemoryConfig,
    pub backpressure: BackpressureConfig,
    pub background: BackgroundConfig,
    pub stall_detection: StallDetectionConfig,
    pub review: ReviewConfig,
    pub qa: QaConfig,
    pub worktree: WorktreeConfig,
    /// CLI-only override, not part of `config.yml`: skip Review regardless
    /// of `review.enabled` for this run (`run --skip-review`).
    #[serde(skip)]
    pub skip_review: bool,
    /// CLI-only override: skip QA regardless of `qa.enabled` for this run
    /// (`run --skip-qa`).
    #[serde(skip)]
    pub skip_qa: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            memory: MemoryConfig::default(),
            backpressure: BackpressureConfig::default(),
            background: BackgroundConfig::default(),
            stall_detection: StallDetectionConfig::default(),
            review: ReviewConfig::default(),
            qa: QaConfig::default(),
            worktree: WorktreeConfig::default(),
            skip_review: false,
            skip_qa: false,
        }
    }
}

impl Config {
    /// Resolve every relative path against the state directory.
    pub fn resolve_paths(&mut self, state_dir: &Path) {
        if self.memory.path.is_relative() {
            self.memory.path = state_dir.join(&self.memory.path);
        }
        if self.background.pid_file.is_relative() {
            self.background.pid_file = state_dir.join(&self.background.pid_file);
        }
        if self.background.log_file.is_relative() {
            self.background.log_file = state_dir.join(&self.background.log_file);
        }
        if self.background.status_file.is_relative() {
            self.background.status_file = state_dir.join(&self.background.status_file);
        }
        if self.worktree.base_path.is_relative() {
            self.worktree.base_path = state_dir.join(&self.worktree.base_path);
        }
    }

    /// Whether Review is active for this run, accounting for the per-run
    /// `--skip-review` override.
    pub fn review_active(&self) -> bool {
        self.review.enabled && !self.skip_review
    }

    /// Whether QA is active for this run, accounting for the per-run
    /// `--skip-qa` override.
    pub fn qa_active(&self) -> bool {
        self.qa.enabled && !self.skip_qa
    }
}
