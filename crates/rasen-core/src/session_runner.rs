//! Session Runner (spec Section 4.2): one round-trip with the external
//! assistant subprocess.
//!
//! Ported from the donor `loopd/src/runner.rs` (subprocess spawn, timeout
//! enforcement, artifact writing) from `tokio::process` to
//! `std::process::Command`, since RASEN's entire design is synchronous
//! (Section 9). Retry/backoff is dropped: it isn't in spec.md — failures
//! route through the Post-Session Processor's attempt records instead of a
//! runner-internal retry loop.
//!
//! `SessionRunner` is a trait (Section "Trait seams for testability" in
//! SPEC_FULL.md) so the Loop Driver and sub-loops can be exercised in tests
//! against a fake implementation without spawning a real subprocess.

use crate::events::{self, Event};
use crate::types::{AgentRole, SessionResult, SessionStatus};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("assistant binary not found: {0}")]
    AssistantNotFound(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// How to invoke the coding-assistant CLI.
#[derive(Debug, Clone)]
pub struct SessionRunnerConfig {
    /// Path or name of the assistant binary (e.g. `claude`).
    pub assistant_bin: String,
    /// Extra args placed before the prompt argument.
    pub extra_args: Vec<String>,
}

impl Default for SessionRunnerConfig {
    fn default() -> Self {
        Self {
            assistant_bin: "claude".to_string(),
            extra_args: vec!["-p".to_string(), "--dangerously-skip-permissions".to_string()],
        }
    }
}

/// A single round-trip dispatch to the coding assistant (Section 4.2).
pub trait SessionRunner {
    /// Render `prompt` to a file in `state_dir`, spawn the assistant in
    /// `working_dir` with the given `timeout`, and return the observed
    /// result. Implementations stream the subprocess's output to the
    /// supervisor's log sink line-by-line as it is produced, concurrently
    /// with waiting on the child, rather than buffering it until exit.
    fn run_session(
        &self,
        role: AgentRole,
        prompt: &str,
        working_dir: &Path,
        state_dir: &Path,
        timeout: Duration,
    ) -> Result<SessionResult>;
}

/// Production `SessionRunner`: shells out to the configured assistant
/// binary.
pub struct ProcessSessionRunner {
    config: SessionRunnerConfig,
}

impl ProcessSessionRunner {
    pub fn new(config: SessionRunnerConfig) -> Self {
        Self { config }
    }

    fn spawn(&self, prompt_path: &Path, working_dir: &Path) -> Result<Child> {
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(&self.config.assistant_bin);
        cmd.args(&self.config.extra_args)
            .arg("--prompt-file")
            .arg(prompt_path)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Put the assistant in its own process group so a timeout kill
            // can take the whole subprocess tree with it (Section 4.2).
            .process_group(0);

        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SessionError::AssistantNotFound(self.config.assistant_bin.clone())
            } else {
                SessionError::Io(e)
            }
        })
    }

    /// Wait for `child` to exit, enforcing `timeout` by polling
    /// `try_wait`. On expiry, kill the process group and return `None`.
    fn wait_with_timeout(mut child: Child, timeout: Duration) -> Result<Option<std::process::ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                Self::kill_process_tree(&child);
                let _ = child.wait();
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    /// SIGKILL the child's entire process group (it was spawned as its own
    /// group leader via `process_group(0)`), falling back to killing just
    /// the child if the group signal fails.
    fn kill_process_tree(child: &Child) {
        let pid = child.id() as libc::pid_t;
        let result = unsafe { libc::kill(-pid, libc::SIGKILL) };
        if result != 0 {
            let _ = unsafe { libc::kill(pid, libc::SIGKILL) };
        }
    }

    /// Drain `stream` line-by-line on its own thread, streaming each line
    /// to the log sink (Section 4.2) as it arrives and accumulating it for
    /// the final `raw_output`. This has to run concurrently with the wait
    /// on the child, not after it: the OS pipe buffer is a fixed, small
    /// size (~64 KiB on Linux), and a session can run for the better part
    /// of an hour, so anything that only reads after the child exits will
    /// deadlock the child on its next `write()` once the buffer fills.
    fn spawn_drain_thread<R: Read + Send + 'static>(stream: R, stream_name: &'static str) -> JoinHandle<String> {
        std::thread::spawn(move || {
            let mut collected = String::new();
            for line in BufReader::new(stream).lines() {
                match line {
                    Ok(line) => {
                        tracing::info!(stream = stream_name, "{line}");
                        collected.push_str(&line);
                        collected.push('\n');
                    }
                    Err(_) => break,
                }
            }
            collected
        })
    }
}

impl SessionRunner for ProcessSessionRunner {
    fn run_session(
        &self,
        role: AgentRole,
        prompt: &str,
        working_dir: &Path,
        state_dir: &Path,
        timeout: Duration,
    ) -> Result<SessionResult> {
        std::fs::create_dir_all(state_dir)?;
        let prompt_path: PathBuf = crate::prompt::debug_prompt_path(state_dir, role, None);
        {
            let mut f = std::fs::File::create(&prompt_path)?;
            f.write_all(prompt.as_bytes())?;
        }

        let start = Instant::now();
        let mut child = match self.spawn(&prompt_path, working_dir) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(role = role.as_str(), error = %e, "failed to spawn assistant");
                return Ok(SessionResult {
                    status: SessionStatus::Failed,
                    raw_output: format!("failed to spawn assistant: {e}"),
                    commits_observed: 0,
                    events: Vec::new(),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
        };

        // Drain both pipes on their own threads *before* waiting on the
        // child, so the child never blocks on a full pipe while the parent
        // sits in `wait_with_timeout` (see `spawn_drain_thread`).
        let stdout_handle = child.stdout.take().map(|s| Self::spawn_drain_thread(s, "stdout"));
        let stderr_handle = child.stderr.take().map(|s| Self::spawn_drain_thread(s, "stderr"));

        let wait_result = Self::wait_with_timeout(child, timeout)?;

        // Killing the child tree closes its ends of the pipes, so the
        // drain threads see EOF and return shortly after `wait_with_timeout`
        // resolves either way.
        let out = stdout_handle.and_then(|h| h.join().ok()).unwrap_or_default();
        let err = stderr_handle.and_then(|h| h.join().ok()).unwrap_or_default();
        let full_output = if err.is_empty() {
            out
        } else {
            format!("{out}\n\n--- STDERR ---\n{err}")
        };
        let events: Vec<Event> = events::extract_events(&full_output);

        let status = match wait_result {
            None => SessionStatus::Timeout,
            Some(_) => SessionStatus::Continue,
        };
        Ok(SessionResult {
            status,
            raw_output: full_output,
            commits_observed: 0,
            events,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
