//! VCS Gateway (spec Section 4.13): a narrow surface over version-control
//! queries and worktree creation.
//!
//! Ported near-verbatim from the donor `loopd/src/git.rs` (already
//! synchronous `std::process::Command`), trimmed to RASEN's narrower
//! required surface: head id, commits-since-count, current branch,
//! create/checkout branch, create/remove worktree. Exposed as a trait per
//! SPEC_FULL.md's testability supplement so the Loop Driver can be tested
//! against a fake implementation.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, VcsError>;

/// Required queries and mutations over a repository (Section 4.13). All
/// operations are single command-line invocations that either succeed with
/// machine-parseable output or fail with a specific error.
pub trait VcsGateway {
    fn head(&self, repo: &Path) -> Result<String>;
    fn commits_since(&self, repo: &Path, prior_head: &str) -> Result<u32>;
    fn current_branch(&self, repo: &Path) -> Result<String>;
    fn create_branch(&self, repo: &Path, branch: &str, base: &str) -> Result<()>;
    fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<()>;
    fn create_worktree(&self, repo: &Path, path: &Path, branch: &str, base: &str) -> Result<()>;
    fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<()>;
}

/// Production `VcsGateway`: shells out to `git`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitGateway;

fn run(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(VcsError::from)
}

fn ensure_success(output: &std::process::Output, context: &str) -> Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(VcsError::CommandFailed(format!(
            "{context}: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

impl VcsGateway for GitGateway {
    fn head(&self, repo: &Path) -> Result<String> {
        let output = run(repo, &["rev-parse", "HEAD"])?;
        ensure_success(&output, "git rev-parse HEAD")?;
        String::from_utf8(output.stdout)
            .map(|s| s.trim().to_string())
            .map_err(|_| VcsError::InvalidUtf8)
    }

    fn commits_since(&self, repo: &Path, prior_head: &str) -> Result<u32> {
        let output = run(repo, &["rev-list", "--count", &format!("{prior_head}..HEAD")])?;
        ensure_success(&output, "git rev-list --count")?;
        String::from_utf8(output.stdout)
            .map_err(|_| VcsError::InvalidUtf8)?
            .trim()
            .parse()
            .map_err(|_| VcsError::CommandFailed("non-numeric rev-list output".to_string()))
    }

    fn current_branch(&self, repo: &Path) -> Result<String> {
        let output = run(repo, &["branch", "--show-current"])?;
        ensure_success(&output, "git branch --show-current")?;
        String::from_utf8(output.stdout)
            .map(|s| s.trim().to_string())
            .map_err(|_| VcsError::InvalidUtf8)
    }

    fn create_branch(&self, repo: &Path, branch: &str, base: &str) -> Result<()> {
        let output = run(repo, &["branch", branch, base])?;
        ensure_success(&output, &format!("git branch {branch} {base}"))
    }

    fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        let output = run(repo, &["checkout", branch])?;
        ensure_success(&output, &format!("git checkout {branch}"))
    }

    fn create_worktree(&self, repo: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let exists = run(repo, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !exists {
            self.create_branch(repo, branch, base)?;
        }
        let path_str = path.to_string_lossy().into_owned();
        let output = run(repo, &["worktree", "add", &path_str, branch])?;
        ensure_success(&output, "git worktree add")
    }

    fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().into_owned();
        let output = run(repo, &["worktree", "remove", &path_str])?;
        ensure_success(&output, "git worktree remove")
    }
}

/// In-memory `VcsGateway` for tests that don't want to shell out to `git`
/// at all. Tracks a single linear head per repo path.
#[cfg(test)]
pub struct FakeVcsGateway {
    pub heads: std::cell::RefCell<std::collections::HashMap<PathBuf, Vec<String>>>,
}

#[cfg(test)]
impl FakeVcsGateway {
    pub fn new() -> Self {
        Self {
            heads: std::cell::RefCell::new(std::collections::HashMap::new()),
        }
    }

    pub fn commit(&self, repo: &Path, commit_id: &str) {
        self.heads
            .borrow_mut()
            .entry(repo.to_path_buf())
            .or_default()
            .push(commit_id.to_string());
    }
}

#[cfg(test)]
impl VcsGateway for FakeVcsGateway {
    fn head(&self, repo: &Path) -> Result<String> {
        Ok(self
            .heads
            .borrow()
            .get(repo)
            .and_then(|v| v.last().cloned())
            .unwrap_or_else(|| "0".to_string()))
    }

    fn commits_since(&self, repo: &Path, prior_head: &str) -> Result<u32> {
        let heads = self.heads.borrow();
        let v = heads.get(repo).cloned().unwrap_or_default();
        let pos = v.iter().position(|h| h == prior_head).map_or(0, |p| p + 1);
        Ok((v.len() - pos.min(v.len())) as u32)
    }

    fn current_branch(&self, _repo: &Path) -> Result<String> {
        Ok("main".to_string())
    }

    fn create_branch(&self, _repo: &Path, _branch: &str, _base: &str) -> Result<()> {
        Ok(())
    }

    fn checkout_branch(&self, _repo: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    fn create_worktree(&self, _repo: &Path, _path: &Path, _branch: &str, _base: &str) -> Result<()> {
        Ok(())
    }

    fn remove_worktree(&self, _repo: &Path, _path: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn setup_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "t@t.com"],
            vec!["config", "user.name", "T"],
        ] {
            StdCommand::new("git").args(&args).current_dir(dir.path()).output().unwrap();
        }
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    #[test]
    fn head_and_commits_since() {
        let dir = setup_repo();
        let gw = GitGateway;
        let before = gw.head(dir.path()).unwrap();
        std::fs::write(dir.path().join("b.txt"), "2").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "second"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert_eq!(gw.commits_since(dir.path(), &before).unwrap(), 1);
    }

    #[test]
    fn current_branch_reports_default() {
        let dir = setup_repo();
        let gw = GitGateway;
        let branch = gw.current_branch(dir.path()).unwrap();
        assert!(branch == "main" || branch == "master");
    }

    #[test]
    fn fake_gateway_tracks_commits() {
        let gw = FakeVcsGateway::new();
        let repo = PathBuf::from("/repo");
        let before = gw.head(&repo).unwrap();
        gw.commit(&repo, "c1");
        gw.commit(&repo, "c2");
        assert_eq!(gw.commits_since(&repo, &before).unwrap(), 2);
        assert_eq!(gw.head(&repo).unwrap(), "c2");
    }
}
