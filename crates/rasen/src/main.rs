//! rasen - supervises a coding-assistant subprocess through a multi-subtask
//! build to completion.
//!
//! Thin CLI front-end over `rasen_core`: this binary only parses arguments,
//! wires together the concrete `SessionRunner`/`VcsGateway` implementations,
//! and prints human-facing output. All orchestration logic lives in the
//! library crate.

use clap::{Parser, Subcommand};
use eyre::{eyre, Context, Result};
use rasen_core::config::Config;
use rasen_core::daemon;
use rasen_core::loop_driver::{Driver, ShutdownFlag};
use rasen_core::session_runner::{ProcessSessionRunner, SessionRunnerConfig};
use rasen_core::status_store::StatusStore;
use rasen_core::vcs::GitGateway;
use std::io::{BufRead, Seek};
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_STATE_DIR: &str = ".rasen";
const TASK_FILE: &str = "task.txt";
const CONFIG_FILE: &str = "config.yml";

/// Supervises a coding-assistant subprocess through a multi-subtask build.
#[derive(Parser)]
#[command(name = "rasen", about = "Drive a coding assistant to completion on a multi-subtask task", version)]
struct Cli {
    /// State directory (holds the plan, stores, and pid/log files).
    #[arg(long, global = true, env = "RASEN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Repository root the assistant operates in.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Write the task description and a starter config into the state directory.
    Init {
        /// The task description for the Initializer session.
        #[arg(long)]
        task: String,
    },
    /// Start the Loop Driver.
    Run {
        /// Detach and run as a background daemon.
        #[arg(long)]
        background: bool,
        /// Skip the Review sub-loop for this run, regardless of config.
        #[arg(long)]
        skip_review: bool,
        /// Skip the QA sub-loop for this run, regardless of config.
        #[arg(long)]
        skip_qa: bool,
    },
    /// Print the current Status Store snapshot.
    Status,
    /// Print or tail the daemon log.
    Logs {
        /// Follow the log as it grows, like `tail -f`.
        #[arg(short, long)]
        follow: bool,
        /// Number of trailing lines to print before following.
        #[arg(short, long, default_value_t = 50)]
        lines: usize,
    },
    /// Stop the background daemon.
    Stop {
        /// Send SIGKILL instead of SIGTERM.
        #[arg(long)]
        force: bool,
    },
    /// Resume a run (equivalent to `run`; kept for discoverability).
    Resume {
        #[arg(long)]
        background: bool,
    },
    /// Merge the task's branch into the target branch.
    Merge {
        /// Branch to merge into (defaults to the repository's current branch at init time).
        #[arg(long)]
        target: Option<String>,
    },
}

fn resolve_state_dir(cli: &Cli) -> PathBuf {
    cli.state_dir
        .clone()
        .unwrap_or_else(|| cli.repo.join(DEFAULT_STATE_DIR))
}

/// Install the tracing subscriber. In background mode the daemon has
/// already dup2'd stderr onto the log file, so writing to stderr here lands
/// in rasen.log either way.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(state_dir: &Path) -> Result<Config> {
    let path = state_dir.join(CONFIG_FILE);
    let mut config = match std::fs::read_to_string(&path) {
        Ok(contents) => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    config.resolve_paths(state_dir);
    Ok(config)
}

fn read_task_name(state_dir: &Path) -> Result<String> {
    let path = state_dir.join(TASK_FILE);
    std::fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .with_context(|| format!("no task recorded at {} — run `rasen init --task <text>` first", path.display()))
}

fn cmd_init(state_dir: &Path, task: &str) -> Result<()> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state directory {}", state_dir.display()))?;
    std::fs::write(state_dir.join(TASK_FILE), task)
        .with_context(|| "failed to write task.txt")?;

    let config_path = state_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let starter = serde_yaml::to_string(&Config::default())?;
        std::fs::write(&config_path, starter).with_context(|| "failed to write config.yml")?;
    }

    println!("initialized task in {}", state_dir.display());
    Ok(())
}

fn cmd_run(repo: &Path, state_dir: &Path, background: bool, skip_review: bool, skip_qa: bool) -> Result<i32> {
    let mut config = load_config(state_dir)?;
    config.skip_review = skip_review;
    config.skip_qa = skip_qa;
    let task_name = read_task_name(state_dir)?;

    let shutdown = ShutdownFlag::new();

    if background {
        // SAFETY: called before any additional threads are spawned.
        unsafe {
            daemon::daemonize(&config.background.pid_file, &config.background.log_file)
                .map_err(|e| eyre!("failed to start background daemon: {e}"))?;
        }
    } else {
        daemon::ensure_not_already_running(&config.background.pid_file)
            .map_err(|e| eyre!("{e}"))?;
    }

    init_tracing();
    daemon::install_signal_handlers(shutdown.clone());

    let runner = ProcessSessionRunner::new(SessionRunnerConfig::default());
    let vcs = GitGateway;
    let mut driver = Driver::new(
        &runner,
        &vcs,
        repo.to_path_buf(),
        state_dir.to_path_buf(),
        config.clone(),
        task_name,
        shutdown,
    );

    let result = driver.run();
    daemon::remove_pid_file(&config.background.pid_file);
    let reason = result.map_err(|e| eyre!("loop driver error: {e}"))?;
    tracing::info!(reason = reason.as_str(), "loop driver terminated");
    if !background {
        println!("terminated: {}", reason.as_str());
    }
    Ok(reason.exit_code())
}

fn cmd_status(state_dir: &Path) -> Result<()> {
    let store = StatusStore::new(state_dir.join("status.json"));
    match store.read().map_err(|e| eyre!("{e}"))? {
        None => println!("no status recorded yet"),
        Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
    }
    Ok(())
}

fn cmd_logs(state_dir: &Path, follow: bool, lines: usize) -> Result<()> {
    let config = load_config(state_dir)?;
    let log_path = &config.background.log_file;
    if !log_path.exists() {
        println!("no log file at {}", log_path.display());
        return Ok(());
    }

    let contents = std::fs::read_to_string(log_path)?;
    let tail: Vec<&str> = contents.lines().rev().take(lines).collect();
    for line in tail.into_iter().rev() {
        println!("{line}");
    }

    if follow {
        let mut file = std::fs::File::open(log_path)?;
        file.seek(std::io::SeekFrom::End(0))?;
        let mut reader = std::io::BufReader::new(file);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => std::thread::sleep(std::time::Duration::from_millis(500)),
                Ok(_) => print!("{line}"),
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

fn cmd_stop(state_dir: &Path, force: bool) -> Result<()> {
    let config = load_config(state_dir)?;
    daemon::stop(&config.background.pid_file, force).map_err(|e| eyre!("{e}"))?;
    println!("sent {} to background daemon", if force { "SIGKILL" } else { "SIGTERM" });
    Ok(())
}

fn cmd_merge(repo: &Path, target: Option<&str>) -> Result<()> {
    let vcs = GitGateway;
    let current = {
        use rasen_core::vcs::VcsGateway;
        vcs.current_branch(repo).map_err(|e| eyre!("{e}"))?
    };
    let target_branch = match target {
        Some(t) => t.to_string(),
        None => default_base_branch(repo)?,
    };

    if current == target_branch {
        return Err(eyre!("current branch {current} is the merge target; nothing to do"));
    }

    let status = ProcessCommand::new("git")
        .args(["checkout", &target_branch])
        .current_dir(repo)
        .status()
        .with_context(|| format!("failed to checkout {target_branch}"))?;
    if !status.success() {
        return Err(eyre!("git checkout {target_branch} failed"));
    }

    let status = ProcessCommand::new("git")
        .args(["merge", "--no-ff", &current])
        .current_dir(repo)
        .status()
        .with_context(|| format!("failed to merge {current} into {target_branch}"))?;
    if !status.success() {
        return Err(eyre!(
            "git merge {current} into {target_branch} failed; resolve conflicts manually"
        ));
    }

    println!("merged {current} into {target_branch}");
    Ok(())
}

fn default_base_branch(repo: &Path) -> Result<String> {
    let output = ProcessCommand::new("git")
        .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
        .current_dir(repo)
        .output()?;
    if output.status.success() {
        if let Some(name) = String::from_utf8_lossy(&output.stdout).trim().rsplit('/').next() {
            return Ok(name.to_string());
        }
    }
    Ok("main".to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(&cli);

    match &cli.command {
        Cmd::Init { task } => {
            init_tracing();
            cmd_init(&state_dir, task)
        }
        Cmd::Run { background, skip_review, skip_qa } => {
            let code = cmd_run(&cli.repo, &state_dir, *background, *skip_review, *skip_qa)?;
            std::process::exit(code);
        }
        Cmd::Resume { background } => {
            let code = cmd_run(&cli.repo, &state_dir, *background, false, false)?;
            std::process::exit(code);
        }
        Cmd::Status => {
            init_tracing();
            cmd_status(&state_dir)
        }
        Cmd::Logs { follow, lines } => {
            init_tracing();
            cmd_logs(&state_dir, *follow, *lines)
        }
        Cmd::Stop { force } => {
            init_tracing();
            cmd_stop(&state_dir, *force)
        }
        Cmd::Merge { target } => {
            init_tracing();
            cmd_merge(&cli.repo, target.as_deref())
        }
    }
}
