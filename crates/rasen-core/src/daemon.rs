//! Daemon Manager (spec Section 4.12): foreground signal handling plus
//! POSIX background double-fork/pidfile lifecycle.
//!
//! Grounded in `other_examples/8a506428_groblegark-oddjobs__crates-daemon-
//! src-lifecycle.rs.rs`'s double-fork/setsid/redirect-streams/pidfile
//! sequence and the liveness-probe-then-reclaim pattern in
//! `ryanmaclean-tundra/crates/at-core/src/lockfile.rs` /
//! `at-daemon/src/main.rs`, both using `libc::kill(pid, 0)` as a
//! process-liveness check with no signal delivered.

use crate::loop_driver::ShutdownFlag;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("a daemon is already running with pid {0}")]
    AlreadyRunning(u32),
    #[error("pid file {0} does not contain a valid pid")]
    InvalidPidFile(PathBuf),
    #[error("no running daemon found (pid file {0} absent)")]
    NotRunning(PathBuf),
    #[error("fork failed")]
    ForkFailed,
}

type Result<T> = std::result::Result<T, DaemonError>;

fn io_err(path: &Path, source: io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Is the process identified by `pid` alive? Uses `kill(pid, 0)`, which
/// delivers no signal and only checks permission/existence (Section 4.12:
/// "probing the process").
pub fn is_process_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0
}

/// Read a pid file, reclaiming (removing) it if it is stale (process gone).
/// Returns `Some(pid)` only for a genuinely live process.
pub fn read_live_pid(pid_file: &Path) -> Result<Option<u32>> {
    let contents = match fs::read_to_string(pid_file) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(pid_file, e)),
    };
    let pid: u32 = contents
        .trim()
        .parse()
        .map_err(|_| DaemonError::InvalidPidFile(pid_file.to_path_buf()))?;
    if is_process_alive(pid) {
        Ok(Some(pid))
    } else {
        let _ = fs::remove_file(pid_file);
        Ok(None)
    }
}

/// Refuse to start if a live daemon already owns `pid_file` (Section 4.12:
/// "Startup must refuse if the pid file corresponds to a live process").
pub fn ensure_not_already_running(pid_file: &Path) -> Result<()> {
    if let Some(pid) = read_live_pid(pid_file)? {
        return Err(DaemonError::AlreadyRunning(pid));
    }
    Ok(())
}

fn write_pid_file(pid_file: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = pid_file.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    crate::fileutil::atomic_write(pid_file, pid.to_string().as_bytes())
        .map_err(|e| io_err(pid_file, io::Error::other(e.to_string())))
}

/// Remove the pid file on clean exit (Section 4.12, 9).
pub fn remove_pid_file(pid_file: &Path) {
    let _ = fs::remove_file(pid_file);
}

/// Send SIGTERM (graceful) or SIGKILL (`force`) to a running daemon,
/// identified by its pid file (Section 6 `stop [--force]`).
pub fn stop(pid_file: &Path, force: bool) -> Result<()> {
    let pid = read_live_pid(pid_file)?.ok_or_else(|| DaemonError::NotRunning(pid_file.to_path_buf()))?;
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result != 0 {
        return Err(io_err(pid_file, io::Error::last_os_error()));
    }
    Ok(())
}

/// Install SIGTERM/SIGINT/SIGHUP handlers that set `flag` (Section 9: the
/// only process-wide mutable state, one-shot). Safe to call from either
/// foreground or background mode.
pub fn install_signal_handlers(flag: ShutdownFlag) {
    use std::sync::OnceLock;
    static FLAG_SLOT: OnceLock<ShutdownFlag> = OnceLock::new();
    let _ = FLAG_SLOT.set(flag);

    extern "C" fn handle_signal(_sig: libc::c_int) {
        if let Some(flag) = FLAG_SLOT.get() {
            flag.set();
        }
    }

    unsafe {
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handle_signal as libc::sighandler_t);
    }
}

/// Double-fork and detach from the controlling terminal (Section 4.12).
/// Must be called before any threads are spawned. On success the calling
/// process exits; only the final grandchild returns from this function.
///
/// # Safety
/// Calls `fork`/`setsid`, which are only sound to use this early in process
/// startup, before other threads exist.
pub unsafe fn daemonize(pid_file: &Path, log_file: &Path) -> Result<()> {
    ensure_not_already_running(pid_file)?;

    match unsafe { libc::fork() } {
        -1 => return Err(DaemonError::ForkFailed),
        0 => {}
        _ => std::process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(DaemonError::ForkFailed);
    }

    match unsafe { libc::fork() } {
        -1 => return Err(DaemonError::ForkFailed),
        0 => {}
        _ => std::process::exit(0),
    }

    redirect_standard_streams(log_file)?;
    write_pid_file(pid_file, std::process::id())?;
    Ok(())
}

fn redirect_standard_streams(log_file: &Path) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| io_err(log_file, e))?;
    let fd = log.as_raw_fd();

    unsafe {
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
        let devnull = libc::open(b"/dev/null\0".as_ptr().cast::<libc::c_char>(), libc::O_RDONLY);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::close(devnull);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn is_process_alive_true_for_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn is_process_alive_false_for_unlikely_pid() {
        assert!(!is_process_alive(u32::from(u16::MAX) * 4));
    }

    #[test]
    fn read_live_pid_reclaims_stale_file() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("rasen.pid");
        std::fs::write(&pid_file, (u32::from(u16::MAX) * 4).to_string()).unwrap();
        let result = read_live_pid(&pid_file).unwrap();
        assert!(result.is_none());
        assert!(!pid_file.exists());
    }

    #[test]
    fn read_live_pid_returns_some_for_live_process() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("rasen.pid");
        std::fs::write(&pid_file, std::process::id().to_string()).unwrap();
        assert_eq!(read_live_pid(&pid_file).unwrap(), Some(std::process::id()));
    }

    #[test]
    fn ensure_not_already_running_ok_when_absent() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("rasen.pid");
        assert!(ensure_not_already_running(&pid_file).is_ok());
    }

    #[test]
    fn ensure_not_already_running_errors_for_live_pid() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("rasen.pid");
        std::fs::write(&pid_file, std::process::id().to_string()).unwrap();
        assert!(matches!(
            ensure_not_already_running(&pid_file),
            Err(DaemonError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn stop_errors_when_not_running() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("rasen.pid");
        assert!(matches!(stop(&pid_file, false), Err(DaemonError::NotRunning(_))));
    }
}
