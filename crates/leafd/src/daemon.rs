//! Process plumbing: pidfile, log redirection and daemonization.

use crate::error::{LeafError, Result};
use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::stat::{Mode, umask};
use nix::unistd::{ForkResult, Pid, chdir, fork, getpid, setsid};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of inspecting an existing pidfile.
#[derive(Debug, PartialEq, Eq)]
pub enum PidfileStatus {
    Absent,
    /// Pointed at a dead process and was removed.
    Stale(i32),
}

fn daemon_error(what: &str, e: impl std::fmt::Display) -> LeafError {
    LeafError::Daemon(format!("{}: {}", what, e))
}

/// Refuse to start while the pidfile names a live process; clear stale ones.
pub fn check_pidfile(path: &Path) -> Result<PidfileStatus> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PidfileStatus::Absent),
        Err(e) => return Err(daemon_error("error while reading pidfile", e)),
    };

    let content = content.trim();
    if content.is_empty() {
        return Err(LeafError::Daemon(format!(
            "existing pidfile {} is empty",
            path.display()
        )));
    }
    let pid: i32 = content
        .parse()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| {
            LeafError::Daemon(format!("pidfile {} content is invalid", path.display()))
        })?;

    match kill(Pid::from_raw(pid), None) {
        Err(Errno::ESRCH) => {
            info!(pid, path = %path.display(), "Pidfile points to a dead process, removing");
            fs::remove_file(path).map_err(|e| daemon_error("failed to remove stale pidfile", e))?;
            Ok(PidfileStatus::Stale(pid))
        }
        // EPERM still means the process exists.
        Ok(()) | Err(_) => Err(LeafError::Daemon(format!(
            "pidfile points to a running process ({})",
            pid
        ))),
    }
}

/// Pidfile written with the current pid, removed again on drop.
#[derive(Debug)]
pub struct PidfileGuard {
    path: PathBuf,
}

impl PidfileGuard {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file =
            File::create(&path).map_err(|e| daemon_error("pidfile creation failed", e))?;
        write!(file, "{}", getpid()).map_err(|e| daemon_error("pidfile write failed", e))?;
        debug!(path = %path.display(), "Wrote pidfile");
        Ok(Self { path })
    }
}

impl Drop for PidfileGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove pidfile");
        }
    }
}

fn replace_fd(file: &File, target: RawFd, what: &str) -> Result<()> {
    // SAFETY: both descriptors are valid; dup2 only rebinds `target`.
    if unsafe { libc::dup2(file.as_raw_fd(), target) } == -1 {
        return Err(daemon_error(what, io::Error::last_os_error()));
    }
    Ok(())
}

/// Point stdin/stdout at /dev/null and stderr at `log_file`.
pub fn redirect_output(log_file: &Path) -> Result<()> {
    let null_in =
        File::open("/dev/null").map_err(|e| daemon_error("failed to reopen stdin", e))?;
    let null_out = OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .map_err(|e| daemon_error("failed to reopen stdout", e))?;
    let log = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o700)
        .open(log_file)
        .map_err(|e| daemon_error("failed to reopen stderr", e))?;

    replace_fd(&null_in, libc::STDIN_FILENO, "failed to reopen stdin")?;
    replace_fd(&null_out, libc::STDOUT_FILENO, "failed to reopen stdout")?;
    replace_fd(&log, libc::STDERR_FILENO, "failed to reopen stderr")?;
    Ok(())
}

/// Exit in the parent, continue in the child.
fn fork_and_exit_parent() -> Result<()> {
    // SAFETY: called before any thread is spawned.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => Ok(()),
        Err(e) => Err(daemon_error("failed to fork while daemonising", e)),
    }
}

/// Detach from the controlling terminal with the classic double fork.
pub fn daemonize() -> Result<()> {
    fork_and_exit_parent()?;
    setsid().map_err(|e| daemon_error("failed to create new session while daemonising", e))?;
    // SAFETY: SIG_IGN installs no handler code.
    unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) }
        .map_err(|e| daemon_error("failed to ignore SIGHUP", e))?;
    fork_and_exit_parent()?;
    umask(Mode::empty());
    Ok(())
}

/// Release the working directory so the mount it lives on can go away.
pub fn chdir_root() -> Result<()> {
    chdir("/").map_err(|e| daemon_error("failed to change directory to /", e))
}
