//! OS process helpers: liveness probes, termination and detaching from the
//! controlling terminal.

use anyhow::{Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{ForkResult, Pid, fork, setsid};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const LIVENESS_POLL: Duration = Duration::from_millis(100);

pub fn current_pid() -> i32 {
    std::process::id() as i32
}

/// Probes `pid` with signal 0.
///
/// Only `ESRCH` means the process is gone; `EPERM` means it exists but
/// belongs to someone else. Non-positive pids address process groups and are
/// never considered alive.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(e) => {
            debug!(pid, error = %e, "Unexpected liveness probe result");
            true
        }
    }
}

/// Sends `sig` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: i32, sig: Signal) -> Result<()> {
    if pid <= 0 {
        return Err(anyhow!("Refusing to signal pid {}", pid));
    }
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!("Failed to send {:?} to process {}: {}", sig, pid, e)),
    }
}

/// Waits until `pid` exits or `grace` elapses. Returns true if it exited.
pub async fn wait_for_exit(pid: i32, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(LIVENESS_POLL).await;
    }
}

/// Cancels `token` on SIGTERM, SIGINT or SIGQUIT.
///
/// Must be called from inside a tokio runtime.
pub fn cancel_on_termination(token: CancellationToken) -> Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sigquit.recv() => "SIGQUIT",
            _ = token.cancelled() => return,
        };
        warn!(signal = name, "Termination requested, stopping after the current account");
        token.cancel();
    }))
}

/// Which side of a [`detach`] the caller is on.
#[derive(Debug, PartialEq, Eq)]
pub enum Detached {
    /// The original process; it should report and exit.
    Parent { child: i32 },
    /// The background process; it carries on with the run.
    Child,
}

/// Forks and starts a new session in the child so the run survives the
/// invoking terminal.
///
/// Must be called while the process is single-threaded: before any tokio
/// runtime or database connection exists.
pub fn detach() -> Result<Detached> {
    // SAFETY: callers guarantee no other threads exist yet, so the child
    // starts with consistent allocator and lock state.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(Detached::Parent {
            child: child.as_raw(),
        }),
        Ok(ForkResult::Child) => {
            setsid().map_err(|e| anyhow!("Failed to start new session: {}", e))?;
            Ok(Detached::Child)
        }
        Err(e) => Err(anyhow!("Failed to fork: {}", e)),
    }
}
