use anyhow::Result;
use chrono::Local;
use nix::sys::signal::Signal;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::models::SessionStatus;
use crate::db::SessionStore;
use crate::process;

/// How long to wait for a killed process to disappear.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOutcome {
    /// No live process holds the lock. Nothing was changed.
    NoRunningBackup,
    /// The label is not in the store. Nothing was changed.
    UnknownLabel,
    /// The session already reached `status`. Nothing was changed.
    NotRunning { status: SessionStatus },
    /// The session is marked running but another label holds the lock.
    NotLocked { running: Option<String> },
    /// The session was aborted and its process stopped.
    Aborted { pid: i32, forced: bool },
}

impl fmt::Display for AbortOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRunningBackup => write!(f, "no running backup"),
            Self::UnknownLabel => write!(f, "label does not exist"),
            Self::NotRunning { status } => write!(f, "backup is not running ({})", status),
            Self::NotLocked { running: Some(label) } => {
                write!(f, "backup is not running, {} holds the lock", label)
            }
            Self::NotLocked { running: None } => write!(f, "backup is not running"),
            Self::Aborted { pid, forced: false } => write!(f, "backup aborted (pid {})", pid),
            Self::Aborted { pid, forced: true } => {
                write!(f, "backup aborted, pid {} had to be killed", pid)
            }
        }
    }
}

/// Aborts the running backup `label`.
///
/// The session is marked aborted first, so the run stops at its next
/// account even if the signal is lost. The holder gets SIGTERM and `grace`
/// to wind down before SIGKILL.
pub async fn abort(store: &SessionStore, label: &str, grace: Duration) -> Result<AbortOutcome> {
    let Some(holder) = store.live_lock_holder().await? else {
        return Ok(AbortOutcome::NoRunningBackup);
    };

    let Some(session) = store.session(label).await? else {
        return Ok(AbortOutcome::UnknownLabel);
    };
    if session.status != SessionStatus::Running {
        return Ok(AbortOutcome::NotRunning {
            status: session.status,
        });
    }
    if holder.label.as_deref() != Some(label) {
        return Ok(AbortOutcome::NotLocked {
            running: holder.label,
        });
    }

    if !store.abort_session(label, Local::now()).await? {
        // Finished between the read and the update.
        let status = store
            .session_status(label)
            .await?
            .unwrap_or(SessionStatus::Aborted);
        return Ok(AbortOutcome::NotRunning { status });
    }
    store.sync().await?;
    info!(label = %label, pid = holder.pid, "Session marked aborted, stopping process");

    process::send_signal(holder.pid, Signal::SIGTERM)?;
    let mut forced = false;
    if !process::wait_for_exit(holder.pid, grace).await {
        warn!(pid = holder.pid, grace_secs = grace.as_secs(), "Process ignored SIGTERM, killing");
        process::send_signal(holder.pid, Signal::SIGKILL)?;
        forced = true;
        if !process::wait_for_exit(holder.pid, KILL_WAIT).await {
            warn!(pid = holder.pid, "Process still present after SIGKILL");
        }
    }

    store.release_lock_if_held_by(holder.pid).await?;
    store.sync().await?;

    Ok(AbortOutcome::Aborted {
        pid: holder.pid,
        forced,
    })
}
