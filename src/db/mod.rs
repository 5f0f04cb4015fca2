//! Persistent session store and process lock, kept in one SQLite database.
//!
//! Sessions and the lock live in separate tables. Every mutation is its own
//! committed statement, so a reader in another process (the abort command,
//! `mailvault sessions`) always sees the latest recorded progress.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_rusqlite::{Connection, rusqlite};
use tracing::debug;

use crate::core::{DirectoryBackupStatus, Session, SessionStatus};
use crate::error::Error;
use crate::process;

pub mod lock;
pub mod sessions;

pub use lock::{LockAttempt, LockHolder};
pub use sessions::Recorded;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the metadata database.
#[derive(Clone)]
pub struct SessionStore {
    conn: Connection,
    path: PathBuf,
}

impl SessionStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metadata directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(&path)
            .await
            .with_context(|| format!("Failed to open session store {}", path.display()))?;

        conn.call(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "FULL")?;

            let schema = include_str!("schema.sql");
            conn.execute_batch(schema)?;

            // Enable foreign keys (SQLite disables them by default!)
            conn.execute("PRAGMA foreign_keys = ON;", [])?;

            Ok::<(), rusqlite::Error>(())
        })
        .await?;

        debug!(path = %path.display(), "Session store opened");
        Ok(Self { conn, path })
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn create_session(&self, session: &Session) -> Result<()> {
        sessions::create(&self.conn, session).await
    }

    pub async fn session(&self, label: &str) -> Result<Option<Session>> {
        sessions::get(&self.conn, label).await
    }

    pub async fn sessions(&self) -> Result<Vec<Session>> {
        sessions::list(&self.conn).await
    }

    pub async fn session_status(&self, label: &str) -> Result<Option<SessionStatus>> {
        sessions::status(&self.conn, label).await
    }

    pub async fn set_directory_backup_status(
        &self,
        label: &str,
        status: DirectoryBackupStatus,
    ) -> Result<()> {
        sessions::set_directory_backup_status(&self.conn, label, status).await
    }

    pub async fn record_success(&self, label: &str, account: &str) -> Result<Recorded> {
        sessions::record_success(&self.conn, label, account).await
    }

    pub async fn record_failure(
        &self,
        label: &str,
        account: &str,
        reason: &str,
    ) -> Result<Recorded> {
        sessions::record_failure(&self.conn, label, account, reason).await
    }

    pub async fn finish_session(
        &self,
        label: &str,
        status: SessionStatus,
        end_time: DateTime<Local>,
    ) -> Result<bool> {
        sessions::finish(&self.conn, label, status, end_time).await
    }

    pub async fn abort_session(&self, label: &str, end_time: DateTime<Local>) -> Result<bool> {
        sessions::abort(&self.conn, label, end_time).await
    }

    /// Takes the process lock for the current process.
    ///
    /// Fails with [`Error::Locking`] when a live process already holds it.
    pub async fn acquire_lock(&self) -> Result<LockGuard> {
        let pid = process::current_pid();
        match lock::acquire(&self.conn, pid).await? {
            LockAttempt::Acquired => {
                debug!(pid, "Process lock acquired");
                Ok(LockGuard {
                    store: self.clone(),
                    pid,
                })
            }
            LockAttempt::Held(holder) => Err(Error::Locking { pid: holder }.into()),
        }
    }

    pub async fn lock_holder(&self) -> Result<Option<LockHolder>> {
        lock::holder(&self.conn).await
    }

    pub async fn live_lock_holder(&self) -> Result<Option<LockHolder>> {
        lock::live_holder(&self.conn).await
    }

    pub async fn release_lock(&self) -> Result<()> {
        lock::release(&self.conn).await
    }

    pub async fn release_lock_if_held_by(&self, pid: i32) -> Result<bool> {
        lock::release_if_held_by(&self.conn, pid).await
    }

    /// Checkpoints the write-ahead log into the main database file.
    pub async fn sync(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.sync().await?;
        self.conn
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to close session store: {}", e))
    }
}

/// A session still marked running while no live process holds the lock for
/// it was cut short, not in progress.
pub fn is_interrupted(session: &Session, live_holder: Option<&LockHolder>) -> bool {
    session.status == SessionStatus::Running
        && live_holder.and_then(|holder| holder.label.as_deref()) != Some(session.label.as_str())
}

/// Proof that this process holds the lock.
///
/// Release it explicitly on every exit path. A guard that is dropped without
/// release leaves a stale pid behind, which later runs ignore once this
/// process has exited.
pub struct LockGuard {
    store: SessionStore,
    pid: i32,
}

impl LockGuard {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub async fn attach_label(&self, label: &str) -> Result<()> {
        lock::attach_label(&self.store.conn, self.pid, label).await
    }

    pub async fn release(self) -> Result<()> {
        self.store.release_lock().await?;
        debug!(pid = self.pid, "Process lock released");
        Ok(())
    }
}
