use anyhow::Result;
use chrono::{DateTime, Local};
use tokio_rusqlite::rusqlite::{OptionalExtension, TransactionBehavior};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::process;

/// Current owner of the process lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHolder {
    pub pid: i32,
    /// Session the holder is running, once it has created one.
    pub label: Option<String>,
    pub acquired_at: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockAttempt {
    Acquired,
    /// A live process already holds the lock.
    Held(i32),
}

/// Takes the lock for `pid` unless another live process holds it.
///
/// The read, the liveness probe and the write happen inside one
/// `BEGIN IMMEDIATE` transaction, so two contenders cannot both see a free
/// lock.
pub async fn acquire(conn: &Connection, pid: i32) -> Result<LockAttempt> {
    let now = Local::now().to_rfc3339();
    let attempt = conn
        .call(move |c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<i32> = tx
                .query_row("SELECT pid FROM process_lock WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .optional()?
                .flatten();

            if let Some(holder) = current {
                if process::is_alive(holder) {
                    return Ok::<_, rusqlite::Error>(LockAttempt::Held(holder));
                }
            }

            tx.execute(
                "INSERT INTO process_lock (id, pid, label, acquired_at) VALUES (1, ?1, NULL, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    pid = excluded.pid,
                    label = NULL,
                    acquired_at = excluded.acquired_at",
                params![pid, now],
            )?;
            tx.commit()?;
            Ok(LockAttempt::Acquired)
        })
        .await?;

    Ok(attempt)
}

/// Records which session the lock holder is running.
pub async fn attach_label(conn: &Connection, pid: i32, label: &str) -> Result<()> {
    let label = label.to_string();
    conn.call(move |c| {
        c.execute(
            "UPDATE process_lock SET label = ?2 WHERE id = 1 AND pid = ?1",
            params![pid, label],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

/// Clears the lock regardless of who holds it.
pub async fn release(conn: &Connection) -> Result<()> {
    conn.call(|c| {
        c.execute(
            "UPDATE process_lock SET pid = NULL, label = NULL, acquired_at = NULL WHERE id = 1",
            [],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

/// Clears the lock only if `pid` still holds it. Returns whether it did.
pub async fn release_if_held_by(conn: &Connection, pid: i32) -> Result<bool> {
    let cleared = conn
        .call(move |c| {
            let n = c.execute(
                "UPDATE process_lock SET pid = NULL, label = NULL, acquired_at = NULL
                 WHERE id = 1 AND pid = ?1",
                params![pid],
            )?;
            Ok::<usize, rusqlite::Error>(n)
        })
        .await?;
    Ok(cleared > 0)
}

/// The stored holder, alive or not.
pub async fn holder(conn: &Connection) -> Result<Option<LockHolder>> {
    let row = conn
        .call(|c| {
            let row = c
                .query_row(
                    "SELECT pid, label, acquired_at FROM process_lock WHERE id = 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, Option<i32>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?;
            Ok::<_, rusqlite::Error>(row)
        })
        .await?;

    let Some((Some(pid), label, acquired_at)) = row else {
        return Ok(None);
    };

    Ok(Some(LockHolder {
        pid,
        label,
        acquired_at: acquired_at
            .as_deref()
            .map(super::sessions::parse_time)
            .transpose()?,
    }))
}

/// The stored holder, only if that process is still alive.
pub async fn live_holder(conn: &Connection) -> Result<Option<LockHolder>> {
    Ok(holder(conn)
        .await?
        .filter(|holder| process::is_alive(holder.pid)))
}
