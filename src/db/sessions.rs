use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::{DirectoryBackupStatus, Session, SessionStatus};

/// Raw column values, parsed outside the connection thread.
struct SessionRow {
    label: String,
    start_time: String,
    end_time: Option<String>,
    status: String,
    directory_backup_status: Option<String>,
    total_accounts: i64,
    outcomes: Vec<(String, String, Option<String>)>,
}

pub async fn create(conn: &Connection, session: &Session) -> Result<()> {
    if session.status != SessionStatus::Running {
        bail!("New session {} must start in running state", session.label);
    }

    let label = session.label.clone();
    let start_time = session.start_time.to_rfc3339();
    let total = session.total_accounts as i64;

    let inserted = conn
        .call(move |c| {
            let n = c.execute(
                "INSERT INTO sessions (label, start_time, status, total_accounts)
                 VALUES (?1, ?2, 'running', ?3)
                 ON CONFLICT(label) DO NOTHING",
                params![label, start_time, total],
            )?;
            Ok::<usize, rusqlite::Error>(n)
        })
        .await?;

    if inserted == 0 {
        bail!("Session label already exists: {}", session.label);
    }
    Ok(())
}

pub async fn get(conn: &Connection, label: &str) -> Result<Option<Session>> {
    let label = label.to_string();
    let row = conn
        .call(move |c| {
            let row = c
                .query_row(
                    "SELECT label, start_time, end_time, status, directory_backup_status, total_accounts
                     FROM sessions WHERE label = ?1",
                    params![label],
                    |row| {
                        Ok(SessionRow {
                            label: row.get(0)?,
                            start_time: row.get(1)?,
                            end_time: row.get(2)?,
                            status: row.get(3)?,
                            directory_backup_status: row.get(4)?,
                            total_accounts: row.get(5)?,
                            outcomes: Vec::new(),
                        })
                    },
                )
                .optional()?;

            match row {
                Some(mut row) => {
                    row.outcomes = load_outcomes(c, &row.label)?;
                    Ok::<_, rusqlite::Error>(Some(row))
                }
                None => Ok(None),
            }
        })
        .await?;

    row.map(into_session).transpose()
}

/// Every session, oldest first.
pub async fn list(conn: &Connection) -> Result<Vec<Session>> {
    let rows = conn
        .call(|c| {
            let mut stmt = c.prepare(
                "SELECT label, start_time, end_time, status, directory_backup_status, total_accounts
                 FROM sessions ORDER BY start_time, label",
            )?;
            let mut rows = stmt
                .query_map([], |row| {
                    Ok(SessionRow {
                        label: row.get(0)?,
                        start_time: row.get(1)?,
                        end_time: row.get(2)?,
                        status: row.get(3)?,
                        directory_backup_status: row.get(4)?,
                        total_accounts: row.get(5)?,
                        outcomes: Vec::new(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for row in &mut rows {
                row.outcomes = load_outcomes(c, &row.label)?;
            }
            Ok::<_, rusqlite::Error>(rows)
        })
        .await?;

    rows.into_iter().map(into_session).collect()
}

pub async fn set_directory_backup_status(
    conn: &Connection,
    label: &str,
    status: DirectoryBackupStatus,
) -> Result<()> {
    let label = label.to_string();
    conn.call(move |c| {
        c.execute(
            "UPDATE sessions SET directory_backup_status = ?2
             WHERE label = ?1 AND status = 'running'",
            params![label, status.as_str()],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

/// What happened to an account outcome handed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Recorded,
    /// The account already has an outcome in this session.
    Duplicate,
    /// The session is missing or no longer running.
    NotRunning,
}

/// Records an account as backed up.
pub async fn record_success(conn: &Connection, label: &str, account: &str) -> Result<Recorded> {
    record_outcome(conn, label, account, "succeeded", None).await
}

/// Records an account failure with its reason.
pub async fn record_failure(
    conn: &Connection,
    label: &str,
    account: &str,
    reason: &str,
) -> Result<Recorded> {
    record_outcome(conn, label, account, "failed", Some(reason.to_string())).await
}

async fn record_outcome(
    conn: &Connection,
    label: &str,
    account: &str,
    outcome: &'static str,
    reason: Option<String>,
) -> Result<Recorded> {
    let label = label.to_string();
    let account = account.to_string();
    let recorded = conn
        .call(move |c| {
            let n = c.execute(
                "INSERT INTO session_accounts (label, account, position, outcome, reason)
                 SELECT ?1, ?2,
                        (SELECT COUNT(*) FROM session_accounts WHERE label = ?1),
                        ?3, ?4
                 WHERE EXISTS (SELECT 1 FROM sessions WHERE label = ?1 AND status = 'running')
                 ON CONFLICT(label, account) DO NOTHING",
                params![label, account, outcome, reason],
            )?;
            if n > 0 {
                return Ok::<Recorded, rusqlite::Error>(Recorded::Recorded);
            }
            let running: bool = c.query_row(
                "SELECT EXISTS (SELECT 1 FROM sessions WHERE label = ?1 AND status = 'running')",
                params![label],
                |row| row.get(0),
            )?;
            Ok(if running {
                Recorded::Duplicate
            } else {
                Recorded::NotRunning
            })
        })
        .await?;
    Ok(recorded)
}

/// Moves a running session to a terminal status and stamps its end time.
///
/// Returns false when the session was not running; terminal sessions never
/// change status again.
pub async fn finish(
    conn: &Connection,
    label: &str,
    status: SessionStatus,
    end_time: DateTime<Local>,
) -> Result<bool> {
    if !status.is_terminal() {
        bail!("Cannot finish session {} with status {}", label, status);
    }

    let label = label.to_string();
    let end_time = end_time.to_rfc3339();
    let updated = conn
        .call(move |c| {
            let n = c.execute(
                "UPDATE sessions SET status = ?2, end_time = ?3
                 WHERE label = ?1 AND status = 'running'",
                params![label, status.as_str(), end_time],
            )?;
            Ok::<usize, rusqlite::Error>(n)
        })
        .await?;
    Ok(updated > 0)
}

/// Marks a running session aborted. The directory backup status defaults to
/// aborted when the snapshot phase had not finished.
pub async fn abort(conn: &Connection, label: &str, end_time: DateTime<Local>) -> Result<bool> {
    let label = label.to_string();
    let end_time = end_time.to_rfc3339();
    let updated = conn
        .call(move |c| {
            let n = c.execute(
                "UPDATE sessions SET status = 'aborted', end_time = ?2,
                    directory_backup_status = COALESCE(directory_backup_status, 'aborted')
                 WHERE label = ?1 AND status = 'running'",
                params![label, end_time],
            )?;
            Ok::<usize, rusqlite::Error>(n)
        })
        .await?;
    Ok(updated > 0)
}

pub async fn status(conn: &Connection, label: &str) -> Result<Option<SessionStatus>> {
    let label = label.to_string();
    let status = conn
        .call(move |c| {
            let status = c
                .query_row(
                    "SELECT status FROM sessions WHERE label = ?1",
                    params![label],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok::<_, rusqlite::Error>(status)
        })
        .await?;

    status.map(|s| s.parse()).transpose()
}

fn load_outcomes(
    c: &rusqlite::Connection,
    label: &str,
) -> rusqlite::Result<Vec<(String, String, Option<String>)>> {
    let mut stmt = c.prepare(
        "SELECT account, outcome, reason FROM session_accounts
         WHERE label = ?1 ORDER BY position",
    )?;
    stmt.query_map(params![label], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })?
    .collect()
}

fn into_session(row: SessionRow) -> Result<Session> {
    let mut accounts = Vec::new();
    let mut fail_accounts = BTreeMap::new();
    for (account, outcome, reason) in row.outcomes {
        match outcome.as_str() {
            "succeeded" => accounts.push(account),
            "failed" => {
                fail_accounts.insert(account, reason.unwrap_or_default());
            }
            other => bail!("Unknown account outcome {} in session {}", other, row.label),
        }
    }

    Ok(Session {
        start_time: parse_time(&row.start_time)?,
        end_time: row.end_time.as_deref().map(parse_time).transpose()?,
        status: row.status.parse()?,
        directory_backup_status: row
            .directory_backup_status
            .as_deref()
            .map(str::parse)
            .transpose()?,
        total_accounts: u64::try_from(row.total_accounts)
            .map_err(|_| anyhow!("Negative account total in session {}", row.label))?,
        accounts,
        fail_accounts,
        label: row.label,
    })
}

pub(crate) fn parse_time(raw: &str) -> Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Local))
        .with_context(|| format!("Invalid timestamp in session store: {}", raw))
}
