use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of one backup session. Only `Running` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Aborted,
    /// The directory-service snapshot failed before any account was touched.
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "completed_with_errors" => Ok(Self::CompletedWithErrors),
            "aborted" => Ok(Self::Aborted),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown session status: {}", other),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the directory-service snapshot phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryBackupStatus {
    Completed,
    Aborted,
    Failed,
}

impl DirectoryBackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DirectoryBackupStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown directory backup status: {}", other),
        }
    }
}

/// Persisted record of one backup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub label: String,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub status: SessionStatus,
    pub directory_backup_status: Option<DirectoryBackupStatus>,
    pub total_accounts: u64,
    /// Accounts that succeeded, in processing order.
    pub accounts: Vec<String>,
    /// Failed account -> reason.
    pub fail_accounts: BTreeMap<String, String>,
}

impl Session {
    pub fn new(label: impl Into<String>, total_accounts: u64) -> Self {
        Self {
            label: label.into(),
            start_time: Local::now(),
            end_time: None,
            status: SessionStatus::Running,
            directory_backup_status: None,
            total_accounts,
            accounts: Vec::new(),
            fail_accounts: BTreeMap::new(),
        }
    }
}

/// Account lifecycle states understood by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Locked,
    Closed,
    Lockout,
    Pending,
}

impl AccountStatus {
    pub const ALL: [AccountStatus; 5] = [
        Self::Active,
        Self::Locked,
        Self::Closed,
        Self::Lockout,
        Self::Pending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Locked => "locked",
            Self::Closed => "closed",
            Self::Lockout => "lockout",
            Self::Pending => "pending",
        }
    }
}

/// Mailbox content categories accepted by the transfer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Message,
    Contact,
    Appointment,
    Task,
    Document,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Contact => "contact",
            Self::Appointment => "appointment",
            Self::Task => "task",
            Self::Document => "document",
        }
    }

    /// Comma-joined form used in the `types` query parameter.
    pub fn join(types: &[ContentType]) -> String {
        types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Duplicate handling applied by the server during restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResolvePolicy {
    #[default]
    Ignore,
    Modify,
    Replace,
    Reset,
}

impl ResolvePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Modify => "modify",
            Self::Replace => "replace",
            Self::Reset => "reset",
        }
    }
}

/// What a backup run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupTarget {
    /// Every account matching the configured status filter.
    All,
    /// Directory-service snapshot only.
    DirectoryOnly,
    /// An explicit list of accounts, validated before the run starts.
    Accounts(Vec<String>),
}

impl BackupTarget {
    /// Parses `all`, `ldap`, or a comma-separated account list.
    /// Blank entries are dropped and duplicates keep their first position.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim() {
            "all" => Ok(Self::All),
            "ldap" => Ok(Self::DirectoryOnly),
            list => {
                let mut accounts: Vec<String> = Vec::new();
                for account in list.split(',').map(str::trim).filter(|a| !a.is_empty()) {
                    check_account_name(account)?;
                    if !accounts.iter().any(|a| a == account) {
                        accounts.push(account.to_string());
                    }
                }
                if accounts.is_empty() {
                    anyhow::bail!("no accounts given in backup target");
                }
                Ok(Self::Accounts(accounts))
            }
        }
    }
}

/// Rejects account names that cannot be used as an archive file name
/// inside the session's `accounts/` directory.
pub fn check_account_name(account: &str) -> anyhow::Result<()> {
    if account.is_empty()
        || account == "."
        || account.contains("..")
        || account.contains(['/', '\\', '\0'])
    {
        anyhow::bail!("invalid account name {:?}", account);
    }
    Ok(())
}

/// Keeps the first occurrence of every account, in order.
pub fn dedup_accounts(accounts: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(accounts.len());
    for account in accounts {
        if !unique.contains(&account) {
            unique.push(account);
        }
    }
    unique
}

/// Generates a session label of the form `full-YYYYmmdd.HHMMSS.ffffff`.
pub fn new_label(now: DateTime<Local>) -> String {
    format!("full-{}", now.format("%Y%m%d.%H%M%S%.6f"))
}
