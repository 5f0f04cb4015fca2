use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, warn};

use crate::core::models::AccountStatus;

/// Read access to the platform's account directory.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Mail accounts whose status is in `statuses`, excluding system and
    /// calendar resources, in directory order.
    async fn list_accounts(&self, statuses: &[AccountStatus]) -> Result<Vec<String>>;

    /// Whether `account` exists as a mail account that is not a system or
    /// calendar resource.
    async fn is_valid_account(&self, account: &str) -> Result<bool>;
}

/// Which part of the directory service a snapshot captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    Data,
    Config,
    AccessLog,
}

impl SnapshotMode {
    /// Flag passed to the snapshot tool, if any.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            Self::Data => None,
            Self::Config => Some("-c"),
            Self::AccessLog => Some("-a"),
        }
    }
}

/// External tool that dumps the directory service to disk.
#[async_trait]
pub trait DirectorySnapshot: Send + Sync {
    /// Writes one snapshot into `destination`. A failing tool yields an
    /// I/O error carrying its combined output.
    async fn snapshot(&self, destination: &Path, mode: SnapshotMode) -> Result<()>;
}

/// Runs the full directory-service backup into `destination`.
///
/// Data and config snapshots are required; the access log may legitimately
/// not exist, so its failure is only logged.
pub async fn backup_directory_service(
    snapshot: &dyn DirectorySnapshot,
    destination: &Path,
) -> Result<()> {
    snapshot.snapshot(destination, SnapshotMode::Data).await?;
    debug!(path = %destination.display(), "Directory data snapshot complete");

    snapshot.snapshot(destination, SnapshotMode::Config).await?;
    debug!(path = %destination.display(), "Directory config snapshot complete");

    if let Err(e) = snapshot.snapshot(destination, SnapshotMode::AccessLog).await {
        warn!(
            error = %e,
            "Could not back up the directory access log, it probably does not exist"
        );
    }
    Ok(())
}

/// Builds the search filter for mail accounts in the given statuses.
pub fn account_filter(statuses: &[AccountStatus]) -> String {
    let status_filter = match statuses {
        [] => String::new(),
        [single] => format!("(zimbraAccountStatus={})", single.as_str()),
        many => format!(
            "(|{})",
            many.iter()
                .map(|s| format!("(zimbraAccountStatus={})", s.as_str()))
                .collect::<String>()
        ),
    };
    format!(
        "(&(objectClass=zimbraAccount){}(!(zimbraIsSystemResource=TRUE))(!(objectClass=zimbraCalendarResource)))",
        status_filter
    )
}

/// Builds the search filter matching exactly one mail account.
pub fn single_account_filter(account: &str) -> String {
    format!(
        "(&(objectClass=zimbraAccount)(zimbraMailDeliveryAddress={})(!(zimbraIsSystemResource=TRUE))(!(objectClass=zimbraCalendarResource)))",
        escape_filter_value(account)
    )
}

/// Escapes RFC 4515 special characters in a filter assertion value.
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            c => escaped.push(c),
        }
    }
    escaped
}
