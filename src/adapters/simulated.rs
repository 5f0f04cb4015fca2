use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs;

use crate::core::directory::{AccountDirectory, DirectorySnapshot, SnapshotMode};
use crate::core::models::AccountStatus;

/// In-memory account directory.
pub struct StaticDirectory {
    accounts: Vec<(String, AccountStatus)>,
    queries: AtomicUsize,
}

impl StaticDirectory {
    pub fn new<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (S, AccountStatus)>,
        S: Into<String>,
    {
        Self {
            accounts: accounts
                .into_iter()
                .map(|(name, status)| (name.into(), status))
                .collect(),
            queries: AtomicUsize::new(0),
        }
    }

    /// Every account active.
    pub fn active<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(accounts.into_iter().map(|a| (a, AccountStatus::Active)))
    }

    /// Number of directory calls made so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn list_accounts(&self, statuses: &[AccountStatus]) -> Result<Vec<String>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .accounts
            .iter()
            .filter(|(_, status)| statuses.contains(status))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn is_valid_account(&self, account: &str) -> Result<bool> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.accounts.iter().any(|(name, _)| name == account))
    }
}

/// Snapshot tool stand-in that writes one placeholder file per mode.
#[derive(Default)]
pub struct SimulatedSnapshot {
    /// Mode whose snapshot fails, if any.
    pub fail_on: Option<SnapshotMode>,
}

impl SimulatedSnapshot {
    pub fn failing_on(mode: SnapshotMode) -> Self {
        Self {
            fail_on: Some(mode),
        }
    }
}

#[async_trait]
impl DirectorySnapshot for SimulatedSnapshot {
    async fn snapshot(&self, destination: &Path, mode: SnapshotMode) -> Result<()> {
        if self.fail_on == Some(mode) {
            return Err(io::Error::other(format!("simulated {:?} snapshot failure", mode)).into());
        }
        fs::create_dir_all(destination).await?;
        let name = match mode {
            SnapshotMode::Data => "ldap.bak",
            SnapshotMode::Config => "ldap-config.bak",
            SnapshotMode::AccessLog => "ldap-accesslog.bak",
        };
        fs::write(destination.join(name), b"# simulated\n").await?;
        Ok(())
    }
}
