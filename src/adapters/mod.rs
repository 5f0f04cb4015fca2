use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::directory::{AccountDirectory, DirectorySnapshot};

pub mod ldap;
pub mod simulated;
pub mod slapcat;

pub use ldap::{LdapCredentials, LdapDirectory};
pub use simulated::{SimulatedSnapshot, StaticDirectory};
pub use slapcat::SlapcatSnapshot;

/// Accounts served by the simulated directory when none are configured.
const DEMO_ACCOUNTS: [&str; 3] = [
    "alice@example.test",
    "bob@example.test",
    "carol@example.test",
];

pub fn get_directory(config: &AppConfig) -> Arc<dyn AccountDirectory> {
    if config.simulation {
        let accounts: Vec<String> = if config.simulation_accounts.is_empty() {
            DEMO_ACCOUNTS.iter().map(|a| a.to_string()).collect()
        } else {
            config.simulation_accounts.clone()
        };
        return Arc::new(StaticDirectory::active(accounts));
    }

    Arc::new(LdapDirectory::from_config(&config.directory))
}

pub fn get_snapshot(config: &AppConfig) -> Arc<dyn DirectorySnapshot> {
    if config.simulation {
        return Arc::new(SimulatedSnapshot::default());
    }

    Arc::new(SlapcatSnapshot::new(&config.snapshot_tool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AccountStatus;

    #[tokio::test]
    async fn test_simulation_serves_demo_accounts() {
        let config = AppConfig {
            simulation: true,
            ..AppConfig::default()
        };
        let accounts = get_directory(&config)
            .list_accounts(&AccountStatus::ALL)
            .await
            .unwrap();
        assert_eq!(accounts.len(), 3);
    }

    #[tokio::test]
    async fn test_simulation_uses_configured_accounts() {
        let config = AppConfig {
            simulation: true,
            simulation_accounts: vec!["x@example.test".to_string()],
            ..AppConfig::default()
        };
        let directory = get_directory(&config);
        assert!(directory.is_valid_account("x@example.test").await.unwrap());
        assert!(!directory.is_valid_account("alice@example.test").await.unwrap());
    }
}
