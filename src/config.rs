use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::AccountStatus;

pub const DEFAULT_CONFIG_PATH: &str = "/opt/zimbra/conf/mailvault.toml";
const DEFAULT_ZIMBRA_HOME: &str = "/opt/zimbra";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root of the backup tree; sessions live under `<backup_root>/sessions`.
    pub backup_root: PathBuf,
    /// SQLite database holding session records and the process lock.
    pub metadata_store: PathBuf,
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: String,
    /// Accept self-signed certificates on the admin port.
    pub accept_invalid_certs: bool,
    /// Status filter used when backing up `all` accounts.
    pub account_status: Vec<AccountStatus>,
    pub snapshot_tool: PathBuf,
    /// OS user the tool must run as. `None` skips the check.
    pub run_as_user: Option<String>,
    pub log_file: Option<PathBuf>,
    pub json_logs: bool,
    pub verbose: bool,
    /// Seconds the abort command waits for a signalled run before killing it.
    pub abort_grace_secs: u64,
    pub simulation: bool,
    pub simulation_accounts: Vec<String>,
    pub directory: DirectoryConfig,
}

/// Where the account directory lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Platform local config holding the LDAP url and bind credentials.
    pub localconfig: PathBuf,
    /// Search base for account queries. Empty searches from the root DSE.
    pub search_base: String,
    pub ldap_url: Option<String>,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let home = zimbra_home();
        Self {
            backup_root: home.join("backup"),
            metadata_store: home.join("backup").join("mailvault.db"),
            host: "localhost".to_string(),
            port: 7071,
            admin_user: "admin".to_string(),
            admin_password: String::new(),
            accept_invalid_certs: false,
            account_status: AccountStatus::ALL.to_vec(),
            snapshot_tool: home.join("libexec").join("zmslapcat"),
            run_as_user: Some("zimbra".to_string()),
            log_file: None,
            json_logs: false,
            verbose: false,
            abort_grace_secs: 30,
            simulation: false,
            simulation_accounts: Vec::new(),
            directory: DirectoryConfig {
                localconfig: home.join("conf").join("localconfig.xml"),
                search_base: String::new(),
                ldap_url: None,
                bind_dn: None,
                bind_password: None,
            },
        }
    }
}

impl AppConfig {
    /// Layers defaults, the TOML file, `MAILVAULT_*` env vars and CLI overrides.
    ///
    /// A missing config file is not an error; every key has a default.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("MAILVAULT_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.backup_root.join("sessions")
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }
}

fn zimbra_home() -> PathBuf {
    std::env::var_os("ZIMBRA_HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ZIMBRA_HOME))
}
