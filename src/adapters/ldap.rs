use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::DirectoryConfig;
use crate::core::directory::{AccountDirectory, account_filter, single_account_filter};
use crate::core::models::AccountStatus;
use crate::error::Error;

const ADDRESS_ATTR: &str = "zimbraMailDeliveryAddress";

/// LDAP result code for "no such object".
const LDAP_NO_SUCH_OBJECT: u32 = 32;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind parameters for the directory server.
#[derive(Clone, PartialEq)]
pub struct LdapCredentials {
    pub url: String,
    pub bind_dn: String,
    pub password: String,
}

impl std::fmt::Debug for LdapCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapCredentials")
            .field("url", &self.url)
            .field("bind_dn", &self.bind_dn)
            .finish_non_exhaustive()
    }
}

impl LdapCredentials {
    /// Uses explicit config values, falling back to the platform's
    /// `localconfig.xml` for whatever is missing.
    pub fn resolve(config: &DirectoryConfig) -> Result<Self> {
        if let (Some(url), Some(bind_dn), Some(password)) =
            (&config.ldap_url, &config.bind_dn, &config.bind_password)
        {
            return Ok(Self {
                url: url.clone(),
                bind_dn: bind_dn.clone(),
                password: password.clone(),
            });
        }

        let from_file = Self::from_localconfig(&config.localconfig)?;
        Ok(Self {
            url: config.ldap_url.clone().unwrap_or(from_file.url),
            bind_dn: config.bind_dn.clone().unwrap_or(from_file.bind_dn),
            password: config.bind_password.clone().unwrap_or(from_file.password),
        })
    }

    pub fn from_localconfig(path: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse_localconfig(&xml)
            .with_context(|| format!("Error getting LDAP credentials in {}", path.display()))
    }

    /// Extracts `ldap_url`, `zimbra_ldap_userdn` and `zimbra_ldap_password`
    /// from `<key name=".."><value>..</value></key>` entries.
    pub fn parse_localconfig(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let (mut url, mut bind_dn, mut password) = (None, None, None);
        let mut key: Option<String> = None;
        let mut in_value = false;

        loop {
            match reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == b"key" => {
                    key = match e.try_get_attribute("name")? {
                        Some(attr) => Some(attr.unescape_value()?.into_owned()),
                        None => None,
                    };
                }
                Event::End(e) if e.name().as_ref() == b"key" => key = None,
                Event::Start(e) if e.name().as_ref() == b"value" => in_value = true,
                Event::End(e) if e.name().as_ref() == b"value" => in_value = false,
                Event::Text(text) if in_value => {
                    let value = text.unescape()?.trim().to_string();
                    match key.as_deref() {
                        Some("ldap_url") => url = Some(value),
                        Some("zimbra_ldap_userdn") => bind_dn = Some(value),
                        Some("zimbra_ldap_password") => password = Some(value),
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self {
            // ldap_url may list several servers; the first one is enough.
            url: url
                .and_then(|u| u.split_whitespace().next().map(str::to_string))
                .ok_or_else(|| anyhow!("ldap_url missing"))?,
            bind_dn: bind_dn.ok_or_else(|| anyhow!("zimbra_ldap_userdn missing"))?,
            password: password.ok_or_else(|| anyhow!("zimbra_ldap_password missing"))?,
        })
    }
}

/// Account directory queried over LDAP.
///
/// Credentials built from config are resolved on first query, so commands
/// that never touch the directory do not need `localconfig.xml`.
pub struct LdapDirectory {
    search_base: String,
    config: Option<DirectoryConfig>,
    credentials: OnceCell<LdapCredentials>,
}

impl LdapDirectory {
    pub fn new(credentials: LdapCredentials, search_base: impl Into<String>) -> Self {
        Self {
            search_base: search_base.into(),
            config: None,
            credentials: OnceCell::new_with(Some(credentials)),
        }
    }

    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self {
            search_base: config.search_base.clone(),
            config: Some(config.clone()),
            credentials: OnceCell::new(),
        }
    }

    async fn credentials(&self) -> Result<&LdapCredentials> {
        self.credentials
            .get_or_try_init(|| async {
                let Some(config) = &self.config else {
                    return Err(anyhow!("no directory credentials configured"));
                };
                LdapCredentials::resolve(config)
                    .map_err(|e| anyhow::Error::from(Error::DirectoryQuery(format!("{:#}", e))))
            })
            .await
    }

    async fn search(&self, filter: &str) -> Result<Vec<String>> {
        let credentials = self.credentials().await?;
        debug!(url = %credentials.url, filter = %filter, "Querying directory");

        self.query(credentials, filter).await.map_err(|e| {
            anyhow::Error::from(Error::DirectoryQuery(format!("{}: {:#}", credentials.url, e)))
        })
    }

    async fn query(&self, credentials: &LdapCredentials, filter: &str) -> Result<Vec<String>> {
        let settings = LdapConnSettings::new().set_conn_timeout(CONNECT_TIMEOUT);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &credentials.url).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection closed with error");
            }
        });

        ldap.simple_bind(&credentials.bind_dn, &credentials.password)
            .await?
            .success()?;

        let result = ldap
            .search(&self.search_base, Scope::Subtree, filter, vec![ADDRESS_ATTR])
            .await?;
        let addresses = if result.1.rc == LDAP_NO_SUCH_OBJECT {
            Vec::new()
        } else {
            let (entries, _) = result.success()?;
            entries
                .into_iter()
                .map(SearchEntry::construct)
                .filter_map(|entry| first_address(&entry))
                .collect()
        };

        if let Err(e) = ldap.unbind().await {
            debug!(error = %e, "LDAP unbind failed");
        }
        Ok(addresses)
    }
}

#[async_trait]
impl AccountDirectory for LdapDirectory {
    async fn list_accounts(&self, statuses: &[AccountStatus]) -> Result<Vec<String>> {
        self.search(&account_filter(statuses)).await
    }

    async fn is_valid_account(&self, account: &str) -> Result<bool> {
        let found = self.search(&single_account_filter(account)).await?;
        Ok(found.first().is_some_and(|a| a == account))
    }
}

/// The primary delivery address of an entry, if it has one.
fn first_address(entry: &SearchEntry) -> Option<String> {
    let address = entry
        .attrs
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(ADDRESS_ATTR))
        .and_then(|(_, values)| values.first().cloned());
    if address.is_none() && !entry.bin_attrs.is_empty() {
        warn!(dn = %entry.dn, "Delivery address is not valid UTF-8, skipping entry");
    }
    address
}
