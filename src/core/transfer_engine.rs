use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use reqwest::Url;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::models::{ContentType, ResolvePolicy};
use crate::core::progress::ProgressSink;

pub mod http;
pub mod simulated;

pub use http::HttpTransfer;
pub use simulated::SimulatedTransfer;

/// Admin identity presented to the transfer endpoint.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Streams mailbox archives to and from the mail server.
///
/// Implementations report every chunk to `progress` and never hold a whole
/// archive in memory.
#[async_trait]
pub trait TransferTarget: Send + Sync {
    /// Fetches `url` into `destination`. Returns the number of bytes written.
    ///
    /// A failed download leaves whatever was written in place.
    async fn download(
        &self,
        url: &Url,
        destination: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<u64>;

    /// Streams `source` as the request body to `url`. Returns the bytes sent.
    async fn upload(&self, url: &Url, source: &Path, progress: Arc<dyn ProgressSink>)
    -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEngineType {
    Http,
    Simulated,
}

pub fn create_engine(
    engine_type: TransferEngineType,
    config: &AppConfig,
) -> Result<Arc<dyn TransferTarget>> {
    match engine_type {
        TransferEngineType::Http => Ok(Arc::new(HttpTransfer::new(
            Credentials {
                user: config.admin_user.clone(),
                password: config.admin_password.clone(),
            },
            config.accept_invalid_certs,
        )?)),
        TransferEngineType::Simulated => Ok(Arc::new(SimulatedTransfer::default())),
    }
}

/// Window of mailbox items to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Local>,
    pub to: DateTime<Local>,
}

/// Format of `--from-time` / `--to-time`, in local time.
const TIME_ARG_FORMAT: &str = "%Y%m%d%H%M%S";

impl TimeRange {
    /// Builds a range from `YYYYmmddHHMMSS` strings; `to` defaults to `now`.
    pub fn parse(from: &str, to: Option<&str>, now: DateTime<Local>) -> Result<Self> {
        let from = parse_local_time(from)?;
        let to = match to {
            Some(to) => parse_local_time(to)?,
            None => now,
        };
        if to < from {
            anyhow::bail!("time range ends before it starts");
        }
        Ok(Self { from, to })
    }
}

fn parse_local_time(raw: &str) -> Result<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(raw, TIME_ARG_FORMAT)
        .with_context(|| format!("Invalid time {}, expected YYYYmmddHHMMSS", raw))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| anyhow!("{} does not exist in the local time zone", raw))
}

/// Where the mail server's REST endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "https".to_string(),
            host: host.into(),
            port,
        }
    }

    fn home(&self) -> Result<Url> {
        let base = format!("{}://{}:{}/home/", self.scheme, self.host, self.port);
        Url::parse(&base).with_context(|| format!("Invalid transfer endpoint: {}", base))
    }

    /// Export URL for one account:
    /// `/home/<account>/?fmt=tgz[&types=..][&start=..&end=..]&query=is:anywhere`.
    pub fn download_url(
        &self,
        account: &str,
        types: &[ContentType],
        range: Option<TimeRange>,
    ) -> Result<Url> {
        let mut url = self.home()?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Transfer endpoint cannot carry a path"))?
            .pop_if_empty()
            .push(account)
            .push("");

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("fmt", "tgz");
            if !types.is_empty() {
                query.append_pair("types", &ContentType::join(types));
            }
            if let Some(range) = range {
                query.append_pair("start", &range.from.timestamp_millis().to_string());
                query.append_pair("end", &range.to.timestamp_millis().to_string());
            }
            query.append_pair("query", "is:anywhere");
        }
        Ok(url)
    }

    /// Import URL for one account, optionally below a destination folder.
    /// The `ignore` policy is the server default and is left out.
    pub fn restore_url(
        &self,
        account: &str,
        folder: Option<&str>,
        types: &[ContentType],
        resolve: ResolvePolicy,
    ) -> Result<Url> {
        let mut url = self.home()?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("Transfer endpoint cannot carry a path"))?;
            segments.pop_if_empty().push(account);
            if let Some(folder) = folder {
                segments.extend(folder.split('/').filter(|s| !s.is_empty()));
            }
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("fmt", "tgz");
            if !types.is_empty() {
                query.append_pair("types", &ContentType::join(types));
            }
            if resolve != ResolvePolicy::Ignore {
                query.append_pair("resolve", resolve.as_str());
            }
        }
        Ok(url)
    }
}

/// Progress of one account's transfer within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    InProgress,
    Succeeded { bytes: u64 },
    Failed { reason: String },
}

/// One account's archive transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub account: String,
    pub url: Url,
    pub path: PathBuf,
    pub state: TransferState,
}

impl TransferRequest {
    pub fn new(account: impl Into<String>, url: Url, path: PathBuf) -> Self {
        Self {
            account: account.into(),
            url,
            path,
            state: TransferState::Pending,
        }
    }
}

/// Pulls the account name back out of a `/home/<account>/...` URL.
pub fn account_from_url(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    if segments.next()? != "home" {
        return None;
    }
    segments.next().filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(url: &Url) -> Vec<(String, String)> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_download_url_minimal() {
        let endpoint = Endpoint::https("mail.example.org", 7071);
        let url = endpoint.download_url("alice@example.org", &[], None).unwrap();

        assert_eq!(url.scheme(), "https");
        assert_eq!(url.port(), Some(7071));
        assert_eq!(url.path(), "/home/alice@example.org/");
        assert_eq!(
            pairs(&url),
            vec![
                ("fmt".to_string(), "tgz".to_string()),
                ("query".to_string(), "is:anywhere".to_string()),
            ]
        );
        assert_eq!(account_from_url(&url).as_deref(), Some("alice@example.org"));
    }

    #[test]
    fn test_download_url_with_types_and_range() {
        let endpoint = Endpoint::https("localhost", 7071);
        let from = Local.with_ymd_and_hms(2015, 3, 20, 16, 0, 0).unwrap();
        let to = Local.with_ymd_and_hms(2015, 3, 21, 16, 0, 0).unwrap();
        let url = endpoint
            .download_url(
                "bob@example.org",
                &[ContentType::Message, ContentType::Contact],
                Some(TimeRange { from, to }),
            )
            .unwrap();

        let pairs = pairs(&url);
        assert_eq!(pairs[0], ("fmt".to_string(), "tgz".to_string()));
        assert_eq!(pairs[1], ("types".to_string(), "message,contact".to_string()));
        assert_eq!(pairs[2].1, from.timestamp_millis().to_string());
        assert_eq!(pairs[3].1, to.timestamp_millis().to_string());
        assert_eq!(pairs[4].1, "is:anywhere");
    }

    #[test]
    fn test_restore_url_omits_ignore_policy() {
        let endpoint = Endpoint::https("localhost", 7071);
        let url = endpoint
            .restore_url("carol@example.org", None, &[], ResolvePolicy::Ignore)
            .unwrap();
        assert_eq!(url.path(), "/home/carol@example.org");
        assert_eq!(pairs(&url), vec![("fmt".to_string(), "tgz".to_string())]);
    }

    #[test]
    fn test_restore_url_with_folder_and_policy() {
        let endpoint = Endpoint::https("localhost", 7071);
        let url = endpoint
            .restore_url(
                "carol@example.org",
                Some("/Restored/March 2015"),
                &[ContentType::Message],
                ResolvePolicy::Replace,
            )
            .unwrap();
        assert_eq!(url.path(), "/home/carol@example.org/Restored/March%202015");
        assert_eq!(
            pairs(&url),
            vec![
                ("fmt".to_string(), "tgz".to_string()),
                ("types".to_string(), "message".to_string()),
                ("resolve".to_string(), "replace".to_string()),
            ]
        );
    }

    #[test]
    fn test_time_range_parsing() {
        let now = Local.with_ymd_and_hms(2015, 4, 1, 0, 0, 0).unwrap();
        let range = TimeRange::parse("20150320160000", None, now).unwrap();
        assert_eq!(range.from, Local.with_ymd_and_hms(2015, 3, 20, 16, 0, 0).unwrap());
        assert_eq!(range.to, now);

        let range = TimeRange::parse("20150320160000", Some("20150321000000"), now).unwrap();
        assert_eq!(range.to, Local.with_ymd_and_hms(2015, 3, 21, 0, 0, 0).unwrap());

        assert!(TimeRange::parse("2015-03-20", None, now).is_err());
        assert!(TimeRange::parse("20150320160000", Some("20150301000000"), now).is_err());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            user: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        let shown = format!("{:?}", creds);
        assert!(shown.contains("admin"));
        assert!(!shown.contains("hunter2"));
    }
}
