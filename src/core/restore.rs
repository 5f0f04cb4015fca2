use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::models::{ContentType, ResolvePolicy, check_account_name};
use crate::core::progress::ThrottledProgress;
use crate::core::transfer_engine::Endpoint;
use crate::error::Error;

/// One account archive to push back into the mail server.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub label: String,
    /// Account whose archive was captured under `label`.
    pub source_account: String,
    /// Account receiving the content. Defaults to the source account.
    pub dest_account: Option<String>,
    pub resolve: ResolvePolicy,
    /// Folder below the destination mailbox root.
    pub dest_folder: Option<String>,
    pub types: Vec<ContentType>,
}

impl RestoreRequest {
    pub fn new(label: impl Into<String>, source_account: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            source_account: source_account.into(),
            dest_account: None,
            resolve: ResolvePolicy::default(),
            dest_folder: None,
            types: Vec::new(),
        }
    }

    pub fn dest_account(&self) -> &str {
        self.dest_account.as_deref().unwrap_or(&self.source_account)
    }

    /// Rejects labels and account names that would resolve outside the
    /// session tree.
    pub fn validate(&self) -> Result<()> {
        if self.label.is_empty()
            || self.label.starts_with('.')
            || self.label.contains(['/', '\\'])
        {
            anyhow::bail!("invalid label {:?}", self.label);
        }
        check_account_name(&self.source_account)?;
        check_account_name(self.dest_account())
    }
}

/// A restore whose archive has been located.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub request: RestoreRequest,
    pub archive: PathBuf,
    pub size: u64,
}

/// Archive location for `account` in session `label`.
pub fn archive_path(backup_root: &Path, label: &str, account: &str) -> PathBuf {
    backup_root
        .join("sessions")
        .join(label)
        .join("accounts")
        .join(format!("{}.tgz", account))
}

pub struct RestoreOrchestrator {
    ctx: AppContext,
    endpoint: Endpoint,
}

impl RestoreOrchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let endpoint = Endpoint::https(&ctx.config.host, ctx.config.port);
        Self { ctx, endpoint }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Locates the archive. Fails with [`Error::Restore`] before anything
    /// touches the network.
    pub async fn plan(&self, request: RestoreRequest) -> Result<RestorePlan> {
        request
            .validate()
            .map_err(|e| anyhow::Error::from(Error::Restore(format!("{:#}", e))))?;

        let root = &self.ctx.config.backup_root;
        if !fs::metadata(root).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::Restore(format!(
                "backup path {} does not exist",
                root.display()
            ))
            .into());
        }

        let archive = archive_path(root, &request.label, &request.source_account);
        debug!(path = %archive.display(), "Archive path");
        let size = match fs::metadata(&archive).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                return Err(Error::Restore(format!(
                    "could not find archive {}",
                    archive.display()
                ))
                .into());
            }
        };

        Ok(RestorePlan {
            request,
            archive,
            size,
        })
    }

    /// Uploads the archive. Returns the number of bytes sent.
    pub async fn run(&self, plan: &RestorePlan) -> Result<u64> {
        let request = &plan.request;
        let dest = request.dest_account();

        let url = self.endpoint.restore_url(
            dest,
            request.dest_folder.as_deref(),
            &request.types,
            request.resolve,
        )?;
        debug!(url = %url, "Restore URL");

        info!(
            resolve = request.resolve.as_str(),
            types = %ContentType::join(&request.types),
            "Restore options"
        );
        info!(
            source = %request.source_account,
            dest = %dest,
            size_mb = plan.size / 1024 / 1024,
            "Starting restore"
        );
        if request.source_account == dest {
            warn!("Restoring to the same account could duplicate or reset the content");
        }

        let progress = Arc::new(ThrottledProgress::for_upload(
            &request.source_account,
            plan.size,
        ));
        match self.ctx.transfer.upload(&url, &plan.archive, progress).await {
            Ok(bytes) => {
                info!(account = %dest, bytes, "Restore completed");
                Ok(bytes)
            }
            Err(e) => {
                error!(account = %dest, error = %e, "Error restoring account");
                Err(e).with_context(|| format!("Restore into {} failed", dest))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_path_layout() {
        assert_eq!(
            archive_path(Path::new("/opt/zimbra/backup"), "full-1", "a@x.org"),
            PathBuf::from("/opt/zimbra/backup/sessions/full-1/accounts/a@x.org.tgz")
        );
    }

    #[test]
    fn test_destination_defaults_to_source() {
        let mut request = RestoreRequest::new("full-1", "a@x.org");
        assert_eq!(request.dest_account(), "a@x.org");
        request.dest_account = Some("b@x.org".to_string());
        assert_eq!(request.dest_account(), "b@x.org");
    }
}
