//! Backup runs: planning in the foreground, then the locked session run.

use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::directory::backup_directory_service;
use crate::core::models::{
    BackupTarget, ContentType, DirectoryBackupStatus, Session, SessionStatus, check_account_name,
    dedup_accounts, new_label,
};
use crate::core::progress::ThrottledProgress;
use crate::core::transfer_engine::{Endpoint, TimeRange, TransferRequest, TransferState};
use crate::db::{LockGuard, Recorded, SessionStore};
use crate::error::Error;

/// What the caller asked to back up.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub target: BackupTarget,
    pub types: Vec<ContentType>,
    pub range: Option<TimeRange>,
}

impl BackupRequest {
    pub fn new(target: BackupTarget) -> Self {
        Self {
            target,
            types: Vec::new(),
            range: None,
        }
    }
}

/// A validated backup, ready to run under the lock.
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub label: String,
    pub label_dir: PathBuf,
    pub target: BackupTarget,
    /// Accounts to transfer, in processing order. Empty for directory-only runs.
    pub accounts: Vec<String>,
    pub types: Vec<ContentType>,
    pub range: Option<TimeRange>,
}

impl BackupPlan {
    pub fn directory_dir(&self) -> PathBuf {
        self.label_dir.join("ldap")
    }

    pub fn accounts_dir(&self) -> PathBuf {
        self.label_dir.join("accounts")
    }
}

pub struct BackupOrchestrator {
    ctx: AppContext,
    endpoint: Endpoint,
    cancel: CancellationToken,
}

impl BackupOrchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let endpoint = Endpoint::https(&ctx.config.host, ctx.config.port);
        Self {
            ctx,
            endpoint,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Stops the run before the next account once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Validates the destination, resolves the accounts and creates the
    /// label directory. Nothing is recorded in the session store yet.
    pub async fn plan(&self, request: BackupRequest) -> Result<BackupPlan> {
        let root = &self.ctx.config.backup_root;
        if !fs::metadata(root).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::Backup(format!(
                "backup path {} does not exist",
                root.display()
            ))
            .into());
        }

        let sessions_dir = self.ctx.config.sessions_dir();
        fs::create_dir_all(&sessions_dir)
            .await
            .with_context(|| format!("Failed to create {}", sessions_dir.display()))?;

        let accounts = self.resolve_accounts(&request.target).await?;

        let label = new_label(Local::now());
        let label_dir = sessions_dir.join(&label);
        // create_dir, not create_dir_all: an existing directory means a label clash.
        fs::create_dir(&label_dir)
            .await
            .with_context(|| format!("Failed to create {}", label_dir.display()))?;

        debug!(label = %label, accounts = accounts.len(), "Backup planned");
        Ok(BackupPlan {
            label,
            label_dir,
            target: request.target,
            accounts,
            types: request.types,
            range: request.range,
        })
    }

    async fn resolve_accounts(&self, target: &BackupTarget) -> Result<Vec<String>> {
        match target {
            BackupTarget::DirectoryOnly => Ok(Vec::new()),
            BackupTarget::All => {
                let statuses = &self.ctx.config.account_status;
                let listed = self.ctx.directory.list_accounts(statuses).await?;
                let accounts = dedup_accounts(listed);
                info!(count = accounts.len(), "Enumerated accounts");
                Ok(accounts)
            }
            BackupTarget::Accounts(accounts) => {
                for account in accounts {
                    if !self.ctx.directory.is_valid_account(account).await? {
                        return Err(Error::Backup(format!("invalid account {}", account)).into());
                    }
                }
                Ok(accounts.clone())
            }
        }
    }

    /// Runs a planned backup under the process lock and returns the final
    /// session record.
    pub async fn run(&self, store: &SessionStore, plan: &BackupPlan) -> Result<Session> {
        let guard = store.acquire_lock().await?;

        let result = self.run_locked(store, &guard, plan).await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release process lock");
        }
        result?;

        store
            .session(&plan.label)
            .await?
            .with_context(|| format!("Session {} vanished from the store", plan.label))
    }

    async fn run_locked(
        &self,
        store: &SessionStore,
        guard: &LockGuard,
        plan: &BackupPlan,
    ) -> Result<()> {
        let label = plan.label.as_str();
        guard.attach_label(label).await?;

        store
            .create_session(&Session::new(label, plan.accounts.len() as u64))
            .await?;
        store.sync().await?;
        info!(label = %label, total = plan.accounts.len(), "Backup session started");

        let directory_dir = plan.directory_dir();
        if let Err(e) = self.backup_directory(&directory_dir).await {
            error!(label = %label, error = %e, "Directory service backup failed");
            store
                .set_directory_backup_status(label, DirectoryBackupStatus::Failed)
                .await?;
            store
                .finish_session(label, SessionStatus::Failed, Local::now())
                .await?;
            store.sync().await?;
            return Err(Error::Backup(format!("directory service backup failed: {:#}", e)).into());
        }
        store
            .set_directory_backup_status(label, DirectoryBackupStatus::Completed)
            .await?;
        info!(label = %label, "Directory service backup completed");

        if plan.target == BackupTarget::DirectoryOnly {
            store
                .finish_session(label, SessionStatus::Completed, Local::now())
                .await?;
            store.sync().await?;
            return Ok(());
        }

        let accounts_dir = plan.accounts_dir();
        fs::create_dir_all(&accounts_dir)
            .await
            .with_context(|| format!("Failed to create {}", accounts_dir.display()))?;

        let (mut succeeded, mut failed) = (0usize, 0usize);
        let mut stopped = false;

        for account in &plan.accounts {
            store.sync().await?;
            if self.should_stop(store, label).await? {
                stopped = true;
                break;
            }

            let url = check_account_name(account)
                .and_then(|()| self.endpoint.download_url(account, &plan.types, plan.range));
            let state = match url {
                Ok(url) => {
                    let path = accounts_dir.join(format!("{}.tgz", account));
                    self.download_account(TransferRequest::new(account, url, path))
                        .await
                        .map(|request| request.state)
                }
                Err(e) => Some(TransferState::Failed {
                    reason: format!("{:#}", e),
                }),
            };
            let Some(state) = state else {
                stopped = true;
                break;
            };

            let recorded = match &state {
                TransferState::Succeeded { bytes } => {
                    info!(account = %account, bytes, "Account backed up");
                    succeeded += 1;
                    store.record_success(label, account).await?
                }
                TransferState::Failed { reason } => {
                    error!(account = %account, reason = %reason, "Account backup failed");
                    failed += 1;
                    store.record_failure(label, account, reason).await?
                }
                TransferState::Pending | TransferState::InProgress => Recorded::NotRunning,
            };
            match recorded {
                Recorded::Recorded => {}
                Recorded::Duplicate => {
                    warn!(account = %account, "Account already has an outcome in this session");
                }
                Recorded::NotRunning => {
                    // The session left the running state underneath us.
                    stopped = true;
                    break;
                }
            }
        }

        if stopped {
            if store.abort_session(label, Local::now()).await? {
                warn!(label = %label, "Backup cancelled");
            } else {
                warn!(label = %label, "Backup aborted externally");
            }
        } else {
            let status = if failed == 0 {
                SessionStatus::Completed
            } else {
                SessionStatus::CompletedWithErrors
            };
            store.finish_session(label, status, Local::now()).await?;
        }
        store.sync().await?;

        info!(label = %label, succeeded, failed, "Backup finished");
        Ok(())
    }

    async fn backup_directory(&self, destination: &Path) -> Result<()> {
        fs::create_dir_all(destination)
            .await
            .with_context(|| format!("Failed to create {}", destination.display()))?;
        backup_directory_service(self.ctx.snapshot.as_ref(), destination).await
    }

    async fn should_stop(&self, store: &SessionStore, label: &str) -> Result<bool> {
        if self.cancel.is_cancelled() {
            return Ok(true);
        }
        Ok(store.session_status(label).await? != Some(SessionStatus::Running))
    }

    /// Transfers one account. Returns `None` if the run was cancelled
    /// mid-transfer, in which case the partial archive is removed.
    async fn download_account(&self, mut request: TransferRequest) -> Option<TransferRequest> {
        request.state = TransferState::InProgress;
        debug!(account = %request.account, url = %request.url, "Downloading");

        let progress = Arc::new(ThrottledProgress::for_download(&request.account));
        let transfer = self
            .ctx
            .transfer
            .download(&request.url, &request.path, progress);

        tokio::select! {
            result = transfer => {
                request.state = match result {
                    Ok(bytes) => TransferState::Succeeded { bytes },
                    Err(e) => TransferState::Failed { reason: format!("{:#}", e) },
                };
                Some(request)
            }
            _ = self.cancel.cancelled() => {
                if let Err(e) = fs::remove_file(&request.path).await {
                    debug!(path = %request.path.display(), error = %e, "No partial archive to remove");
                }
                None
            }
        }
    }
}
