use crate::core::progress::ProgressSink;
use crate::core::transfer_engine::{TransferTarget, account_from_url};
use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Duration, sleep};

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Download,
    Upload,
}

/// A request seen by the simulated engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCall {
    pub kind: CallKind,
    pub url: Url,
}

/// Transfer engine that fabricates archives locally.
///
/// Accounts listed in `failing` fail their transfer, which lets a run
/// exercise partial failures without a mail server.
pub struct SimulatedTransfer {
    pub archive_size: usize,
    pub chunk_delay: Duration,
    failing: HashSet<String>,
    calls: Mutex<Vec<TransferCall>>,
}

impl Default for SimulatedTransfer {
    fn default() -> Self {
        Self {
            archive_size: 64 * 1024,
            chunk_delay: Duration::ZERO,
            failing: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl SimulatedTransfer {
    pub fn failing<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: accounts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<TransferCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, kind: CallKind, url: &Url) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(TransferCall {
                kind,
                url: url.clone(),
            });
        }
    }

    fn check_failure(&self, url: &Url) -> Result<()> {
        match account_from_url(url) {
            Some(account) if self.failing.contains(&account) => Err(Error::Transfer(format!(
                "simulated connection reset for {}",
                account
            ))
            .into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TransferTarget for SimulatedTransfer {
    async fn download(
        &self,
        url: &Url,
        destination: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<u64> {
        self.record(CallKind::Download, url);
        self.check_failure(url)?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(destination).await?;

        let chunk = vec![0x1f_u8; CHUNK_SIZE];
        let mut written = 0usize;
        while written < self.archive_size {
            let n = CHUNK_SIZE.min(self.archive_size - written);
            file.write_all(&chunk[..n]).await?;
            written += n;
            progress.on_chunk(n as u64);
            if !self.chunk_delay.is_zero() {
                sleep(self.chunk_delay).await;
            }
        }
        file.flush().await?;

        Ok(written as u64)
    }

    async fn upload(
        &self,
        url: &Url,
        source: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<u64> {
        self.record(CallKind::Upload, url);
        self.check_failure(url)?;

        let mut file = File::open(source).await?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            progress.on_chunk(n as u64);
            if !self.chunk_delay.is_zero() {
                sleep(self.chunk_delay).await;
            }
        }
        Ok(total)
    }
}
