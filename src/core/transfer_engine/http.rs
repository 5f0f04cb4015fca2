use crate::core::progress::{ProgressReader, ProgressSink};
use crate::core::transfer_engine::{Credentials, TransferTarget};
use crate::error::Error;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Url};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Read size for archive streaming.
const CHUNK_SIZE: usize = 8 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transfer engine for the mail server's REST import/export endpoint,
/// authenticated with HTTP basic auth.
pub struct HttpTransfer {
    client: Client,
    credentials: Credentials,
}

impl HttpTransfer {
    pub fn new(credentials: Credentials, accept_invalid_certs: bool) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            credentials,
        })
    }
}

#[async_trait]
impl TransferTarget for HttpTransfer {
    async fn download(
        &self,
        url: &Url,
        destination: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<u64> {
        let start_time = Instant::now();

        let mut response = self
            .client
            .get(url.clone())
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transfer(format!("GET {} returned {}", url, status)).into());
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = File::create(destination)
            .await
            .with_context(|| format!("Failed to create {}", destination.display()))?;
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE * 8, file);
        let mut total: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::Transfer(format!("Reading {} failed: {}", url, e)))?
        {
            writer
                .write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", destination.display()))?;
            total += chunk.len() as u64;
            progress.on_chunk(chunk.len() as u64);
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        debug!(
            path = %destination.display(),
            bytes = total,
            duration_secs = start_time.elapsed().as_secs(),
            "Download finished"
        );
        Ok(total)
    }

    async fn upload(
        &self,
        url: &Url,
        source: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<u64> {
        let file = File::open(source)
            .await
            .with_context(|| format!("Failed to open {}", source.display()))?;
        let size = file.metadata().await?.len();

        let stream = ReaderStream::with_capacity(ProgressReader::new(file, progress), CHUNK_SIZE);

        let response = self
            .client
            .post(url.clone())
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(CONTENT_LENGTH, size)
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Transfer(format!(
                "POST {} returned {}: {}",
                url,
                status,
                detail.trim()
            ))
            .into());
        }

        info!(bytes = size, "Upload accepted");
        Ok(size)
    }
}
