//! Retrying HTTP download plus the latest on-disk snapshot of each yearly archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub const CRATE_NAME: &str = "cot-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Result of recording one year's archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReceipt {
    pub year: i32,
    pub path: PathBuf,
    pub sha256: String,
    /// Digest of the snapshot this one replaced, if the year had one.
    pub previous_sha256: Option<String>,
}

impl SnapshotReceipt {
    /// Upstream republished the year with different content.
    pub fn revised(&self) -> bool {
        self.previous_sha256
            .as_deref()
            .is_some_and(|previous| previous != self.sha256)
    }
}

/// Keeps exactly one archive per report year, `<dir>/<year>.zip`.
///
/// The current year's archive is republished every week, so a new download
/// replaces the old file. Replacement goes through a temp file and a rename,
/// so readers never see a half-written archive.
#[derive(Debug, Clone)]
pub struct ArchiveSnapshots {
    dir: PathBuf,
}

impl ArchiveSnapshots {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, year: i32) -> PathBuf {
        self.dir.join(format!("{year}.zip"))
    }

    pub async fn record(&self, year: i32, bytes: &[u8]) -> anyhow::Result<SnapshotReceipt> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.dir.display()))?;

        let path = self.path_for(year);
        let previous_sha256 = previous_digest(&path).await?;
        let receipt = SnapshotReceipt {
            year,
            path,
            sha256: sha256_hex(bytes),
            previous_sha256,
        };
        if receipt.previous_sha256.as_deref() == Some(receipt.sha256.as_str()) {
            return Ok(receipt);
        }

        let partial = self.dir.join(format!(".{year}.{}.partial", Uuid::new_v4()));
        fs::write(&partial, bytes)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        if let Err(err) = fs::rename(&partial, &receipt.path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err)
                .with_context(|| format!("replacing snapshot {}", receipt.path.display()));
        }
        Ok(receipt)
    }
}

async fn previous_digest(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read(path).await {
        Ok(existing) => Ok(Some(sha256_hex(&existing))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading snapshot {}", path.display())),
    }
}

/// Doubling delay between attempts, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry`, counting from zero.
    pub fn delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .map_or(self.max_delay, |factor| self.initial_delay.saturating_mul(factor))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{url} answered http {status}")]
    Status { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl FetchError {
    /// Server errors, throttling and connection-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::Transport(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            retry: config.retry,
        })
    }

    /// Body of a successful GET. A non-success status is `FetchError::Status`
    /// once retries are exhausted, or immediately when it is not transient.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.get_with_retry(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn get_with_retry(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry = 0;
        loop {
            match self.get_once(url).await {
                Ok(body) => {
                    debug!(bytes = body.len(), attempts = retry + 1, "download complete");
                    return Ok(body);
                }
                Err(err) if err.is_transient() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay(retry);
                    warn!(
                        error = %err,
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient download failure"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
