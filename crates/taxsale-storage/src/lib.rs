//! HTTP fetch utilities, raw-source snapshots, and the persistence seam.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub mod store;

pub use store::{MemStore, PgStore, Store, StoreError};

pub const CRATE_NAME: &str = "taxsale-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl FetchedBody {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client with retry/backoff and concurrency limits. County
/// sources are fragile; everything is capped globally and per source so a
/// burst of jobs never hammers one site.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get(&self, source: &str, url: &str) -> Result<FetchedBody, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", source, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedBody {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        source: &str,
        url: &str,
    ) -> Result<T, FetchError> {
        let fetched = self.get(source, url).await?;
        serde_json::from_slice(&fetched.body).map_err(|e| FetchError::HttpStatus {
            status: 0,
            url: format!("{url} (invalid JSON body: {e})"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw fetched source bodies. Re-scrapes of an
/// unchanged page dedupe to the existing file; writes go through an atomic
/// temp-file rename so a crashed job never leaves a torn snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn relative_path(
        source: &str,
        fetched_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source).join(day).join(format!("{content_hash}.{ext}"))
    }

    pub async fn store(
        &self,
        source: &str,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<Snapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(source, fetched_at, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(Snapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = absolute_path
            .parent()
            .expect("snapshot path always has parent")
            .join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(Snapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(Snapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming snapshot into place at {}", absolute_path.display())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn snapshots_deduplicate_by_content() {
        let dir = tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-08-04T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = snapshots
            .store("collin", fetched_at, "html", b"<table>same</table>")
            .await
            .expect("first store");
        let second = snapshots
            .store("collin", fetched_at, "html", b"<table>same</table>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
        assert!(first.relative_path.starts_with("collin"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_status_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
