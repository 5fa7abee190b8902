//! Page artifact storage, isolated HTTP sessions, and the durable job/dossier stores.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod dossiers;
pub mod events;
pub mod postgres;
pub mod queue;

pub use dossiers::{DossierStore, DossierStoreError, MemoryDossierStore};
pub use events::{ChannelCompletionSink, CompletionSink, TracingCompletionSink};
pub use postgres::{connect_and_migrate, PgDossierStore, PgJobQueue};
pub use queue::{
    Clock, JobQueue, ManualClock, MemoryJobQueue, QueueConfig, QueueError, SystemClock,
};

pub const CRATE_NAME: &str = "dossier-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Raw page captures, one directory per job and target.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
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

    pub fn artifact_relative_path(
        &self,
        job_id: Uuid,
        target_slug: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(job_id.to_string())
            .join(target_slug)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        job_id: Uuid,
        target_slug: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(job_id, target_slug, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("artifact path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
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
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Writes one captured page plus a `<page-hash>.json` sidecar listing every URL the
    /// same bytes were captured from.
    pub async fn store_page(
        &self,
        job_id: Uuid,
        target_slug: &str,
        url: &str,
        fetched_at: DateTime<Utc>,
        html: &str,
    ) -> anyhow::Result<StoredArtifact> {
        let stored = self
            .store_bytes(job_id, target_slug, "html", html.as_bytes())
            .await?;
        let sidecar_path = stored.absolute_path.with_extension("json");
        let mut sidecar = match fs::read(&sidecar_path).await {
            Ok(raw) => serde_json::from_slice::<PageSidecar>(&raw)
                .with_context(|| format!("decoding page sidecar {}", sidecar_path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => PageSidecar {
                sha256: stored.content_hash.clone(),
                captures: Vec::new(),
            },
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading page sidecar {}", sidecar_path.display()))
            }
        };
        if sidecar.captures.iter().any(|c| c.url == url) {
            return Ok(stored);
        }
        sidecar.captures.push(PageCapture {
            url: url.to_string(),
            fetched_at,
        });
        let bytes = serde_json::to_vec_pretty(&sidecar).context("encoding page sidecar")?;
        replace_file(&sidecar_path, &bytes).await?;
        Ok(stored)
    }
}

/// Provenance of one stored page body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSidecar {
    pub sha256: String,
    pub captures: Vec<PageCapture>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCapture {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
}

/// Temp file then rename, so readers never see a half-written file.
async fn replace_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path {} has no parent", path.display()))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}

/// Lowercase, dash-separated directory name for a target.
pub fn slugify(input: &str) -> String {
    let slug = input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "target".to_string()
    } else {
        slug
    }
}

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
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
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
    /// Upper bound for loading one page, including the body.
    pub page_timeout: Duration,
    pub user_agent: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_secs(30),
            user_agent: None,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Opens isolated sessions: every session owns its client and cookie jar.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    config: HttpClientConfig,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("building http session: {0}")]
    Session(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::TooLarge { .. } | Self::Session(_) => RetryDisposition::NonRetryable,
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    pub fn open_session(&self) -> Result<FetchSession, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(self.config.page_timeout);

        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| FetchError::Session(err.to_string()))?;
        Ok(FetchSession {
            id: Uuid::new_v4(),
            client,
            max_body_bytes: self.config.max_body_bytes,
        })
    }
}

/// One browsing session. Dropping it discards its cookies and connections.
#[derive(Debug)]
pub struct FetchSession {
    id: Uuid,
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl FetchSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Single attempt. Any HTTP status comes back as a response so callers can
    /// inspect error bodies; retries belong to the caller.
    pub async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", session = %self.id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if let Some(len) = resp.content_length() {
                if len as usize > self.max_body_bytes {
                    return Err(FetchError::TooLarge {
                        url: final_url,
                        limit: self.max_body_bytes,
                    });
                }
            }
            let body = resp.bytes().await?.to_vec();
            if body.len() > self.max_body_bytes {
                return Err(FetchError::TooLarge {
                    url: final_url,
                    limit: self.max_body_bytes,
                });
            }
            debug!(status = status.as_u16(), bytes = body.len(), "page fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn page_captures_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let job_id = Uuid::new_v4();
        let fetched_at = DateTime::parse_from_rfc3339("2026-10-12T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_page(job_id, "host-motors", "https://host.example/", fetched_at, "<html>same</html>")
            .await
            .expect("first store");
        let second = store
            .store_page(job_id, "host-motors", "https://host.example/", fetched_at, "<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert!(first
            .relative_path
            .starts_with(PathBuf::from(job_id.to_string()).join("host-motors")));

        let sidecar: PageSidecar = serde_json::from_slice(
            &std::fs::read(first.absolute_path.with_extension("json")).unwrap(),
        )
        .unwrap();
        assert_eq!(sidecar.sha256, first.content_hash);
        assert_eq!(sidecar.captures.len(), 1);
    }

    #[tokio::test]
    async fn identical_bodies_from_two_urls_share_one_sidecar() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let job_id = Uuid::new_v4();
        let fetched_at = Utc::now();
        let body = "<html>inventory</html>";

        let first = store
            .store_page(job_id, "rival", "https://rival.example/inventory", fetched_at, body)
            .await
            .expect("first store");
        let second = store
            .store_page(job_id, "rival", "https://rival.example/used", fetched_at, body)
            .await
            .expect("second store");
        assert!(second.deduplicated);

        let sidecar_path = dir
            .path()
            .join(job_id.to_string())
            .join("rival")
            .join(format!("{}.json", first.content_hash));
        let sidecar: PageSidecar =
            serde_json::from_slice(&std::fs::read(&sidecar_path).expect("sidecar")).unwrap();
        let urls = sidecar.captures.iter().map(|c| c.url.as_str()).collect::<Vec<_>>();
        assert_eq!(urls, ["https://rival.example/inventory", "https://rival.example/used"]);

        let files = std::fs::read_dir(sidecar_path.parent().unwrap()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
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
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn slugs_are_filesystem_safe() {
        assert_eq!(slugify("Host Motors & Sons, LLC"), "host-motors-sons-llc");
        assert_eq!(slugify("***"), "target");
    }
}
