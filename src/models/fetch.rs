//! Remote artifact repository boundary
//!
//! [`ArtifactFetcher`] is the seam between the lifecycle core and the
//! HuggingFace Hub. The production implementation downloads with the hf-hub
//! crate into the shared cache root and resolves expected sizes through the Hub
//! metadata API. Every failure is classified into a [`FetchError`] so the
//! retry helper can tell transient failures from terminal ones.

use super::cache;
use crate::error::FetchError;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use hf_hub::api::tokio::{ApiBuilder, Progress};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const HUB_ENDPOINT: &str = "https://huggingface.co";

/// Receives the cumulative number of bytes fetched so far
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// One snapshot fetch: which repo, where to, with what credential
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub repo_id: String,
    /// Shared cache root; artifacts land in `models--<sanitized>` below it
    pub cache_dir: PathBuf,
    pub token: Option<String>,
    /// Glob patterns restricting which files are fetched. Empty means all.
    pub file_patterns: Vec<String>,
}

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Expected total size in bytes of the files the request would fetch
    async fn total_size(&self, request: &FetchRequest) -> Result<u64, FetchError>;

    /// Fetch the snapshot and return its local directory
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, FetchError>;

    /// Whether `fetch` invokes the progress callback
    fn supports_progress(&self) -> bool {
        false
    }
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Fetcher backed by hf-hub and the Hub metadata API
#[derive(Debug, Clone)]
pub struct HfHubFetcher {
    endpoint: String,
    client: reqwest::Client,
}

impl HfHubFetcher {
    pub fn new() -> Self {
        Self::with_endpoint(HUB_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn list_files(&self, request: &FetchRequest) -> Result<Vec<RepoFile>, FetchError> {
        let url = format!("{}/api/models/{}?blobs=true", self.endpoint, request.repo_id);
        let mut builder = self.client.get(&url);
        if let Some(token) = &request.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(classify_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                message: format!("{}: {}", request.repo_id, message.trim()),
            });
        }

        let info: RepoMetadata = response.json().await.map_err(classify_error)?;
        let filter = build_filter(&request.file_patterns)?;
        Ok(info
            .siblings
            .into_iter()
            .filter(|file| filter.as_ref().is_none_or(|set| set.is_match(&file.rfilename)))
            .collect())
    }
}

impl Default for HfHubFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactFetcher for HfHubFetcher {
    async fn total_size(&self, request: &FetchRequest) -> Result<u64, FetchError> {
        let files = self.list_files(request).await?;
        Ok(files.iter().filter_map(|file| file.size).sum())
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, FetchError> {
        let files = self.list_files(request).await?;
        if files.is_empty() {
            return Err(FetchError::Other {
                message: format!(
                    "no files in {} match patterns {:?}",
                    request.repo_id, request.file_patterns
                ),
            });
        }

        let api = ApiBuilder::new()
            .with_cache_dir(request.cache_dir.clone())
            .with_token(request.token.clone())
            .with_progress(false)
            .build()
            .map_err(classify_error)?;
        let repo = api.model(request.repo_id.clone());

        let tracker = ByteTracker::new(progress);
        for file in &files {
            tracing::debug!(
                repo = %request.repo_id,
                file = %file.rfilename,
                size = ?file.size,
                "Fetching file"
            );
            repo.download_with_progress(&file.rfilename, tracker.clone())
                .await
                .map_err(classify_error)?;
            tracker.file_done();
        }

        cache::snapshot_path(&request.cache_dir, &request.repo_id).ok_or_else(|| {
            FetchError::Other {
                message: format!("snapshot for {} missing after fetch", request.repo_id),
            }
        })
    }

    fn supports_progress(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct RepoMetadata {
    #[serde(default)]
    siblings: Vec<RepoFile>,
}

#[derive(Debug, Deserialize)]
struct RepoFile {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

fn build_filter(patterns: &[String]) -> Result<Option<GlobSet>, FetchError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| FetchError::Other {
            message: format!("invalid file pattern '{}': {}", pattern, e),
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| FetchError::Other {
            message: format!("invalid file patterns: {}", e),
        })
}

/// Turns per-file hf-hub progress into a cumulative byte count
#[derive(Clone)]
struct ByteTracker {
    callback: Option<ProgressCallback>,
    completed: Arc<AtomicU64>,
    current: Arc<AtomicU64>,
}

impl ByteTracker {
    fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            completed: Arc::new(AtomicU64::new(0)),
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    fn file_done(&self) {
        let current = self.current.swap(0, Ordering::SeqCst);
        self.completed.fetch_add(current, Ordering::SeqCst);
    }

    fn report(&self) {
        if let Some(callback) = &self.callback {
            callback(self.completed.load(Ordering::SeqCst) + self.current.load(Ordering::SeqCst));
        }
    }
}

impl Progress for ByteTracker {
    async fn init(&mut self, _size: usize, filename: &str) {
        self.current.store(0, Ordering::SeqCst);
        tracing::trace!(file = %filename, "File transfer started");
    }

    async fn update(&mut self, size: usize) {
        self.current.fetch_add(size as u64, Ordering::SeqCst);
        self.report();
    }

    async fn finish(&mut self) {
        self.report();
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Walk an error's source chain and classify the first recognizable cause
pub fn classify_error<E>(err: E) -> FetchError
where
    E: std::error::Error + 'static,
{
    let message = err.to_string();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(&err);

    while let Some(cause) = current {
        if let Some(e) = cause.downcast_ref::<reqwest::Error>()
            && let Some(classified) = classify_reqwest(e, &message)
        {
            return classified;
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>()
            && let Some(classified) = classify_io(e, &message)
        {
            return classified;
        }
        current = cause.source();
    }

    classify_message(&message)
}

fn classify_reqwest(err: &reqwest::Error, message: &str) -> Option<FetchError> {
    let message = message.to_string();
    if let Some(status) = err.status() {
        return Some(FetchError::Status {
            status: status.as_u16(),
            message,
        });
    }
    if err.is_timeout() {
        return Some(FetchError::Timeout { message });
    }
    if err.is_connect() {
        return Some(FetchError::Connection { message });
    }
    if err.is_body() || err.is_decode() {
        return Some(FetchError::ChunkedTransfer { message });
    }
    None
}

fn classify_io(err: &std::io::Error, message: &str) -> Option<FetchError> {
    use std::io::ErrorKind;

    let message = message.to_string();
    match err.kind() {
        ErrorKind::TimedOut => Some(FetchError::Timeout { message }),
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe => Some(FetchError::Connection { message }),
        ErrorKind::UnexpectedEof => Some(FetchError::ChunkedTransfer { message }),
        _ => None,
    }
}

fn classify_message(message: &str) -> FetchError {
    let lower = message.to_lowercase();
    let message = message.to_string();
    if lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake") {
        FetchError::Tls { message }
    } else if lower.contains("chunk") || lower.contains("incomplete") {
        FetchError::ChunkedTransfer { message }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        FetchError::Timeout { message }
    } else if lower.contains("connection") {
        FetchError::Connection { message }
    } else {
        FetchError::Other { message }
    }
}
