//! Snapshot download with progress reporting
//!
//! Drives one bulk artifact fetch and publishes progress into a
//! [`RuntimeTracker`], mapped onto a caller-chosen sub-range of the overall
//! progress bar. When the fetcher reports bytes itself, those reports drive the
//! status; otherwise a poller measures the cache directory on a fixed cadence.
//! Both producers publish through [`ProgressSink::emit_progress`].

use super::cache;
use super::fetch::{ArtifactFetcher, FetchRequest, ProgressCallback};
use super::retry::{RetryPolicy, fetch_with_retry};
use super::runtime::{RuntimeTracker, RuntimeUpdate, clamp_progress};
use crate::error::FetchError;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Cadence of the directory-size poller
pub const POLL_INTERVAL: Duration = Duration::from_millis(800);

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// A snapshot download and where its progress goes on the bar
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub fetch: FetchRequest,
    /// Sub-range `[start, end]` of the overall progress bar
    pub progress_range: (f64, f64),
    /// Human-readable prefix for status messages (e.g., "Downloading canary")
    pub label: String,
}

/// Linearly map `current / total` into `[start, end]`
pub fn map_progress(current: u64, total: u64, start: f64, end: f64) -> f64 {
    if total == 0 {
        return start;
    }
    let fraction = (current as f64 / total as f64).clamp(0.0, 1.0);
    start + (end - start) * fraction
}

/// Binary-prefix byte count, one decimal above bytes (1536 -> "1.5 KiB")
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[derive(Debug, Default)]
struct Published {
    percent: Option<u8>,
    bytes: u64,
}

/// Serialized "publish if changed" entry point shared by both producers
#[derive(Debug)]
pub struct ProgressSink {
    runtime: Arc<RuntimeTracker>,
    total: Option<u64>,
    range: (f64, f64),
    label: String,
    published: Mutex<Published>,
}

impl ProgressSink {
    pub fn new(
        runtime: Arc<RuntimeTracker>,
        total: Option<u64>,
        range: (f64, f64),
        label: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            total: total.filter(|total| *total > 0),
            range,
            label: label.into(),
            published: Mutex::new(Published::default()),
        }
    }

    /// Publish a cumulative byte count; stale or unchanged values are dropped
    pub fn emit_progress(&self, current: u64) {
        let mut published = self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.total {
            Some(total) => {
                let (start, end) = self.range;
                let percent = clamp_progress(map_progress(current, total, start, end));
                if published.percent.is_some_and(|last| percent <= last) {
                    return;
                }
                published.percent = Some(percent);
                published.bytes = published.bytes.max(current);
                self.runtime.update(
                    RuntimeUpdate::new().progress(percent).status(format!(
                        "{} ({} / {})",
                        self.label,
                        format_bytes(current.min(total)),
                        format_bytes(total)
                    )),
                );
            }
            None => {
                if current <= published.bytes {
                    return;
                }
                published.bytes = current;
                self.runtime.update(RuntimeUpdate::new().status(format!(
                    "{} ({} downloaded)",
                    self.label,
                    format_bytes(current)
                )));
            }
        }
    }

    pub fn last_published_percent(&self) -> Option<u8> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .percent
    }
}

/// Background directory-size poller, stopped through a oneshot
struct Poller {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Poller {
    fn spawn(sink: Arc<ProgressSink>, cache_dir: PathBuf, repo_id: String) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = interval.tick() => {
                        let (dir, repo) = (cache_dir.clone(), repo_id.clone());
                        let size = tokio::task::spawn_blocking(move || {
                            cache::cache_size(&dir, &repo).unwrap_or(0)
                        })
                        .await
                        .unwrap_or(0);
                        tracing::trace!(repo = %repo_id, bytes = size, "Polled download size");
                        sink.emit_progress(size);
                    }
                }
            }
        });
        Self { stop, handle }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            tracing::debug!(error = %e, "Download poller ended abnormally");
        }
    }
}

/// Download a snapshot while publishing progress into `runtime`
///
/// Size resolution failures only disable percentages. Fetch failures stop the
/// poller and propagate unchanged; recording them is the caller's job.
pub async fn download_snapshot(
    fetcher: &dyn ArtifactFetcher,
    request: &SnapshotRequest,
    runtime: Arc<RuntimeTracker>,
    policy: &RetryPolicy,
) -> Result<PathBuf, FetchError> {
    let repo_id = request.fetch.repo_id.as_str();
    let (start, end) = request.progress_range;

    runtime.update(
        RuntimeUpdate::new()
            .progress(start)
            .status(format!("{} (resolving size)", request.label)),
    );

    let total = match fetcher.total_size(&request.fetch).await {
        Ok(total) => Some(total),
        Err(e) => {
            tracing::debug!(repo = %repo_id, error = %e, "Could not resolve snapshot size");
            None
        }
    };
    tracing::info!(
        repo = %repo_id,
        total_bytes = ?total,
        range = ?request.progress_range,
        "Starting snapshot download"
    );

    let sink = Arc::new(ProgressSink::new(
        runtime.clone(),
        total,
        request.progress_range,
        request.label.clone(),
    ));

    let (callback, poller) = if fetcher.supports_progress() {
        let sink = sink.clone();
        let callback: ProgressCallback = Arc::new(move |bytes| sink.emit_progress(bytes));
        (Some(callback), None)
    } else {
        let poller = Poller::spawn(
            sink.clone(),
            request.fetch.cache_dir.clone(),
            repo_id.to_string(),
        );
        (None, Some(poller))
    };

    let result = fetch_with_retry(fetcher, &request.fetch, callback, policy).await;

    if let Some(poller) = poller {
        poller.stop().await;
    }

    let path = result?;
    runtime.update(
        RuntimeUpdate::new()
            .progress(end)
            .status(format!("{} complete", request.label))
            .downloaded(true),
    );
    tracing::info!(repo = %repo_id, path = %path.display(), "Snapshot downloaded");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::runtime::LifecycleState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_map_progress_midpoint() {
        assert_eq!(map_progress(500, 1000, 10.0, 90.0), 50.0);
        assert_eq!(map_progress(0, 1000, 32.0, 78.0), 32.0);
        assert_eq!(map_progress(1000, 1000, 32.0, 78.0), 78.0);
        assert_eq!(map_progress(5000, 1000, 10.0, 90.0), 90.0);
        assert_eq!(map_progress(10, 0, 10.0, 90.0), 10.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
        assert_eq!(format_bytes(2 * 1024u64.pow(4)), "2.0 TiB");
        assert_eq!(format_bytes(4096 * 1024u64.pow(4)), "4096.0 TiB");
    }

    #[test]
    fn test_sink_publishes_mapped_percentage() {
        let runtime = Arc::new(RuntimeTracker::default());
        let sink = ProgressSink::new(runtime.clone(), Some(1000), (10.0, 90.0), "Downloading");

        sink.emit_progress(500);

        let snapshot = runtime.snapshot();
        assert_eq!(snapshot.progress, 50);
        assert_eq!(snapshot.status, "Downloading (500 B / 1000 B)");
    }

    #[test]
    fn test_sink_never_regresses() {
        let runtime = Arc::new(RuntimeTracker::default());
        let sink = ProgressSink::new(runtime.clone(), Some(1000), (0.0, 100.0), "Downloading");

        sink.emit_progress(600);
        let stamped = runtime.snapshot().updated_at;
        sink.emit_progress(300);
        sink.emit_progress(601);

        let snapshot = runtime.snapshot();
        assert_eq!(snapshot.progress, 60);
        assert_eq!(snapshot.updated_at, stamped);
        assert_eq!(sink.last_published_percent(), Some(60));
    }

    #[test]
    fn test_sink_without_total_reports_bytes() {
        let runtime = Arc::new(RuntimeTracker::default());
        runtime.update(RuntimeUpdate::new().progress(32));
        let sink = ProgressSink::new(runtime.clone(), None, (32.0, 78.0), "Downloading");

        sink.emit_progress(1536);

        let snapshot = runtime.snapshot();
        assert_eq!(snapshot.progress, 32);
        assert_eq!(snapshot.status, "Downloading (1.5 KiB downloaded)");
        assert!(sink.last_published_percent().is_none());
    }

    #[test]
    fn test_zero_total_is_treated_as_unknown() {
        let runtime = Arc::new(RuntimeTracker::default());
        let sink = ProgressSink::new(runtime, Some(0), (0.0, 100.0), "Downloading");
        sink.emit_progress(10);
        assert!(sink.last_published_percent().is_none());
    }

    /// Writes a file into the repo dir without reporting progress
    struct SilentFetcher {
        fail: AtomicBool,
    }

    #[async_trait]
    impl ArtifactFetcher for SilentFetcher {
        async fn total_size(&self, _request: &FetchRequest) -> Result<u64, FetchError> {
            Err(FetchError::Status {
                status: 404,
                message: "no metadata".into(),
            })
        }

        async fn fetch(
            &self,
            request: &FetchRequest,
            _progress: Option<ProgressCallback>,
        ) -> Result<PathBuf, FetchError> {
            let repo = cache::cache_repo_dir(&request.cache_dir, &request.repo_id);
            let snapshot = repo.join("snapshots/abc");
            std::fs::create_dir_all(&snapshot).unwrap();
            std::fs::write(snapshot.join("weights.bin"), vec![0u8; 2048]).unwrap();
            tokio::time::sleep(Duration::from_millis(1000)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::Status {
                    status: 403,
                    message: "gated".into(),
                });
            }
            Ok(snapshot)
        }
    }

    fn snapshot_request(cache_dir: &Path) -> SnapshotRequest {
        SnapshotRequest {
            fetch: FetchRequest {
                repo_id: "org/model".into(),
                cache_dir: cache_dir.to_path_buf(),
                token: None,
                file_patterns: vec!["*.bin".into()],
            },
            progress_range: (28.0, 96.0),
            label: "Downloading model".into(),
        }
    }

    #[tokio::test]
    async fn test_download_snapshot_polls_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RuntimeTracker::default());
        let fetcher = SilentFetcher {
            fail: AtomicBool::new(false),
        };

        let path = download_snapshot(
            &fetcher,
            &snapshot_request(dir.path()),
            runtime.clone(),
            &RetryPolicy::immediate(1),
        )
        .await
        .unwrap();

        assert!(path.ends_with("snapshots/abc"));
        let snapshot = runtime.snapshot();
        assert_eq!(snapshot.progress, 96);
        assert_eq!(snapshot.status, "Downloading model complete");
        assert!(snapshot.downloaded);
        assert_eq!(snapshot.state, LifecycleState::Idle);
        assert_eq!(cache::cache_size(dir.path(), "org/model"), Some(2048));
    }

    #[tokio::test]
    async fn test_download_snapshot_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RuntimeTracker::default());
        let fetcher = SilentFetcher {
            fail: AtomicBool::new(true),
        };

        let err = download_snapshot(
            &fetcher,
            &snapshot_request(dir.path()),
            runtime.clone(),
            &RetryPolicy::immediate(3),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 403, .. }));
        let snapshot = runtime.snapshot();
        assert!(!snapshot.downloaded);
        assert_eq!(snapshot.progress, 28);
    }
}
