//! Bounded retry around a single artifact fetch
//!
//! hf-hub resumes from partially written blobs, so each attempt continues
//! where the previous one stopped rather than starting over.

use super::fetch::{ArtifactFetcher, FetchRequest, ProgressCallback};
use crate::error::FetchError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Retry policy for artifact fetches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each delay
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1500,
            jitter_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            jitter_ms: 0,
        }
    }

    /// Deterministic part of the delay after failed attempt `attempt` (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent))
    }

    /// Full delay: `base * 2^(attempt-1)` plus uniform jitter in `[0, jitter]`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }
}

/// Fetch with bounded retries on transient failures
///
/// Terminal failures (4xx, invalid patterns) surface on the first attempt.
/// When attempts run out, the last error is returned unchanged.
pub async fn fetch_with_retry(
    fetcher: &dyn ArtifactFetcher,
    request: &FetchRequest,
    progress: Option<ProgressCallback>,
    policy: &RetryPolicy,
) -> Result<PathBuf, FetchError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match fetcher.fetch(request, progress.clone()).await {
            Ok(path) => return Ok(path),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff_delay(attempt);
                tracing::warn!(
                    repo = %request.repo_id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Artifact fetch failed, retrying"
                );
                crate::metrics::record_fetch_retry(&request.repo_id);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        repo = %request.repo_id,
                        attempts = attempt,
                        error = %e,
                        "Artifact fetch failed after retries"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the queued errors in order, then succeeds
    struct ScriptedFetcher {
        failures: Mutex<Vec<FetchError>>,
        calls: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(mut failures: Vec<FetchError>) -> Self {
            failures.reverse();
            Self {
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ArtifactFetcher for ScriptedFetcher {
        async fn total_size(&self, _request: &FetchRequest) -> Result<u64, FetchError> {
            Ok(0)
        }

        async fn fetch(
            &self,
            request: &FetchRequest,
            _progress: Option<ProgressCallback>,
        ) -> Result<PathBuf, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.lock().unwrap().pop() {
                Some(err) => Err(err),
                None => Ok(request.cache_dir.join("snapshot")),
            }
        }
    }

    fn request() -> FetchRequest {
        FetchRequest {
            repo_id: "org/model".into(),
            cache_dir: PathBuf::from("/tmp/cache"),
            token: None,
            file_patterns: vec![],
        }
    }

    fn server_error() -> FetchError {
        FetchError::Status {
            status: 502,
            message: "bad gateway".into(),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 1500);
        assert_eq!(policy.jitter_ms, 500);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            jitter_ms: 0,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1000,
            jitter_ms: 250,
        };
        for _ in 0..100 {
            let delay = policy.backoff_delay(2);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2250));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let fetcher = ScriptedFetcher::new(vec![
            FetchError::Connection {
                message: "reset".into(),
            },
            server_error(),
        ]);

        let path = fetch_with_retry(&fetcher, &request(), None, &RetryPolicy::immediate(5))
            .await
            .unwrap();

        assert_eq!(path, PathBuf::from("/tmp/cache/snapshot"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_terminal() {
        let fetcher = ScriptedFetcher::new(vec![FetchError::Status {
            status: 401,
            message: "gated".into(),
        }]);

        let err = fetch_with_retry(&fetcher, &request(), None, &RetryPolicy::immediate(5))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 401, .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let fetcher = ScriptedFetcher::new(vec![
            FetchError::Timeout {
                message: "first".into(),
            },
            FetchError::Timeout {
                message: "second".into(),
            },
            FetchError::Timeout {
                message: "third".into(),
            },
        ]);

        let err = fetch_with_retry(&fetcher, &request(), None, &RetryPolicy::immediate(3))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "request timed out: third");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_between_attempts() {
        let fetcher = ScriptedFetcher::new(vec![server_error()]);
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1500,
            jitter_ms: 0,
        };

        let started = tokio::time::Instant::now();
        fetch_with_retry(&fetcher, &request(), None, &policy)
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(1500));
    }
}
