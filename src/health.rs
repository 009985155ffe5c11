//! HTTP readiness checks for inference servers

use anyhow::Result;
use std::future::Future;
use tokio::time::{Duration, Instant, interval};

/// Polls a server's health endpoint until it answers with a 2xx
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    client: reqwest::Client,
    poll_interval: Duration,
}

impl ReadinessCheck {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_secs(1))
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            poll_interval,
        }
    }

    /// Single health check
    pub async fn check(&self, url: &str) -> Result<()> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Health check returned status: {}", response.status());
        }

        Ok(())
    }

    /// Poll `url` until healthy, `alive` reports the process gone, or `timeout`
    ///
    /// Returns the number of checks it took.
    pub async fn wait_for_ready<F, Fut>(
        &self,
        url: &str,
        timeout: Duration,
        mut alive: F,
    ) -> Result<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(self.poll_interval);
        let mut attempts = 0;

        loop {
            ticker.tick().await;
            attempts += 1;

            match self.check(url).await {
                Ok(()) => {
                    tracing::info!(url = %url, attempts, "Server is ready");
                    return Ok(attempts);
                }
                Err(e) => {
                    tracing::debug!(url = %url, attempts, error = %e, "Server not ready yet");
                }
            }

            if !alive().await {
                anyhow::bail!("Server process exited before becoming ready");
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "Server did not become ready within {}s",
                    timeout.as_secs()
                );
            }
        }
    }
}

impl Default for ReadinessCheck {
    fn default() -> Self {
        Self::new()
    }
}
