//! Health polling used to decide when a freshly spawned server can serve.

use std::time::Duration;

use tokio::time::Instant;

pub const HEALTH_PATH: &str = "/health";

/// Delay between two health checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout of a single health request.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Overall readiness deadline used when none is configured.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Polls `GET /health` until it returns 200.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    health_url: String,
    interval: Duration,
    http: reqwest::Client,
}

impl ReadinessProbe {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            health_url: format!("{}{HEALTH_PATH}", base_url.trim_end_matches('/')),
            interval: POLL_INTERVAL,
            http,
        })
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    /// Returns `true` once the endpoint answers 200, `false` after `timeout`.
    ///
    /// Refused connections and non-200 answers are treated alike and retried:
    /// the server may not be listening yet, or may still be loading the model.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        while Instant::now() < deadline {
            attempts += 1;
            match self.http.get(&self.health_url).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => {
                    tracing::debug!(attempts, "server reported healthy");
                    return true;
                }
                Ok(response) => {
                    tracing::trace!(status = %response.status(), "server not ready yet");
                }
                Err(err) => {
                    tracing::trace!(%err, "health check failed");
                }
            }
            tokio::time::sleep(self.interval).await;
        }

        tracing::debug!(attempts, ?timeout, "server did not become healthy");
        false
    }
}

/// Convenience wrapper: probe `base_url` with the default interval.
pub async fn wait_ready(base_url: &str, timeout: Duration) -> bool {
    match ReadinessProbe::new(base_url) {
        Ok(probe) => probe.wait(timeout).await,
        Err(err) => {
            tracing::error!(%err, "could not build health check client");
            false
        }
    }
}
