//! Readiness gate for freshly started instances
//!
//! Sleep-then-probe loop with a fixed poll interval and a hard timeout. The
//! default probe issues an HTTP GET against the candidate port and treats any
//! response as ready; connection errors of any kind, including interrupted
//! connections, mean not ready yet.

use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Fixed interval between readiness probes
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-probe HTTP timeout; a hung probe must not eat the whole wait budget
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
#[error("timed out after {timeout:?} waiting for {name} to become ready")]
pub struct WaitTimeout {
    pub name: String,
    pub timeout: Duration,
}

pub struct Waiter {
    name: String,
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl Waiter {
    /// Waiter for an app instance on the given port; apps answer under their
    /// own name prefix.
    pub fn wait_for_app(name: &str, port: u16, timeout: Duration) -> Self {
        let url = format!("http://127.0.0.1:{}/{}/", port, name);
        Self::wait_for(name, url, timeout)
    }

    pub fn wait_for(name: &str, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            url: url.into(),
            timeout,
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("reqwest client with static settings"),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Block until the probe succeeds or the timeout elapses
    pub async fn block_until_ready(&self) -> Result<(), WaitTimeout> {
        let start = Instant::now();
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.probe().await {
                info!(name = %self.name, elapsed_ms = start.elapsed().as_millis() as u64, "Instance is ready");
                return Ok(());
            }
            if start.elapsed() >= self.timeout {
                return Err(WaitTimeout {
                    name: self.name.clone(),
                    timeout: self.timeout,
                });
            }
            debug!(name = %self.name, url = %self.url, "Waiting for startup");
        }
    }

    /// Any HTTP response counts as ready, regardless of status code
    async fn probe(&self) -> bool {
        self.client.get(&self.url).send().await.is_ok()
    }
}
