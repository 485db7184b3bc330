//! HTTP health prober
//!
//! The one production port implementation that ships with the core: a
//! reqwest-backed prober measuring end-to-end latency including DNS.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use convoy_types::{HealthSample, StatusClass};

use crate::error::ProbeError;
use crate::prober::HealthProber;

/// Probes an HTTP endpoint once per call.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(
        &self,
        url: &str,
        timeout: Duration,
        attempt: u32,
    ) -> Result<HealthSample, ProbeError> {
        let started = std::time::Instant::now();
        let result = self.client.get(url).timeout(timeout).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let now = chrono::Utc::now();

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                if StatusClass::classify(status) == StatusClass::ClientError {
                    debug!(url, status, "health probe got client error status");
                }
                Ok(HealthSample::ok(attempt, status, latency_ms, now))
            }
            Err(e) if e.is_timeout() => Err(ProbeError::Timeout),
            Err(e) if e.is_connect() => Err(ProbeError::Connect(e.to_string())),
            Err(e) => Err(ProbeError::Connect(e.to_string())),
        }
    }
}
