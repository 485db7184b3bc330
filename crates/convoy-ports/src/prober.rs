//! Health-probe port

use async_trait::async_trait;
use std::time::Duration;

use convoy_types::HealthSample;

use crate::error::ProbeError;

/// Single HTTP health probe.
///
/// Transport failures (connect, tls, timeout) come back as `Err`; any
/// HTTP response, success or error status, comes back as a sample. The
/// caller stamps the window position via `attempt`.
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(
        &self,
        url: &str,
        timeout: Duration,
        attempt: u32,
    ) -> Result<HealthSample, ProbeError>;
}
