//! Health samples and the confirmation-window pass rule
//!
//! A confirmation window is an ordered sequence of probe samples taken at
//! a fixed cadence. The rule is evaluated identically by the rolling and
//! canary strategies, and again by the coordinator's verify step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification of an HTTP status for health purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// `[200, 400)`.
    Success,
    /// `[400, 500)` — a failure, but logged distinctly.
    ClientError,
    /// `>= 500`, plus connect/tls/timeout failures.
    ServerError,
}

impl StatusClass {
    pub fn classify(status: u16) -> Self {
        match status {
            200..=399 => StatusClass::Success,
            400..=499 => StatusClass::ClientError,
            _ => StatusClass::ServerError,
        }
    }
}

/// One health probe observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    /// Position in the window, starting at 1.
    pub attempt: u32,
    /// HTTP status, absent when the probe never got a response.
    pub status_code: Option<u16>,
    /// End-to-end latency including DNS.
    pub latency_ms: u64,
    pub healthy: bool,
    pub error: Option<String>,
}

impl HealthSample {
    pub fn ok(attempt: u32, status_code: u16, latency_ms: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            attempt,
            status_code: Some(status_code),
            latency_ms,
            healthy: StatusClass::classify(status_code) == StatusClass::Success,
            error: None,
        }
    }

    pub fn failed(attempt: u32, error: impl Into<String>, latency_ms: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            attempt,
            status_code: None,
            latency_ms,
            healthy: false,
            error: Some(error.into()),
        }
    }
}

/// Parameters of a confirmation window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Spacing between scheduled probes.
    #[serde(with = "crate::duration_millis")]
    pub interval: Duration,
    /// Number of scheduled probes in the window.
    pub samples: u32,
    /// Minimum successful samples for the window to pass.
    pub min_success: u32,
    /// A failure streak of this length fails the window outright.
    pub max_consecutive_failures: u32,
    /// Per-probe timeout.
    #[serde(with = "crate::duration_millis")]
    pub probe_timeout: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            samples: 12,
            min_success: 10,
            max_consecutive_failures: 3,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl WindowConfig {
    /// Evaluate a completed (or aborted) window.
    ///
    /// Passes iff at least `min_success` samples succeeded and no failure
    /// streak reached `max_consecutive_failures` anywhere in the series.
    pub fn evaluate(&self, samples: &[HealthSample]) -> WindowOutcome {
        let mut successes = 0u32;
        let mut streak = 0u32;
        let mut longest_streak = 0u32;
        for sample in samples {
            if sample.healthy {
                successes += 1;
                streak = 0;
            } else {
                streak += 1;
                longest_streak = longest_streak.max(streak);
            }
        }
        let failures = samples.len() as u32 - successes;
        WindowOutcome {
            passed: successes >= self.min_success && longest_streak < self.max_consecutive_failures,
            successes,
            failures,
            longest_failure_streak: longest_streak,
        }
    }

    /// Whether a streak observed mid-window already dooms it. Lets the
    /// window runner abort early instead of probing to the end.
    pub fn streak_exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.max_consecutive_failures
    }
}

/// Result of evaluating a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOutcome {
    pub passed: bool,
    pub successes: u32,
    pub failures: u32,
    pub longest_failure_streak: u32,
}
