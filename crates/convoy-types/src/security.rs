//! Security scan results and the policy decision rule

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Vulnerability counts by severity, as reported by the scanner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityCounts {
    pub total: u32,
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl VulnerabilityCounts {
    pub fn new(critical: u32, high: u32, medium: u32, low: u32) -> Self {
        Self {
            total: critical + high + medium + low,
            critical,
            high,
            medium,
            low,
        }
    }

    /// Weighted risk score in [0, 100].
    ///
    /// Weights: critical 25, high 10, medium 3, low 1.
    pub fn risk_score(&self) -> u32 {
        (self.critical * 25 + self.high * 10 + self.medium * 3 + self.low).min(100)
    }
}

/// Scanner output for one filesystem or image scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub counts: VulnerabilityCounts,
    /// Whether the scanner completed; partial reports are not trusted for
    /// a decision.
    pub complete: bool,
    pub scanner_version: String,
}

/// Security posture applied to scan results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPolicy {
    Strict,
    #[default]
    Balanced,
    Permissive,
}

impl ScanPolicy {
    /// Risk score at or above which an otherwise-approved scan is
    /// downgraded to a warning.
    fn warn_threshold(&self) -> u32 {
        match self {
            ScanPolicy::Strict => 10,
            ScanPolicy::Balanced => 25,
            ScanPolicy::Permissive => 50,
        }
    }
}

impl std::fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanPolicy::Strict => write!(f, "strict"),
            ScanPolicy::Balanced => write!(f, "balanced"),
            ScanPolicy::Permissive => write!(f, "permissive"),
        }
    }
}

/// Verdict of the security phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Warn,
    Reject,
}

/// The persisted outcome of the security phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityDecision {
    pub counts: VulnerabilityCounts,
    pub risk_score: u32,
    pub decision: Verdict,
    pub reasoning: String,
    pub scanned_at: DateTime<Utc>,
}

impl SecurityDecision {
    /// Apply the decision rule to a completed scan.
    ///
    /// `critical > 0` under `strict` rejects; `high > max_high` rejects
    /// under every policy; otherwise the weighted risk score selects
    /// approve or warn.
    pub fn decide(
        counts: VulnerabilityCounts,
        policy: ScanPolicy,
        max_high: u32,
        scanned_at: DateTime<Utc>,
    ) -> Self {
        let risk_score = counts.risk_score();
        let (decision, reasoning) = if policy == ScanPolicy::Strict && counts.critical > 0 {
            (
                Verdict::Reject,
                format!("{} critical finding(s) under strict policy", counts.critical),
            )
        } else if counts.high > max_high {
            (
                Verdict::Reject,
                format!("{} high findings exceed limit {}", counts.high, max_high),
            )
        } else if risk_score >= policy.warn_threshold() {
            (
                Verdict::Warn,
                format!("risk score {} under {} policy", risk_score, policy),
            )
        } else {
            (
                Verdict::Approve,
                format!("risk score {} under {} policy", risk_score, policy),
            )
        };

        Self {
            counts,
            risk_score,
            decision,
            reasoning,
            scanned_at,
        }
    }
}
