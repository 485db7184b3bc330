//! Phase result vocabulary

use convoy_types::FailureKind;

/// A business failure inside a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub kind: FailureKind,
    pub detail: String,
    pub retryable: bool,
}

impl PhaseFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            detail: detail.into(),
            retryable,
        }
    }
}

/// How one executor invocation ended. `T` is the phase's payload: a
/// security output, a build artifact, a deploy outcome.
#[derive(Debug)]
pub enum PhaseResult<T> {
    Ok(T),
    Skipped { reason: String },
    Failed(PhaseFailure),
}

impl<T> PhaseResult<T> {
    pub fn failed(kind: FailureKind, detail: impl Into<String>, retryable: bool) -> Self {
        PhaseResult::Failed(PhaseFailure::new(kind, detail, retryable))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PhaseResult::Ok(_))
    }
}
