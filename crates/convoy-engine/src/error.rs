//! Engine errors

use thiserror::Error;

use convoy_types::{DeploymentId, ValidationError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("deployment {0} already completed")]
    DuplicateDeployment(DeploymentId),

    #[error("deployment {0} not found")]
    NotFound(DeploymentId),

    #[error("audit error: {0}")]
    Audit(#[from] convoy_audit::AuditError),

    #[error("store error: {0}")]
    Store(#[from] convoy_ports::StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
