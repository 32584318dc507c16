use thiserror::Error;

use crate::job::JobStatus;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures of the job model itself. Anything involving a
/// network or a disk is reported by the engine's own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The lifecycle has no edge `from -> to`.
    #[error("job cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("not found")]
    NotFound,

    /// e.g. a job identity reused for a different submission.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::InvalidTransition { from, to }
    }
}
