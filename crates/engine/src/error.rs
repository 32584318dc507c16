//! Engine error taxonomy.
//!
//! None of these are fatal to the process. Submission and cancel errors are
//! surfaced to the caller; feed errors degrade the view to last-known state;
//! reconciliation drift is never an error at all (see
//! [`ReconciliationDrift`](crate::ReconciliationDrift)).

use jobwatch_core::{JobIdentity, JobStatus};
use thiserror::Error;

use crate::local_store::LocalStoreError;
use crate::notify::NotificationSinkError;
use crate::results::ResultStoreError;
use crate::store::JobStoreError;

/// Submission failed; no optimistic entry was created.
///
/// The caller may retry, but must use a fresh identity for a new logical job.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmissionError {
    #[error("invalid submission: {0}")]
    Invalid(String),

    #[error("identity {0} was already used for a different job")]
    IdentityReuse(JobIdentity),

    #[error("job store write failed for {identity} after {attempts} attempt(s): {source}")]
    Store {
        identity: JobIdentity,
        attempts: u32,
        #[source]
        source: JobStoreError,
    },
}

/// Cancel was rejected or could not be delivered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CancelError {
    /// The job is no longer `queued`; local state is left untouched.
    #[error("job {job_id} cannot be canceled while {current}")]
    Conflict {
        job_id: JobIdentity,
        current: JobStatus,
    },

    #[error("job {0} not found")]
    NotFound(JobIdentity),

    #[error("cancel request failed: {0}")]
    Store(JobStoreError),
}

impl From<(JobIdentity, JobStoreError)> for CancelError {
    fn from((job_id, err): (JobIdentity, JobStoreError)) -> Self {
        match err {
            JobStoreError::Conflict { current, .. } => CancelError::Conflict { job_id, current },
            JobStoreError::NotFound(id) => CancelError::NotFound(id),
            other => CancelError::Store(other),
        }
    }
}

/// The remote job feed could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("job feed unavailable: {0}")]
    Unavailable(String),

    #[error("job feed closed")]
    Closed,
}

impl From<JobStoreError> for FeedError {
    fn from(err: JobStoreError) -> Self {
        FeedError::Unavailable(err.to_string())
    }
}

/// Failures of tracker operations other than submit/cancel.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    LocalStore(#[from] LocalStoreError),

    #[error(transparent)]
    Notifications(#[from] NotificationSinkError),

    #[error(transparent)]
    Results(#[from] ResultStoreError),

    #[error(transparent)]
    JobStore(#[from] JobStoreError),
}

/// A completion email could not be stored or handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmailError {
    #[error("email transport failed: {0}")]
    Transport(String),

    #[error("email provider rejected the message ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("email outbox storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for EmailError {
    fn from(err: anyhow::Error) -> Self {
        EmailError::Storage(format!("{err:#}"))
    }
}
