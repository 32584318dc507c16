//! Enqueue gateway: exactly-once submission keyed by a caller identity.
//!
//! The queued record is written first; the execution request is forwarded to
//! the worker afterwards. A failed forward only widens the latency window (the
//! worker consumes queued records anyway), so it does not fail the submission.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use jobwatch_core::{Clock, JobIdentity, JobKind, JobPayload, JobRecord, TenantId};

use crate::error::SubmissionError;
use crate::retry::RetryPolicy;
use crate::store::{CreateOutcome, JobStore, JobStoreError};

/// Execution request forwarded to the worker; carries the job identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub id: JobIdentity,
    #[serde(skip)]
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueAck {
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("enqueue service unreachable: {0}")]
    Unreachable(String),
    #[error("enqueue service rejected the job: {0}")]
    Rejected(String),
}

/// Worker-facing execution request sink.
#[async_trait]
pub trait EnqueueService: Send + Sync {
    async fn forward(&self, request: &EnqueueRequest) -> Result<EnqueueAck, EnqueueError>;
}

/// What the caller asks for; `identity` is generated before the call and
/// reused on every retry of the same logical job.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub identity: JobIdentity,
    pub kind: JobKind,
    pub payload: JobPayload,
}

impl SubmitRequest {
    pub fn new(kind: JobKind, payload: JobPayload) -> Self {
        Self {
            identity: JobIdentity::generate(),
            kind,
            payload,
        }
    }

    pub fn with_identity(mut self, identity: JobIdentity) -> Self {
        self.identity = identity;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub identity: JobIdentity,
    pub record: JobRecord,
    /// `AlreadyExists` when this call replayed an earlier successful write.
    pub created: CreateOutcome,
    pub forwarded: bool,
}

pub struct EnqueueGateway {
    store: Arc<dyn JobStore>,
    service: Arc<dyn EnqueueService>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl EnqueueGateway {
    pub fn new(
        store: Arc<dyn JobStore>,
        service: Arc<dyn EnqueueService>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            service,
            retry,
            clock,
        }
    }

    /// Write the queued record, then forward the execution request.
    #[tracing::instrument(skip(self, request), fields(tenant_id = %tenant_id, job_id = %request.identity, kind = %request.kind))]
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        request: SubmitRequest,
    ) -> Result<SubmitReceipt, SubmissionError> {
        if request.payload.label.trim().is_empty() {
            return Err(SubmissionError::Invalid("job label must not be blank".into()));
        }

        let record = JobRecord::queued(
            request.identity.clone(),
            tenant_id,
            request.kind,
            request.payload.clone(),
            self.clock.now(),
        );

        let mut attempts = 0;
        let written = self
            .retry
            .retry(
                |attempt| {
                    attempts = attempt;
                    self.store.create_queued(record.clone())
                },
                JobStoreError::is_transient,
            )
            .await;
        let created = written.map_err(|err| match err {
            JobStoreError::IdentityReuse(id) => SubmissionError::IdentityReuse(id),
            source => SubmissionError::Store {
                identity: request.identity.clone(),
                attempts,
                source,
            },
        })?;

        if created == CreateOutcome::AlreadyExists {
            tracing::debug!("queued record already present; resubmission is a replay");
        }

        let forward = EnqueueRequest {
            id: request.identity.clone(),
            tenant_id,
            kind: request.kind,
            payload: request.payload,
        };
        let forwarded = match self.service.forward(&forward).await {
            Ok(ack) if ack.accepted => true,
            Ok(_) => {
                tracing::warn!("worker did not accept forward; job stays queued");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "worker forward failed; job stays queued");
                false
            }
        };

        tracing::info!(forwarded, "job submitted");

        Ok(SubmitReceipt {
            identity: request.identity,
            record,
            created,
            forwarded,
        })
    }
}

/// In-process enqueue service that records every forwarded request.
#[derive(Debug, Default)]
pub struct RecordingEnqueueService {
    forwarded: Mutex<Vec<EnqueueRequest>>,
    unreachable: Mutex<bool>,
}

impl RecordingEnqueueService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().unwrap_or_else(PoisonError::into_inner) = unreachable;
    }

    pub fn forwarded(&self) -> Vec<EnqueueRequest> {
        self.forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EnqueueService for RecordingEnqueueService {
    async fn forward(&self, request: &EnqueueRequest) -> Result<EnqueueAck, EnqueueError> {
        if *self.unreachable.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(EnqueueError::Unreachable("worker offline".into()));
        }
        self.forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Ok(EnqueueAck { accepted: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryJobStore, JobQuery};
    use jobwatch_core::{JobStatus, SystemClock};
    use std::time::Duration;

    fn gateway(
        store: Arc<InMemoryJobStore>,
        service: Arc<RecordingEnqueueService>,
    ) -> EnqueueGateway {
        EnqueueGateway::new(
            store,
            service,
            RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(5)),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn writes_queued_record_and_forwards_same_identity() {
        let store = InMemoryJobStore::arc();
        let service = Arc::new(RecordingEnqueueService::new());
        let tenant = TenantId::new();

        let request = SubmitRequest::new(JobKind::Training, JobPayload::new("Retail v3"));
        let identity = request.identity.clone();
        let receipt = gateway(store.clone(), service.clone())
            .submit(tenant, request)
            .await
            .unwrap();

        assert_eq!(receipt.identity, identity);
        assert!(receipt.forwarded);
        assert_eq!(service.forwarded()[0].id, identity);

        let stored = store.get(tenant, &identity).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn retried_submission_never_duplicates() {
        let store = InMemoryJobStore::arc();
        let service = Arc::new(RecordingEnqueueService::new());
        let gw = gateway(store.clone(), service);
        let tenant = TenantId::new();
        let identity = JobIdentity::parse("T1").unwrap();

        // Transient write failures are retried with the same identity.
        store.fail_next_writes(2);
        let request = SubmitRequest::new(JobKind::Training, JobPayload::new("run"))
            .with_identity(identity.clone());
        let first = gw.submit(tenant, request.clone()).await.unwrap();
        assert_eq!(first.created, CreateOutcome::Created);

        // Caller-level retry of the same logical job.
        let again = gw.submit(tenant, request).await.unwrap();
        assert_eq!(again.created, CreateOutcome::AlreadyExists);

        assert_eq!(store.list(&JobQuery::tenant(tenant)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_is_a_submission_error() {
        let store = InMemoryJobStore::arc();
        let service = Arc::new(RecordingEnqueueService::new());
        let gw = gateway(store.clone(), service.clone());
        store.fail_next_writes(10);

        let err = gw
            .submit(
                TenantId::new(),
                SubmitRequest::new(JobKind::Prediction, JobPayload::new("batch")),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SubmissionError::Store { attempts: 3, .. }));
        assert!(service.forwarded().is_empty());
    }

    #[tokio::test]
    async fn forward_failure_keeps_the_queued_record() {
        let store = InMemoryJobStore::arc();
        let service = Arc::new(RecordingEnqueueService::new());
        service.set_unreachable(true);
        let tenant = TenantId::new();

        let receipt = gateway(store.clone(), service)
            .submit(
                tenant,
                SubmitRequest::new(JobKind::Training, JobPayload::new("offline worker")),
            )
            .await
            .unwrap();

        assert!(!receipt.forwarded);
        assert!(store.get(tenant, &receipt.identity).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blank_label_is_rejected_before_any_write() {
        let store = InMemoryJobStore::arc();
        let gw = gateway(store.clone(), Arc::new(RecordingEnqueueService::new()));
        let tenant = TenantId::new();

        let err = gw
            .submit(tenant, SubmitRequest::new(JobKind::Training, JobPayload::new("  ")))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Invalid(_)));
        assert!(store.list(&JobQuery::tenant(tenant)).await.unwrap().is_empty());
    }
}
