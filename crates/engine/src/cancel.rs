//! Cancel requests guarded by a per-job in-flight flag.
//!
//! A second cancel for the same job while the first is still outstanding is a
//! no-op. The flag is cleared when the request finishes, however it finishes.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use jobwatch_core::{JobIdentity, JobStatus, TenantId};

use crate::error::CancelError;
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The store accepted the cancel and reports this status.
    Canceled(JobStatus),
    /// A cancel for this job is already outstanding; nothing was sent.
    AlreadyInFlight,
}

#[derive(Debug, Default)]
pub struct CancelGuard {
    in_flight: Mutex<HashSet<JobIdentity>>,
}

impl CancelGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self, id: &JobIdentity) -> bool {
        self.lock().contains(id)
    }

    pub fn in_flight(&self) -> HashSet<JobIdentity> {
        self.lock().clone()
    }

    pub async fn cancel(
        &self,
        store: &dyn JobStore,
        tenant_id: TenantId,
        id: &JobIdentity,
    ) -> Result<CancelOutcome, CancelError> {
        let Some(_flag) = InFlight::acquire(self, id) else {
            tracing::debug!(tenant_id = %tenant_id, job_id = %id, "cancel already in flight");
            return Ok(CancelOutcome::AlreadyInFlight);
        };

        match store.cancel(tenant_id, id).await {
            Ok(status) => {
                tracing::info!(tenant_id = %tenant_id, job_id = %id, %status, "job canceled");
                Ok(CancelOutcome::Canceled(status))
            }
            Err(err) => {
                let err = CancelError::from((id.clone(), err));
                tracing::info!(tenant_id = %tenant_id, job_id = %id, error = %err, "cancel rejected");
                Err(err)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<JobIdentity>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct InFlight<'a> {
    guard: &'a CancelGuard,
    id: JobIdentity,
}

impl<'a> InFlight<'a> {
    fn acquire(guard: &'a CancelGuard, id: &JobIdentity) -> Option<Self> {
        guard.lock().insert(id.clone()).then(|| Self {
            guard,
            id: id.clone(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.guard.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryJobStore, JobStoreError};
    use async_trait::async_trait;
    use chrono::Utc;
    use jobwatch_core::{JobKind, JobPayload, JobRecord};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Store whose cancel blocks until released.
    struct SlowStore {
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl JobStore for SlowStore {
        async fn create_queued(&self, _: JobRecord) -> Result<crate::CreateOutcome, JobStoreError> {
            unreachable!()
        }
        async fn get(&self, _: TenantId, _: &JobIdentity) -> Result<Option<JobRecord>, JobStoreError> {
            Ok(None)
        }
        async fn list(&self, _: &crate::JobQuery) -> Result<Vec<JobRecord>, JobStoreError> {
            Ok(Vec::new())
        }
        async fn cancel(&self, _: TenantId, _: &JobIdentity) -> Result<JobStatus, JobStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(JobStatus::Canceled)
        }
    }

    #[tokio::test]
    async fn second_cancel_while_outstanding_is_a_no_op() {
        let store = Arc::new(SlowStore {
            calls: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let guard = Arc::new(CancelGuard::new());
        let tenant = TenantId::new();
        let id = JobIdentity::parse("Q1").unwrap();

        let first = {
            let (store, guard, id) = (store.clone(), guard.clone(), id.clone());
            tokio::spawn(async move { guard.cancel(store.as_ref(), tenant, &id).await })
        };
        while store.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert!(guard.is_in_flight(&id));
        let second = guard.cancel(store.as_ref(), tenant, &id).await.unwrap();
        assert_eq!(second, CancelOutcome::AlreadyInFlight);

        store.release.notify_one();
        assert_eq!(
            first.await.unwrap().unwrap(),
            CancelOutcome::Canceled(JobStatus::Canceled)
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert!(!guard.is_in_flight(&id));
    }

    #[tokio::test]
    async fn rejected_cancel_reports_conflict_and_clears_flag() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let record = JobRecord::queued(
            JobIdentity::parse("P1").unwrap(),
            tenant,
            JobKind::Training,
            JobPayload::new("busy"),
            Utc::now(),
        );
        store.seed([record.clone()]);
        store.claim_next(Some(tenant));

        let guard = CancelGuard::new();
        let err = guard.cancel(&store, tenant, &record.id).await.unwrap_err();
        assert_eq!(
            err,
            CancelError::Conflict {
                job_id: record.id.clone(),
                current: JobStatus::Processing
            }
        );
        assert!(!guard.is_in_flight(&record.id));
        assert_eq!(
            store.get(tenant, &record.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }
}
