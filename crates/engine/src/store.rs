//! Job store port and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use jobwatch_core::{Clock, JobIdentity, JobKind, JobRecord, JobStatus, SystemClock, TenantId};
use jobwatch_events::{EventBus, FeedSnapshot, InMemoryEventBus};

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQuery {
    pub tenant_id: TenantId,
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    /// Keep only the most recent `limit` records.
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            kind: None,
            status: None,
            limit: None,
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        record.tenant_id == self.tenant_id
            && self.kind.is_none_or(|k| record.kind == k)
            && self.status.is_none_or(|s| record.status == s)
    }
}

/// Result of [`JobStore::create_queued`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    /// Same identity and content already stored (idempotent replay).
    AlreadyExists,
}

/// Authoritative job storage.
///
/// Implementations are eventually consistent; callers never assume a write is
/// visible to the next `list`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly submitted record in `queued`, keyed by its identity.
    async fn create_queued(&self, record: JobRecord) -> Result<CreateOutcome, JobStoreError>;

    async fn get(
        &self,
        tenant_id: TenantId,
        id: &JobIdentity,
    ) -> Result<Option<JobRecord>, JobStoreError>;

    /// Records matching `query`, ordered by `created_at` ascending.
    async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Move a `queued` job to `canceled`; returns the new status.
    async fn cancel(&self, tenant_id: TenantId, id: &JobIdentity)
    -> Result<JobStatus, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobIdentity),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("identity {0} already names a different job")]
    IdentityReuse(JobIdentity),
    #[error("job {id} is {current}")]
    Conflict { id: JobIdentity, current: JobStatus },
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_) | JobStoreError::Storage(_))
    }
}

/// Per-status counts for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

/// In-memory job store for tests/dev.
///
/// Optionally publishes a [`FeedSnapshot`] of the affected tenant after every
/// change, which is what [`PushFeed`](crate::PushFeed) consumes. The
/// worker-side transitions (`claim_next`, `complete`, `fail`) stand in for the
/// external worker.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobIdentity, JobRecord>>,
    bus: Option<Arc<InMemoryEventBus<FeedSnapshot>>>,
    clock: Arc<dyn Clock>,
    failing_writes: AtomicUsize,
    reads_unavailable: AtomicBool,
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &self.read_jobs().len())
            .field("publishes", &self.bus.is_some())
            .finish()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            bus: None,
            clock,
            failing_writes: AtomicUsize::new(0),
            reads_unavailable: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Publish a tenant snapshot on `bus` after every change.
    pub fn publishing_to(mut self, bus: Arc<InMemoryEventBus<FeedSnapshot>>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Make the next `n` writes fail with `Unavailable`.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make reads fail with `Unavailable` until switched back.
    pub fn set_reads_unavailable(&self, unavailable: bool) {
        self.reads_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert records as-is (history seeding).
    pub fn seed(&self, records: impl IntoIterator<Item = JobRecord>) {
        let mut touched = Vec::new();
        {
            let mut jobs = self.write_jobs();
            for record in records {
                touched.push(record.tenant_id);
                jobs.insert(record.id.clone(), record);
            }
        }
        touched.sort();
        touched.dedup();
        for tenant_id in touched {
            self.publish(tenant_id);
        }
    }

    /// Snapshot of a tenant's records, ordered by `created_at`.
    pub fn snapshot(&self, tenant_id: TenantId) -> FeedSnapshot {
        let records = self.records_for(&JobQuery::tenant(tenant_id));
        FeedSnapshot::new(tenant_id, records, self.clock.now())
    }

    /// Claim the oldest queued job and move it to `processing`.
    pub fn claim_next(&self, tenant_id: Option<TenantId>) -> Option<JobRecord> {
        let claimed = {
            let mut jobs = self.write_jobs();
            let next_id = jobs
                .values()
                .filter(|j| {
                    j.status == JobStatus::Queued && tenant_id.is_none_or(|t| j.tenant_id == t)
                })
                .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
                .map(|j| j.id.clone())?;

            let job = jobs.get_mut(&next_id)?;
            job.start(self.clock.now()).ok()?;
            job.clone()
        };

        self.publish(claimed.tenant_id);
        Some(claimed)
    }

    /// Worker finished the job successfully.
    pub fn complete(&self, tenant_id: TenantId, id: &JobIdentity) -> Result<JobRecord, JobStoreError> {
        let now = self.clock.now();
        self.mutate(tenant_id, id, |job| job.complete(now))
    }

    /// Worker gave up on the job.
    pub fn fail(
        &self,
        tenant_id: TenantId,
        id: &JobIdentity,
        error: impl Into<String>,
    ) -> Result<JobRecord, JobStoreError> {
        let now = self.clock.now();
        let error = error.into();
        self.mutate(tenant_id, id, |job| job.fail(error, now))
    }

    pub fn stats(&self, tenant_id: TenantId) -> JobStats {
        let jobs = self.read_jobs();
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.tenant_id == tenant_id) {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Canceled => stats.canceled += 1,
            }
        }
        stats
    }

    fn mutate(
        &self,
        tenant_id: TenantId,
        id: &JobIdentity,
        f: impl FnOnce(&mut JobRecord) -> jobwatch_core::DomainResult<()>,
    ) -> Result<JobRecord, JobStoreError> {
        let updated = {
            let mut jobs = self.write_jobs();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
            if job.tenant_id != tenant_id {
                return Err(JobStoreError::TenantIsolation);
            }
            let current = job.status;
            f(job).map_err(|_| JobStoreError::Conflict {
                id: id.clone(),
                current,
            })?;
            job.clone()
        };
        self.publish(tenant_id);
        Ok(updated)
    }

    fn take_write_failure(&self) -> Result<(), JobStoreError> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(JobStoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn check_reads(&self) -> Result<(), JobStoreError> {
        if self.reads_unavailable.load(Ordering::SeqCst) {
            return Err(JobStoreError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }

    fn records_for(&self, query: &JobQuery) -> Vec<JobRecord> {
        let jobs = self.read_jobs();
        let mut result: Vec<_> = jobs.values().filter(|j| query.matches(j)).cloned().collect();
        result.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        if let Some(limit) = query.limit {
            let excess = result.len().saturating_sub(limit);
            result.drain(..excess);
        }
        result
    }

    fn publish(&self, tenant_id: TenantId) {
        let Some(bus) = &self.bus else {
            return;
        };
        let Ok(()) = bus.publish(self.snapshot(tenant_id));
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobIdentity, JobRecord>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobIdentity, JobRecord>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_queued(&self, record: JobRecord) -> Result<CreateOutcome, JobStoreError> {
        self.take_write_failure()?;

        let tenant_id = record.tenant_id;
        {
            let mut jobs = self.write_jobs();
            if let Some(existing) = jobs.get(&record.id) {
                let same_job = existing.tenant_id == record.tenant_id
                    && existing.kind == record.kind
                    && existing.payload == record.payload;
                return if same_job {
                    Ok(CreateOutcome::AlreadyExists)
                } else {
                    Err(JobStoreError::IdentityReuse(record.id))
                };
            }
            if record.status != JobStatus::Queued {
                return Err(JobStoreError::Storage(format!(
                    "new job {} must be queued, got {}",
                    record.id, record.status
                )));
            }
            jobs.insert(record.id.clone(), record);
        }

        self.publish(tenant_id);
        Ok(CreateOutcome::Created)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: &JobIdentity,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        self.check_reads()?;
        let jobs = self.read_jobs();
        match jobs.get(id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobStoreError> {
        self.check_reads()?;
        Ok(self.records_for(query))
    }

    async fn cancel(
        &self,
        tenant_id: TenantId,
        id: &JobIdentity,
    ) -> Result<JobStatus, JobStoreError> {
        self.take_write_failure()?;
        let now = self.clock.now();
        self.mutate(tenant_id, id, |job| job.cancel(now))
            .map(|job| job.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jobwatch_core::{JobPayload, ManualClock};

    fn queued(tenant: TenantId, id: &str, offset_secs: i64) -> JobRecord {
        JobRecord::queued(
            JobIdentity::parse(id).unwrap(),
            tenant,
            JobKind::Training,
            JobPayload::new(id),
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn replaying_the_same_submission_is_idempotent() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let record = queued(tenant, "T1", 0);

        assert_eq!(store.create_queued(record.clone()).await.unwrap(), CreateOutcome::Created);
        assert_eq!(
            store.create_queued(record.clone()).await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(store.list(&JobQuery::tenant(tenant)).await.unwrap().len(), 1);

        let mut other = record;
        other.payload = JobPayload::new("something else");
        assert!(matches!(
            store.create_queued(other).await,
            Err(JobStoreError::IdentityReuse(_))
        ));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = InMemoryJobStore::new();
        let a = TenantId::new();
        let b = TenantId::new();
        store.create_queued(queued(a, "A1", 0)).await.unwrap();

        let id = JobIdentity::parse("A1").unwrap();
        assert!(matches!(store.get(b, &id).await, Err(JobStoreError::TenantIsolation)));
        assert!(store.list(&JobQuery::tenant(b)).await.unwrap().is_empty());
        assert!(matches!(store.cancel(b, &id).await, Err(JobStoreError::TenantIsolation)));
    }

    #[tokio::test]
    async fn cancel_only_from_queued() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        store.create_queued(queued(tenant, "Q", 0)).await.unwrap();
        store.create_queued(queued(tenant, "P", 1)).await.unwrap();

        let q = JobIdentity::parse("Q").unwrap();
        let p = JobIdentity::parse("P").unwrap();

        // Q is older, so it is claimed first.
        let claimed = store.claim_next(Some(tenant)).unwrap();
        assert_eq!(claimed.id, q);

        let err = store.cancel(tenant, &q).await.unwrap_err();
        assert_eq!(
            err,
            JobStoreError::Conflict {
                id: q.clone(),
                current: JobStatus::Processing
            }
        );
        assert_eq!(store.cancel(tenant, &p).await.unwrap(), JobStatus::Canceled);
    }

    #[tokio::test]
    async fn list_filters_orders_and_limits() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        for (i, id) in ["J3", "J1", "J2"].iter().enumerate() {
            store.create_queued(queued(tenant, id, [3, 1, 2][i])).await.unwrap();
        }
        store.claim_next(Some(tenant));

        let all = store.list(&JobQuery::tenant(tenant)).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["J1", "J2", "J3"]);

        let queued_only = store
            .list(&JobQuery::tenant(tenant).with_status(JobStatus::Queued))
            .await
            .unwrap();
        assert_eq!(queued_only.len(), 2);

        let newest = store.list(&JobQuery::tenant(tenant).with_limit(1)).await.unwrap();
        assert_eq!(newest[0].id.as_str(), "J3");
    }

    #[test]
    fn worker_transitions_set_duration() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryJobStore::with_clock(clock.clone());
        let tenant = TenantId::new();
        store.seed([queued(tenant, "W", 0)]);

        let job = store.claim_next(None).unwrap();
        clock.advance(Duration::seconds(90));
        let done = store.complete(tenant, &job.id).unwrap();
        assert_eq!(done.duration_ms, Some(90_000));
        assert_eq!(store.stats(tenant).completed, 1);
        assert!(store.claim_next(None).is_none());
    }

    #[tokio::test]
    async fn changes_are_published_as_snapshots() {
        let bus = Arc::new(InMemoryEventBus::new());
        let store = InMemoryJobStore::new().publishing_to(bus.clone());
        let mut sub = bus.subscribe();
        let tenant = TenantId::new();

        store.create_queued(queued(tenant, "S", 0)).await.unwrap();
        store.claim_next(Some(tenant));

        let snapshots = sub.drain();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].records[0].status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        store.fail_next_writes(1);
        let err = store.create_queued(queued(tenant, "F", 0)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.create_queued(queued(tenant, "F", 0)).await.is_ok());

        store.set_reads_unavailable(true);
        assert!(store.list(&JobQuery::tenant(tenant)).await.is_err());
    }
}
