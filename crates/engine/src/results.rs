//! Result store port.
//!
//! Results belong to completed jobs but, unlike job records, the user may
//! rename or delete them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use jobwatch_core::{JobIdentity, ResultRecord, TenantId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultStoreError {
    #[error("result not found: {0}")]
    NotFound(JobIdentity),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("invalid result update: {0}")]
    Validation(String),
    #[error("result store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, tenant_id: TenantId, job_id: &JobIdentity) -> Result<ResultRecord, ResultStoreError>;

    async fn relabel(
        &self,
        tenant_id: TenantId,
        job_id: &JobIdentity,
        label: &str,
    ) -> Result<(), ResultStoreError>;

    async fn delete(&self, tenant_id: TenantId, job_id: &JobIdentity) -> Result<(), ResultStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<JobIdentity, ResultRecord>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store (or replace) the result of a job.
    pub fn put(&self, record: ResultRecord) {
        self.results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.job_id.clone(), record);
    }

    fn with_result<T>(
        &self,
        tenant_id: TenantId,
        job_id: &JobIdentity,
        f: impl FnOnce(&mut HashMap<JobIdentity, ResultRecord>) -> Result<T, ResultStoreError>,
    ) -> Result<T, ResultStoreError> {
        let mut results = self.results.write().unwrap_or_else(PoisonError::into_inner);
        match results.get(job_id) {
            None => Err(ResultStoreError::NotFound(job_id.clone())),
            Some(r) if r.tenant_id != tenant_id => Err(ResultStoreError::TenantIsolation),
            Some(_) => f(&mut results),
        }
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn get(&self, tenant_id: TenantId, job_id: &JobIdentity) -> Result<ResultRecord, ResultStoreError> {
        self.with_result(tenant_id, job_id, |results| {
            results
                .get(job_id)
                .cloned()
                .ok_or_else(|| ResultStoreError::NotFound(job_id.clone()))
        })
    }

    async fn relabel(
        &self,
        tenant_id: TenantId,
        job_id: &JobIdentity,
        label: &str,
    ) -> Result<(), ResultStoreError> {
        self.with_result(tenant_id, job_id, |results| {
            let record = results
                .get_mut(job_id)
                .ok_or_else(|| ResultStoreError::NotFound(job_id.clone()))?;
            record
                .relabel(label)
                .map_err(|e| ResultStoreError::Validation(e.to_string()))
        })
    }

    async fn delete(&self, tenant_id: TenantId, job_id: &JobIdentity) -> Result<(), ResultStoreError> {
        self.with_result(tenant_id, job_id, |results| {
            results.remove(job_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn relabel_and_delete() {
        let store = InMemoryResultStore::new();
        let tenant = TenantId::new();
        let id = JobIdentity::parse("T1").unwrap();
        store.put(ResultRecord::new(id.clone(), tenant, "run 1", Utc::now()).with_metric("f1", 0.81));

        store.relabel(tenant, &id, " Retail v3 ").await.unwrap();
        assert_eq!(store.get(tenant, &id).await.unwrap().label, "Retail v3");
        assert!(matches!(
            store.relabel(tenant, &id, "").await,
            Err(ResultStoreError::Validation(_))
        ));
        assert!(matches!(
            store.get(TenantId::new(), &id).await,
            Err(ResultStoreError::TenantIsolation)
        ));

        store.delete(tenant, &id).await.unwrap();
        assert!(matches!(store.get(tenant, &id).await, Err(ResultStoreError::NotFound(_))));
    }
}
