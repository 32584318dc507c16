//! HTTP adapter for the remote job, enqueue and result services.
//!
//! Every request carries the tenant in an `X-Tenant-Id` header. Connection
//! failures and 5xx responses map to the transient `Unavailable` variants so
//! the submit retry policy and the feed backoff apply to them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use jobwatch_core::{JobIdentity, JobRecord, JobStatus, ResultRecord, TenantId};

use crate::enqueue::{EnqueueAck, EnqueueError, EnqueueRequest, EnqueueService};
use crate::results::{ResultStore, ResultStoreError};
use crate::store::{CreateOutcome, JobQuery, JobStore, JobStoreError};

pub const TENANT_HEADER: &str = "X-Tenant-Id";

#[derive(Debug, Serialize, Deserialize)]
struct StatusBody {
    status: JobStatus,
}

#[derive(Debug, Serialize)]
struct LabelBody<'a> {
    label: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Like [`HttpBackend::new`] with a per-request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn scoped(&self, req: RequestBuilder, tenant_id: TenantId) -> RequestBuilder {
        req.header(TENANT_HEADER, tenant_id.to_string())
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, String> {
        req.send().await.map_err(|e| e.to_string())
    }
}

async fn body_text(resp: Response) -> String {
    let status = resp.status();
    match resp.text().await {
        Ok(text) if !text.is_empty() => format!("{status}: {text}"),
        _ => status.to_string(),
    }
}

async fn store_error(resp: Response) -> JobStoreError {
    let status = resp.status();
    let detail = body_text(resp).await;
    if status.is_server_error() {
        JobStoreError::Unavailable(detail)
    } else {
        JobStoreError::Storage(detail)
    }
}

#[async_trait]
impl JobStore for HttpBackend {
    async fn create_queued(&self, record: JobRecord) -> Result<CreateOutcome, JobStoreError> {
        let req = self.scoped(self.client.post(self.url("/queue")), record.tenant_id).json(&record);
        let resp = self.send(req).await.map_err(JobStoreError::Unavailable)?;

        match resp.status() {
            StatusCode::CREATED => Ok(CreateOutcome::Created),
            StatusCode::OK => Ok(CreateOutcome::AlreadyExists),
            StatusCode::CONFLICT => Err(JobStoreError::IdentityReuse(record.id)),
            _ => Err(store_error(resp).await),
        }
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: &JobIdentity,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let req = self.scoped(self.client.get(self.url(&format!("/jobs/{id}"))), tenant_id);
        let resp = self.send(req).await.map_err(JobStoreError::Unavailable)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let record: JobRecord = resp
                    .json()
                    .await
                    .map_err(|e| JobStoreError::Storage(format!("invalid job record: {e}")))?;
                if record.tenant_id != tenant_id {
                    return Err(JobStoreError::TenantIsolation);
                }
                Ok(Some(record))
            }
            _ => Err(store_error(resp).await),
        }
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut params = vec![("tenant", query.tenant_id.to_string())];
        if let Some(kind) = query.kind {
            params.push(("kind", kind.as_str().to_string()));
        }
        if let Some(status) = query.status {
            params.push(("status", status.as_str().to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        let req = self
            .scoped(self.client.get(self.url("/jobs")), query.tenant_id)
            .query(&params);
        let resp = self.send(req).await.map_err(JobStoreError::Unavailable)?;
        if !resp.status().is_success() {
            return Err(store_error(resp).await);
        }

        let mut records: Vec<JobRecord> = resp
            .json()
            .await
            .map_err(|e| JobStoreError::Storage(format!("invalid job list: {e}")))?;
        if records.iter().any(|r| r.tenant_id != query.tenant_id) {
            return Err(JobStoreError::TenantIsolation);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn cancel(&self, tenant_id: TenantId, id: &JobIdentity) -> Result<JobStatus, JobStoreError> {
        let req = self
            .scoped(self.client.patch(self.url(&format!("/jobs/{id}"))), tenant_id)
            .json(&StatusBody {
                status: JobStatus::Canceled,
            });
        let resp = self.send(req).await.map_err(JobStoreError::Unavailable)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(JobStoreError::NotFound(id.clone())),
            StatusCode::CONFLICT => {
                let body: StatusBody = resp
                    .json()
                    .await
                    .map_err(|e| JobStoreError::Storage(format!("invalid conflict body: {e}")))?;
                Err(JobStoreError::Conflict {
                    id: id.clone(),
                    current: body.status,
                })
            }
            s if s.is_success() => {
                let body: StatusBody = resp
                    .json()
                    .await
                    .map_err(|e| JobStoreError::Storage(format!("invalid cancel body: {e}")))?;
                Ok(body.status)
            }
            _ => Err(store_error(resp).await),
        }
    }
}

#[async_trait]
impl EnqueueService for HttpBackend {
    async fn forward(&self, request: &EnqueueRequest) -> Result<EnqueueAck, EnqueueError> {
        let req = self
            .scoped(self.client.post(self.url("/jobs/enqueue")), request.tenant_id)
            .json(request);
        let resp = self.send(req).await.map_err(EnqueueError::Unreachable)?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| EnqueueError::Rejected(format!("invalid ack: {e}")));
        }
        let detail = body_text(resp).await;
        if status.is_server_error() {
            Err(EnqueueError::Unreachable(detail))
        } else {
            Err(EnqueueError::Rejected(detail))
        }
    }
}

async fn result_error(resp: Response, job_id: &JobIdentity) -> ResultStoreError {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return ResultStoreError::NotFound(job_id.clone());
    }
    if status == StatusCode::FORBIDDEN {
        return ResultStoreError::TenantIsolation;
    }
    let detail = body_text(resp).await;
    if status.is_client_error() {
        ResultStoreError::Validation(detail)
    } else {
        ResultStoreError::Unavailable(detail)
    }
}

#[async_trait]
impl ResultStore for HttpBackend {
    async fn get(&self, tenant_id: TenantId, job_id: &JobIdentity) -> Result<ResultRecord, ResultStoreError> {
        let req = self.scoped(self.client.get(self.url(&format!("/results/{job_id}"))), tenant_id);
        let resp = self.send(req).await.map_err(ResultStoreError::Unavailable)?;
        if !resp.status().is_success() {
            return Err(result_error(resp, job_id).await);
        }

        let record: ResultRecord = resp
            .json()
            .await
            .map_err(|e| ResultStoreError::Unavailable(format!("invalid result record: {e}")))?;
        if record.tenant_id != tenant_id {
            return Err(ResultStoreError::TenantIsolation);
        }
        Ok(record)
    }

    async fn relabel(
        &self,
        tenant_id: TenantId,
        job_id: &JobIdentity,
        label: &str,
    ) -> Result<(), ResultStoreError> {
        if label.trim().is_empty() {
            return Err(ResultStoreError::Validation("label must not be blank".into()));
        }
        let req = self
            .scoped(self.client.patch(self.url(&format!("/results/{job_id}"))), tenant_id)
            .json(&LabelBody { label });
        let resp = self.send(req).await.map_err(ResultStoreError::Unavailable)?;
        if !resp.status().is_success() {
            return Err(result_error(resp, job_id).await);
        }
        Ok(())
    }

    async fn delete(&self, tenant_id: TenantId, job_id: &JobIdentity) -> Result<(), ResultStoreError> {
        let req = self.scoped(self.client.delete(self.url(&format!("/results/{job_id}"))), tenant_id);
        let resp = self.send(req).await.map_err(ResultStoreError::Unavailable)?;
        if !resp.status().is_success() {
            return Err(result_error(resp, job_id).await);
        }
        Ok(())
    }
}
