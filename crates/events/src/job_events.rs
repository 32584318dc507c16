//! Job-domain events carried over the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwatch_core::{JobIdentity, JobKind, JobRecord, JobStatus, TenantId};

use crate::event::Event;

/// One authoritative view of a tenant's jobs, as delivered by a feed.
///
/// Polling and push transports both produce this shape, so reconciliation
/// never needs to know where a snapshot came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub tenant_id: TenantId,
    pub records: Vec<JobRecord>,
    pub observed_at: DateTime<Utc>,
}

impl FeedSnapshot {
    pub fn new(tenant_id: TenantId, records: Vec<JobRecord>, observed_at: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            records,
            observed_at,
        }
    }

    pub fn find(&self, id: &JobIdentity) -> Option<&JobRecord> {
        self.records.iter().find(|r| &r.id == id)
    }
}

impl Event for FeedSnapshot {
    fn event_type(&self) -> &'static str {
        "job.feed.snapshot"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// A status change observed on a job record.
///
/// `from` is `None` when the record was first seen already in `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTransition {
    pub job_id: JobIdentity,
    pub kind: JobKind,
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub record: JobRecord,
    pub observed_at: DateTime<Utc>,
}

impl JobTransition {
    pub fn new(from: Option<JobStatus>, record: JobRecord, observed_at: DateTime<Utc>) -> Self {
        Self {
            job_id: record.id.clone(),
            kind: record.kind,
            from,
            to: record.status,
            record,
            observed_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

impl Event for JobTransition {
    fn event_type(&self) -> &'static str {
        "job.transitioned"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}
