//! Read model handed to whatever renders the job list.
//!
//! Provisional rows (pending ledger entries) always render before
//! authoritative rows. A provisional row is dropped as soon as an
//! authoritative record with the same identity is visible, so the same job
//! never shows twice even before the ledger is reconciled.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwatch_core::{JobIdentity, JobKind, JobRecord, JobStatus, TempId};

use crate::ledger::OptimisticEntry;

/// Placeholder for a submitted job not yet seen in the feed. Not actionable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionalRow {
    pub temp_id: TempId,
    pub identity: Option<JobIdentity>,
    pub kind: JobKind,
    pub label: String,
    pub created_at_client: DateTime<Utc>,
    /// Pending for longer than expected; the submission may have been lost.
    pub stale: bool,
    /// Written by an older client without an identity.
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub record: JobRecord,
    /// Advisory; only for in-flight jobs.
    pub eta: Option<Duration>,
    /// `queued` and no cancel outstanding.
    pub cancelable: bool,
    pub cancel_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedHealth {
    /// No snapshot observed yet.
    Connecting,
    Live { last_refreshed: DateTime<Utc> },
    /// Showing last-known state while the feed retries.
    Stale {
        last_refreshed: Option<DateTime<Utc>>,
        error: String,
        retry_in: Duration,
    },
}

impl FeedHealth {
    pub fn is_stale(&self) -> bool {
        matches!(self, FeedHealth::Stale { .. })
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        match self {
            FeedHealth::Connecting => None,
            FeedHealth::Live { last_refreshed } => Some(*last_refreshed),
            FeedHealth::Stale { last_refreshed, .. } => *last_refreshed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "row", rename_all = "snake_case")]
pub enum ViewRow {
    Provisional(ProvisionalRow),
    Job(JobRow),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    /// Newest first.
    pub provisional: Vec<ProvisionalRow>,
    /// Newest first.
    pub jobs: Vec<JobRow>,
    pub feed: FeedHealth,
}

impl JobView {
    /// Render order: provisional rows, then authoritative rows.
    pub fn rows(&self) -> Vec<ViewRow> {
        self.provisional
            .iter()
            .cloned()
            .map(ViewRow::Provisional)
            .chain(self.jobs.iter().cloned().map(ViewRow::Job))
            .collect()
    }

    pub fn job(&self, id: &JobIdentity) -> Option<&JobRow> {
        self.jobs.iter().find(|row| &row.record.id == id)
    }

    pub fn len(&self) -> usize {
        self.provisional.len() + self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) struct ViewInputs<'a> {
    pub entries: Vec<&'a OptimisticEntry>,
    pub records: &'a [JobRecord],
    pub etas: HashMap<JobIdentity, Duration>,
    pub cancel_pending: HashSet<JobIdentity>,
    pub feed: FeedHealth,
    pub stale_after: Duration,
    pub now: DateTime<Utc>,
}

pub(crate) fn build(inputs: ViewInputs<'_>) -> JobView {
    let visible: HashSet<&JobIdentity> = inputs.records.iter().map(|r| &r.id).collect();

    let provisional = inputs
        .entries
        .into_iter()
        .filter(|e| e.identity.as_ref().is_none_or(|id| !visible.contains(id)))
        .map(|e| {
            let age = (inputs.now - e.created_at_client).to_std().unwrap_or_default();
            ProvisionalRow {
                temp_id: e.temp_id,
                identity: e.identity.clone(),
                kind: e.kind,
                label: e.label.clone(),
                created_at_client: e.created_at_client,
                stale: age > inputs.stale_after,
                legacy: e.is_legacy(),
            }
        })
        .collect();

    let mut jobs: Vec<JobRow> = inputs
        .records
        .iter()
        .map(|record| {
            let cancel_pending = inputs.cancel_pending.contains(&record.id);
            JobRow {
                eta: inputs.etas.get(&record.id).copied(),
                cancelable: record.status == JobStatus::Queued && !cancel_pending,
                cancel_pending,
                record: record.clone(),
            }
        })
        .collect();
    jobs.sort_by(|a, b| {
        (b.record.created_at, &b.record.id).cmp(&(a.record.created_at, &a.record.id))
    });

    JobView {
        provisional,
        jobs,
        feed: inputs.feed,
    }
}
