//! Job record and its lifecycle.
//!
//! ```text
//! queued ──► processing ──► completed
//!   │             └───────► failed
//!   └──► canceled
//! ```
//!
//! `completed`, `failed` and `canceled` are terminal. Cancellation is only
//! accepted from `queued`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobIdentity, TenantId};

/// What kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Training,
    Prediction,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Training => "training",
            JobKind::Prediction => "prediction",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(JobKind::Training),
            "prediction" => Ok(JobKind::Prediction),
            other => Err(DomainError::validation(format!("unknown job kind '{other}'"))),
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted, waiting for the worker.
    Queued,
    /// Picked up by the worker.
    Processing,
    Completed,
    Failed,
    /// Canceled while still queued.
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Queued or processing.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Canceled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" | "cancelled" => Ok(JobStatus::Canceled),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Job request payload.
///
/// Opaque to the engine except for the human label, the model reference and
/// the prediction mode / row count used to word notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ref: Option<String>,
    /// `single` or `batch` for predictions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl JobPayload {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            model_ref: None,
            mode: None,
            row_count: None,
            extra: serde_json::Value::Null,
        }
    }

    pub fn with_model_ref(mut self, model_ref: impl Into<String>) -> Self {
        self.model_ref = Some(model_ref.into());
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_row_count(mut self, rows: u64) -> Self {
        self.row_count = Some(rows);
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

/// Authoritative job record, owned by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobIdentity,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set for `completed` only: `completed_at - started_at`.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobRecord {
    /// A freshly submitted record in `queued`.
    pub fn queued(
        id: JobIdentity,
        tenant_id: TenantId,
        kind: JobKind,
        payload: JobPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            kind,
            status: JobStatus::Queued,
            payload,
            created_at,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Worker picked the job up.
    pub fn start(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(at);
        Ok(())
    }

    pub fn complete(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(at);
        self.duration_ms = self
            .started_at
            .map(|started| (at - started).num_milliseconds().max(0) as u64);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(at);
        self.error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Canceled)?;
        self.completed_at = Some(at);
        Ok(())
    }
}
