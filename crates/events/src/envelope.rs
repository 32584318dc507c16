use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobwatch_core::TenantId;

/// A payload stamped with who it belongs to and where it sits in its
/// producer's stream.
///
/// `sequence_number` only has meaning per producer: the tracker numbers the
/// transitions it publishes, the notification center numbers what it feeds
/// its projector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,
    sequence_number: u64,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(tenant_id: TenantId, sequence_number: u64, occurred_at: DateTime<Utc>, payload: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            tenant_id,
            sequence_number,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
