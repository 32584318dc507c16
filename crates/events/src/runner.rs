//! Drives a [`Projection`] for one tenant and remembers how far it got.
//!
//! The cursor is the highest envelope sequence applied so far; anything at or
//! below it is a redelivery and is skipped. Where the read model lives is the
//! projection's business.

use jobwatch_core::TenantId;
use thiserror::Error;

use crate::{EventEnvelope, Projection};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectionCursor {
    pub tenant_id: TenantId,
    /// Zero before the first envelope.
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("envelope for tenant {found} delivered to projection pinned to {expected}")]
    TenantMismatch { expected: TenantId, found: TenantId },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already at or behind the cursor.
    Skipped,
}

#[derive(Debug)]
pub struct ProjectionRunner<P: Projection> {
    projection: P,
    cursor: ProjectionCursor,
}

impl<P: Projection> ProjectionRunner<P> {
    pub fn new(tenant_id: TenantId, projection: P) -> Self {
        Self {
            projection,
            cursor: ProjectionCursor { tenant_id, position: 0 },
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn projection_mut(&mut self) -> &mut P {
        &mut self.projection
    }

    pub fn cursor(&self) -> ProjectionCursor {
        self.cursor
    }

    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> Result<ApplyOutcome, ProjectionError> {
        if envelope.tenant_id() != self.cursor.tenant_id {
            return Err(ProjectionError::TenantMismatch {
                expected: self.cursor.tenant_id,
                found: envelope.tenant_id(),
            });
        }

        let seq = envelope.sequence_number();
        if seq <= self.cursor.position {
            tracing::debug!(position = self.cursor.position, seq, "skipping redelivered envelope");
            return Ok(ApplyOutcome::Skipped);
        }

        self.projection.apply(envelope);
        self.cursor.position = seq;
        Ok(ApplyOutcome::Applied)
    }

    /// Apply in order; returns the number actually applied.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<usize, ProjectionError>
    where
        P::Ev: 'a,
    {
        envelopes.into_iter().try_fold(0, |applied, env| {
            Ok(applied + usize::from(self.apply(env)? == ApplyOutcome::Applied))
        })
    }
}
