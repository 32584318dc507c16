use crate::{Event, EventEnvelope};

/// A projection builds a read model from a stream of envelopes.
///
/// Job tracking uses projections for derived views that must survive
/// redelivery: the notification log is the main one. The same envelope may
/// arrive twice (a push feed reconnecting, a poll overlapping a push), so
/// `apply()` must be **idempotent**: applying an envelope again leaves the read
/// model unchanged.
///
/// [`ProjectionRunner`](crate::ProjectionRunner) skips envelopes whose sequence
/// number it has already seen, but projections should still dedupe on a
/// domain key (the job identity) because two producers can describe the same
/// fact with different sequence numbers.
///
/// The envelope carries `tenant_id`; projections only touch state for that
/// tenant.
pub trait Projection {
    type Ev: Event;

    /// Apply a single envelope to the read model.
    ///
    /// Envelopes that are irrelevant to this projection are ignored.
    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>);
}
