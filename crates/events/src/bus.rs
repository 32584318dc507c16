//! Pub/sub contract shared by the push feed and the tracker.
//!
//! Delivery is at-least-once and unpersisted. The job store stays the source
//! of truth, so a consumer that misses a message catches up from the next
//! snapshot. Reconciliation and notification projection are both idempotent.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// Receiving end of a bus. Sees everything published after it was created,
/// in publish order.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Everything already buffered, without waiting.
    pub fn drain(&mut self) -> Vec<M> {
        std::iter::from_fn(|| self.receiver.try_recv().ok()).collect()
    }
}

/// ```text
/// JobStore change ──► EventBus<FeedSnapshot> ──► PushFeed ──► JobTracker
/// JobTracker ──► EventBus<EventEnvelope<JobTransition>> ──► UI, logs
/// ```
///
/// A failed `publish` is the caller's to log; the next snapshot supersedes
/// whatever was lost.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
