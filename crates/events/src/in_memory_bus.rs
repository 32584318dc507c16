//! Process-local fan-out bus.
//!
//! Every subscriber gets its own unbounded channel, so `publish` never waits
//! on a slow consumer. Senders whose subscription was dropped are pruned the
//! next time something is published.

use std::convert::Infallible;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::{self, UnboundedSender};

use crate::bus::{EventBus, Subscription};

#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    senders: Mutex<Vec<UnboundedSender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<M: Clone + Send + 'static> EventBus<M> for InMemoryEventBus<M> {
    type Error = Infallible;

    fn publish(&self, message: M) -> Result<(), Infallible> {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_in_publish_order() {
        let bus = InMemoryEventBus::<&str>::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish("queued").unwrap();
        bus.publish("processing").unwrap();

        assert_eq!(first.recv().await, Some("queued"));
        assert_eq!(first.recv().await, Some("processing"));
        assert_eq!(second.drain(), vec!["queued", "processing"]);
    }

    #[test]
    fn late_subscriber_misses_earlier_messages() {
        let bus = InMemoryEventBus::<u8>::new();
        bus.publish(1).unwrap();
        let mut sub = bus.subscribe();
        bus.publish(2).unwrap();
        assert_eq!(sub.drain(), vec![2]);
    }

    #[test]
    fn prunes_dropped_subscriptions() {
        let bus = InMemoryEventBus::<u8>::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(1).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn subscription_ends_with_the_bus() {
        let bus = InMemoryEventBus::<u8>::new();
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, None);
    }
}
