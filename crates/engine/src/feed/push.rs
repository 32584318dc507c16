use async_trait::async_trait;

use jobwatch_core::TenantId;
use jobwatch_events::{FeedSnapshot, Subscription, TenantScoped};

use super::{FeedEvent, JobFeed};

/// Snapshots pushed by the job store on change.
///
/// A bus may carry several tenants; snapshots for other tenants are skipped.
/// The feed ends when the bus is dropped.
pub struct PushFeed {
    tenant_id: TenantId,
    subscription: Subscription<FeedSnapshot>,
    initial: Option<FeedSnapshot>,
}

impl PushFeed {
    pub fn new(tenant_id: TenantId, subscription: Subscription<FeedSnapshot>) -> Self {
        Self {
            tenant_id,
            subscription,
            initial: None,
        }
    }

    /// Deliver `snapshot` first (pushes only arrive on change).
    pub fn primed_with(mut self, snapshot: FeedSnapshot) -> Self {
        self.initial = Some(snapshot);
        self
    }
}

#[async_trait]
impl JobFeed for PushFeed {
    async fn next(&mut self) -> Option<FeedEvent> {
        if let Some(snapshot) = self.initial.take() {
            return Some(FeedEvent::Snapshot(snapshot));
        }
        loop {
            let snapshot = self.subscription.recv().await?;
            if snapshot.belongs_to(self.tenant_id) {
                return Some(FeedEvent::Snapshot(snapshot));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryJobStore, JobStore};
    use chrono::Utc;
    use jobwatch_core::{JobIdentity, JobKind, JobPayload, JobRecord};
    use jobwatch_events::{EventBus, InMemoryEventBus};
    use std::sync::Arc;

    fn record(tenant: TenantId, id: &str) -> JobRecord {
        JobRecord::queued(
            JobIdentity::parse(id).unwrap(),
            tenant,
            JobKind::Prediction,
            JobPayload::new(id),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn only_own_tenant_snapshots_are_delivered() {
        let bus = Arc::new(InMemoryEventBus::new());
        let store = InMemoryJobStore::new().publishing_to(bus.clone());
        let mine = TenantId::new();
        let theirs = TenantId::new();
        let mut feed = PushFeed::new(mine, bus.subscribe()).primed_with(store.snapshot(mine));

        store.create_queued(record(theirs, "x")).await.unwrap();
        store.create_queued(record(mine, "m")).await.unwrap();

        let Some(FeedEvent::Snapshot(first)) = feed.next().await else {
            panic!("expected primed snapshot");
        };
        assert!(first.records.is_empty());

        let Some(FeedEvent::Snapshot(pushed)) = feed.next().await else {
            panic!("expected pushed snapshot");
        };
        assert_eq!(pushed.tenant_id, mine);
        assert_eq!(pushed.records[0].id.as_str(), "m");
    }

    #[tokio::test]
    async fn feed_ends_when_bus_is_dropped() {
        let bus = InMemoryEventBus::<FeedSnapshot>::new();
        let mut feed = PushFeed::new(TenantId::new(), bus.subscribe());
        drop(bus);
        assert!(feed.next().await.is_none());
    }
}
