use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use jobwatch_core::Clock;
use jobwatch_events::FeedSnapshot;

use super::{FeedEvent, JobFeed};
use crate::error::FeedError;
use crate::retry::RetryPolicy;
use crate::store::{JobQuery, JobStore};

/// Polls the job store on a fixed interval.
///
/// The first poll happens immediately. After a failure the next poll is
/// spaced by the backoff policy; a success resets it to the interval.
pub struct PollingFeed {
    store: Arc<dyn JobStore>,
    query: JobQuery,
    interval: Duration,
    backoff: RetryPolicy,
    clock: Arc<dyn Clock>,
    failures: u32,
    next_delay: Duration,
}

impl PollingFeed {
    pub fn new(
        store: Arc<dyn JobStore>,
        query: JobQuery,
        interval: Duration,
        backoff: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            query,
            interval,
            backoff,
            clock,
            failures: 0,
            next_delay: Duration::ZERO,
        }
    }

    /// Read once, without waiting.
    pub async fn poll_once(&mut self) -> FeedEvent {
        match self.store.list(&self.query).await {
            Ok(records) => {
                if self.failures > 0 {
                    tracing::info!(tenant_id = %self.query.tenant_id, failures = self.failures, "job feed recovered");
                }
                self.failures = 0;
                self.next_delay = self.interval;
                FeedEvent::Snapshot(FeedSnapshot::new(self.query.tenant_id, records, self.clock.now()))
            }
            Err(err) => {
                self.failures = self.failures.saturating_add(1);
                let retry_in = self.backoff.delay_for_attempt(self.failures);
                self.next_delay = retry_in;
                tracing::warn!(
                    tenant_id = %self.query.tenant_id,
                    attempt = self.failures,
                    retry_in_ms = retry_in.as_millis() as u64,
                    error = %err,
                    "job feed unavailable"
                );
                FeedEvent::Unavailable {
                    error: FeedError::from(err),
                    attempt: self.failures,
                    retry_in,
                }
            }
        }
    }
}

#[async_trait]
impl JobFeed for PollingFeed {
    async fn next(&mut self) -> Option<FeedEvent> {
        if !self.next_delay.is_zero() {
            tokio::time::sleep(self.next_delay).await;
        }
        Some(self.poll_once().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use chrono::Utc;
    use jobwatch_core::{JobIdentity, JobKind, JobPayload, JobRecord, SystemClock, TenantId};

    fn feed(store: Arc<InMemoryJobStore>, tenant: TenantId) -> PollingFeed {
        PollingFeed::new(
            store,
            JobQuery::tenant(tenant),
            Duration::from_secs(5),
            RetryPolicy::unbounded(Duration::from_millis(500), Duration::from_secs(60)),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_is_immediate_then_interval() {
        let store = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        store.seed([JobRecord::queued(
            JobIdentity::parse("a").unwrap(),
            tenant,
            JobKind::Training,
            JobPayload::new("a"),
            Utc::now(),
        )]);
        let mut feed = feed(store, tenant);

        let start = tokio::time::Instant::now();
        let Some(FeedEvent::Snapshot(snap)) = feed.next().await else {
            panic!("expected snapshot");
        };
        assert_eq!(snap.records.len(), 1);
        assert_eq!(start.elapsed().as_secs(), 0);

        feed.next().await;
        assert_eq!(start.elapsed().as_secs(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_and_recover() {
        let store = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        store.set_reads_unavailable(true);
        let mut feed = feed(store.clone(), tenant);

        for (attempt, expected) in [(1, 500), (2, 1000), (3, 2000)] {
            match feed.next().await {
                Some(FeedEvent::Unavailable { attempt: a, retry_in, .. }) => {
                    assert_eq!(a, attempt);
                    assert_eq!(retry_in, Duration::from_millis(expected));
                }
                other => panic!("expected unavailable, got {other:?}"),
            }
        }

        store.set_reads_unavailable(false);
        assert!(matches!(feed.next().await, Some(FeedEvent::Snapshot(_))));
        let start = tokio::time::Instant::now();
        feed.next().await;
        assert_eq!(start.elapsed().as_secs(), 5);
    }
}
