//! Remote job feed: one interface over polling and push transports.
//!
//! Both transports yield [`FeedEvent`]s; the tracker reconciles them through
//! the same code path, so reconciliation never depends on the transport and
//! can be driven by a synthetic feed in tests.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use jobwatch_events::FeedSnapshot;

use crate::error::FeedError;

mod polling;
mod push;

pub use polling::PollingFeed;
pub use push::PushFeed;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Snapshot(FeedSnapshot),
    /// The feed could not be read; the view keeps its last-known state.
    Unavailable {
        error: FeedError,
        /// Consecutive failures so far (1-indexed).
        attempt: u32,
        retry_in: Duration,
    },
}

#[async_trait]
pub trait JobFeed: Send {
    /// Next update; `None` once the feed has ended.
    async fn next(&mut self) -> Option<FeedEvent>;
}

/// Feed every update into `on_update` until the feed ends.
pub async fn drive<F, C, Fut>(mut feed: F, mut on_update: C)
where
    F: JobFeed,
    C: FnMut(FeedEvent) -> Fut,
    Fut: Future,
{
    while let Some(event) = feed.next().await {
        on_update(event).await;
    }
}

/// A scripted feed (tests, replays).
#[derive(Debug, Default)]
pub struct ScriptedFeed {
    events: std::collections::VecDeque<FeedEvent>,
}

impl ScriptedFeed {
    pub fn new(events: impl IntoIterator<Item = FeedEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }
}

#[async_trait]
impl JobFeed for ScriptedFeed {
    async fn next(&mut self) -> Option<FeedEvent> {
        self.events.pop_front()
    }
}
