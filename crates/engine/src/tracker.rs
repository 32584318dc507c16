//! Per-tenant orchestrator tying submission, the feed, the ledger and the
//! notification log together.
//!
//! All collaborators are injected through [`TrackerParts`]; the tracker owns
//! them from `start` until it is dropped. Feed updates are applied strictly one
//! at a time behind a `tokio::sync::Mutex`, so the count-delta baseline and
//! the last-observed statuses are never interleaved.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobwatch_core::{
    Clock, JobIdentity, JobKind, JobPayload, JobRecord, JobStatus, NotificationRecord, ResultRecord,
    SystemClock, TenantId,
};
use jobwatch_events::{EventBus, EventEnvelope, FeedSnapshot, InMemoryEventBus, JobTransition, Subscription};

use crate::cancel::{CancelGuard, CancelOutcome};
use crate::config::EngineConfig;
use crate::enqueue::{EnqueueGateway, EnqueueService, RecordingEnqueueService, SubmitReceipt, SubmitRequest};
use crate::error::{CancelError, SubmissionError, TrackerError};
use crate::eta::EtaEstimator;
use crate::feed::{FeedEvent, JobFeed, PollingFeed, drive};
use crate::ledger::{OptimisticEntry, OptimisticLedger};
use crate::local_store::{InMemoryLocalStore, LocalStore};
use crate::notify::{InMemoryNotificationSink, NotificationCenter, NotificationSink};
use crate::reconcile::{ReconcileStrategy, ReconciliationDrift, Reconciler};
use crate::results::{InMemoryResultStore, ResultStore};
use crate::store::{InMemoryJobStore, JobQuery, JobStore};
use crate::view::{self, FeedHealth, JobView, ViewInputs};

/// [`LocalStore`] key holding the `observed_at` of the last snapshot whose
/// notifications were stored.
pub const NOTIFY_WATERMARK_KEY: &str = "notification-watermark";

/// Collaborators injected into a [`JobTracker`].
#[derive(Clone)]
pub struct TrackerParts {
    pub store: Arc<dyn JobStore>,
    pub enqueue: Arc<dyn EnqueueService>,
    pub results: Arc<dyn ResultStore>,
    pub notifications: Arc<dyn NotificationSink>,
    pub local: Arc<dyn LocalStore>,
    pub clock: Arc<dyn Clock>,
}

impl TrackerParts {
    /// Everything in process, around the given job store.
    pub fn in_memory(store: Arc<InMemoryJobStore>) -> Self {
        Self {
            store,
            enqueue: Arc::new(RecordingEnqueueService::new()),
            results: InMemoryResultStore::arc(),
            notifications: InMemoryNotificationSink::arc(),
            local: InMemoryLocalStore::arc(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// What one applied feed event changed.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerUpdate {
    pub retired: Vec<OptimisticEntry>,
    pub transitions: Vec<JobTransition>,
    pub notifications: Vec<NotificationRecord>,
    pub drift: Option<ReconciliationDrift>,
    pub feed: FeedHealth,
}

impl TrackerUpdate {
    fn unchanged(feed: FeedHealth) -> Self {
        Self {
            retired: Vec::new(),
            transitions: Vec::new(),
            notifications: Vec::new(),
            drift: None,
            feed,
        }
    }
}

struct TrackerState {
    ledger: OptimisticLedger,
    center: NotificationCenter,
    last_status: HashMap<JobIdentity, JobStatus>,
    snapshot: Option<FeedSnapshot>,
    watermark: Option<DateTime<Utc>>,
    feed: FeedHealth,
    sequence: u64,
}

pub struct JobTracker {
    tenant_id: TenantId,
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    results: Arc<dyn ResultStore>,
    local: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    gateway: EnqueueGateway,
    reconciler: Reconciler,
    eta: EtaEstimator,
    cancels: CancelGuard,
    transitions: InMemoryEventBus<EventEnvelope<JobTransition>>,
    state: tokio::sync::Mutex<TrackerState>,
}

impl JobTracker {
    /// Load the persisted ledger and notification log for `tenant_id`.
    pub async fn start(
        tenant_id: TenantId,
        config: EngineConfig,
        parts: TrackerParts,
    ) -> Result<Self, TrackerError> {
        let ledger = OptimisticLedger::load(tenant_id, parts.local.clone()).await?;
        let center = NotificationCenter::load(tenant_id, parts.notifications.clone()).await?;
        let watermark = load_watermark(tenant_id, parts.local.as_ref()).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            pending = ledger.len(),
            strategy = ?config.strategy,
            watermark = ?watermark,
            "job tracker started"
        );

        Ok(Self {
            tenant_id,
            gateway: EnqueueGateway::new(
                parts.store.clone(),
                parts.enqueue,
                config.submit_retry.clone(),
                parts.clock.clone(),
            ),
            reconciler: Reconciler::new(config.strategy, config.count_basis),
            eta: EtaEstimator::new(config.eta.clone()),
            cancels: CancelGuard::new(),
            transitions: InMemoryEventBus::new(),
            store: parts.store,
            results: parts.results,
            local: parts.local,
            clock: parts.clock,
            config,
            state: tokio::sync::Mutex::new(TrackerState {
                ledger,
                center,
                last_status: HashMap::new(),
                snapshot: None,
                watermark,
                feed: FeedHealth::Connecting,
                sequence: 0,
            }),
        })
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submit a new job under a fresh identity.
    pub async fn submit(&self, kind: JobKind, payload: JobPayload) -> Result<JobIdentity, SubmissionError> {
        self.submit_request(SubmitRequest::new(kind, payload))
            .await
            .map(|receipt| receipt.identity)
    }

    /// Submit with a caller-chosen identity; retries must reuse it.
    ///
    /// The optimistic entry is only created once the gateway accepted the job.
    pub async fn submit_request(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmissionError> {
        let kind = request.kind;
        let label = request.payload.label.clone();
        let receipt = self.gateway.submit(self.tenant_id, request).await?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.ledger.contains_identity(&receipt.identity) {
            tracing::debug!(job_id = %receipt.identity, "resubmission already pending in ledger");
            return Ok(receipt);
        }

        state.ledger.append(OptimisticEntry::new(
            receipt.identity.clone(),
            kind,
            label,
            self.clock.now(),
        ));

        // The record may already be visible if a snapshot landed while the
        // gateway call was outstanding. Count-delta cannot match it: that
        // snapshot already counted the record while the entry did not exist
        // yet, so no later delta is left over for it and the entry stays
        // pending. That staleness is accepted.
        let visible = self.reconciler.strategy() == ReconcileStrategy::Identity
            && state
                .snapshot
                .as_ref()
                .is_some_and(|s| s.find(&receipt.identity).is_some());
        if visible {
            let present: HashSet<JobIdentity> = [receipt.identity.clone()].into_iter().collect();
            state.ledger.retire_matching(&present);
        }

        if let Err(err) = state.ledger.persist().await {
            tracing::warn!(tenant_id = %self.tenant_id, error = %err, "failed to persist optimistic ledger");
        }

        Ok(receipt)
    }

    /// Apply one feed event: reconcile, detect transitions, notify, publish.
    pub async fn apply(&self, event: FeedEvent) -> TrackerUpdate {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let snapshot = match event {
            FeedEvent::Snapshot(snapshot) => snapshot,
            FeedEvent::Unavailable { error, attempt, retry_in } => {
                tracing::warn!(
                    tenant_id = %self.tenant_id,
                    attempt,
                    error = %error,
                    "showing last-known jobs while feed is unavailable"
                );
                state.feed = FeedHealth::Stale {
                    last_refreshed: state.feed.last_refreshed(),
                    error: error.to_string(),
                    retry_in,
                };
                return TrackerUpdate::unchanged(state.feed.clone());
            }
        };

        if snapshot.tenant_id != self.tenant_id {
            tracing::warn!(
                tenant_id = %self.tenant_id,
                snapshot_tenant = %snapshot.tenant_id,
                "ignoring snapshot for another tenant"
            );
            return TrackerUpdate::unchanged(state.feed.clone());
        }

        let pending = state.ledger.pending_identities();
        let outcome = self.reconciler.reconcile(&mut state.ledger, &snapshot);
        if let Err(err) = state.ledger.persist().await {
            tracing::warn!(tenant_id = %self.tenant_id, error = %err, "failed to persist optimistic ledger");
        }

        let history = if state.snapshot.is_none() {
            History::Before(state.watermark)
        } else {
            History::Ongoing
        };
        let transitions = detect_transitions(&mut state.last_status, &snapshot, history, &pending);

        let notifications = match state.center.observe(&transitions).await {
            Ok(created) => {
                state.watermark = Some(snapshot.observed_at);
                let raw = snapshot.observed_at.to_rfc3339();
                if let Err(err) = self.local.put(self.tenant_id, NOTIFY_WATERMARK_KEY, &raw).await {
                    tracing::warn!(tenant_id = %self.tenant_id, error = %err, "failed to persist notification watermark");
                }
                created
            }
            Err(err) => {
                // Forget the unnotified statuses so the next snapshot retries them.
                tracing::warn!(tenant_id = %self.tenant_id, error = %err, "notification log unavailable");
                for t in transitions.iter().filter(|t| t.is_terminal()) {
                    if !state.center.has_notified(&t.job_id) {
                        state.last_status.remove(&t.job_id);
                    }
                }
                Vec::new()
            }
        };

        for transition in &transitions {
            state.sequence += 1;
            let envelope = EventEnvelope::new(
                self.tenant_id,
                state.sequence,
                transition.observed_at,
                transition.clone(),
            );
            let Ok(()) = self.transitions.publish(envelope);
        }

        state.feed = FeedHealth::Live {
            last_refreshed: snapshot.observed_at,
        };
        state.snapshot = Some(snapshot);

        TrackerUpdate {
            retired: outcome.retired,
            transitions,
            notifications,
            drift: outcome.drift,
            feed: state.feed.clone(),
        }
    }

    /// Read the job store once and apply the result.
    pub async fn refresh(&self) -> TrackerUpdate {
        let event = match self.store.list(&JobQuery::tenant(self.tenant_id)).await {
            Ok(records) => FeedEvent::Snapshot(FeedSnapshot::new(self.tenant_id, records, self.clock.now())),
            Err(err) => FeedEvent::Unavailable {
                error: err.into(),
                attempt: 1,
                retry_in: self.config.poll_interval,
            },
        };
        self.apply(event).await
    }

    /// A polling feed over this tracker's store, using the configured cadence.
    pub fn polling_feed(&self) -> PollingFeed {
        PollingFeed::new(
            self.store.clone(),
            JobQuery::tenant(self.tenant_id),
            self.config.poll_interval,
            self.config.feed_backoff.clone(),
            self.clock.clone(),
        )
    }

    /// Apply every update from `feed` until it ends.
    pub async fn run<F: JobFeed>(&self, feed: F) {
        drive(feed, move |event| self.apply(event)).await;
        tracing::info!(tenant_id = %self.tenant_id, "job feed ended");
    }

    /// Merged rows: provisional entries first, then authoritative records.
    pub async fn view(&self) -> JobView {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let records = state.snapshot.as_ref().map(|s| s.records.as_slice()).unwrap_or(&[]);

        view::build(ViewInputs {
            entries: state.ledger.list(),
            records,
            etas: self.eta.estimate_all(records, now),
            cancel_pending: self.cancels.in_flight(),
            feed: state.feed.clone(),
            stale_after: self.config.stale_after,
            now,
        })
    }

    /// Pending optimistic entries, newest first.
    pub async fn pending(&self) -> Vec<OptimisticEntry> {
        self.state.lock().await.ledger.list().into_iter().cloned().collect()
    }

    /// Ask the store to cancel a queued job.
    ///
    /// A conflict leaves every piece of local state untouched; the next feed
    /// update shows whatever the job actually did.
    pub async fn cancel(&self, id: &JobIdentity) -> Result<CancelOutcome, CancelError> {
        self.cancels.cancel(self.store.as_ref(), self.tenant_id, id).await
    }

    pub async fn notifications(&self, limit: usize) -> Result<Vec<NotificationRecord>, TrackerError> {
        Ok(self.state.lock().await.center.list(limit).await?)
    }

    pub async fn unread_count(&self) -> Result<usize, TrackerError> {
        Ok(self.state.lock().await.center.unread_count().await?)
    }

    pub async fn mark_all_read(&self) -> Result<usize, TrackerError> {
        let at = self.clock.now();
        Ok(self.state.lock().await.center.mark_all_read(at).await?)
    }

    /// Transitions published by every subsequent `apply`.
    pub fn transitions(&self) -> Subscription<EventEnvelope<JobTransition>> {
        self.transitions.subscribe()
    }

    pub async fn result(&self, job_id: &JobIdentity) -> Result<ResultRecord, TrackerError> {
        Ok(self.results.get(self.tenant_id, job_id).await?)
    }

    pub async fn rename_result(&self, job_id: &JobIdentity, label: &str) -> Result<(), TrackerError> {
        self.results.relabel(self.tenant_id, job_id, label).await?;
        tracing::info!(tenant_id = %self.tenant_id, job_id = %job_id, "result renamed");
        Ok(())
    }

    pub async fn delete_result(&self, job_id: &JobIdentity) -> Result<(), TrackerError> {
        self.results.delete(self.tenant_id, job_id).await?;
        tracing::info!(tenant_id = %self.tenant_id, job_id = %job_id, "result deleted");
        Ok(())
    }
}

async fn load_watermark(
    tenant_id: TenantId,
    local: &dyn LocalStore,
) -> Result<Option<DateTime<Utc>>, TrackerError> {
    let Some(raw) = local.get(tenant_id, NOTIFY_WATERMARK_KEY).await? else {
        return Ok(None);
    };
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(at) => Ok(Some(at.with_timezone(&Utc))),
        Err(err) => {
            tracing::warn!(tenant_id = %tenant_id, error = %err, "discarding unreadable notification watermark");
            Ok(None)
        }
    }
}

/// Which terminal records count as history, and stay silent.
#[derive(Debug, Clone, Copy)]
enum History {
    /// Not the first snapshot of the session: every new terminal status is news.
    Ongoing,
    /// First snapshot: records that finished before this instant were already
    /// seen by an earlier session. Without one, every finished record is.
    Before(Option<DateTime<Utc>>),
}

impl History {
    fn is_history(self, record: &JobRecord) -> bool {
        match self {
            History::Ongoing => false,
            History::Before(None) => true,
            History::Before(Some(watermark)) => record.completed_at.unwrap_or(record.created_at) < watermark,
        }
    }
}

/// Status changes since the last snapshot.
///
/// Terminal records this client is still waiting for are never history.
/// Everything else the notification log already holds is deduped there.
fn detect_transitions(
    last_status: &mut HashMap<JobIdentity, JobStatus>,
    snapshot: &FeedSnapshot,
    history: History,
    pending: &HashSet<JobIdentity>,
) -> Vec<JobTransition> {
    let mut out = Vec::new();
    for record in &snapshot.records {
        let previous = last_status.insert(record.id.clone(), record.status);
        if previous == Some(record.status) {
            continue;
        }
        if record.status.is_terminal() && !pending.contains(&record.id) && history.is_history(record) {
            continue;
        }
        out.push(JobTransition::new(previous, record.clone(), snapshot.observed_at));
    }
    out
}
