//! End-to-end lifecycle scenarios against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jobwatch_core::{
    Clock, JobIdentity, JobKind, JobPayload, JobRecord, JobStatus, ManualClock, NotificationLevel, TenantId,
};
use jobwatch_engine::{
    CancelError, EngineConfig, EtaEstimator, FeedEvent, InMemoryJobStore, JobTracker,
    ReconcileStrategy, ReconciliationDrift, RetryPolicy, SubmitRequest, TrackerParts,
};
use jobwatch_events::FeedSnapshot;

struct Harness {
    tenant: TenantId,
    store: Arc<InMemoryJobStore>,
    clock: Arc<ManualClock>,
    tracker: JobTracker,
}

async fn harness(config: EngineConfig) -> Harness {
    let tenant = TenantId::new();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
    let mut parts = TrackerParts::in_memory(store.clone());
    parts.clock = clock.clone();
    let tracker = JobTracker::start(tenant, config, parts).await.unwrap();
    Harness {
        tenant,
        store,
        clock,
        tracker,
    }
}

fn id(s: &str) -> JobIdentity {
    JobIdentity::parse(s).unwrap()
}

fn completed(tenant: TenantId, job: &str, secs: i64, finished: DateTime<Utc>) -> JobRecord {
    let started = finished - ChronoDuration::seconds(secs);
    let mut r = JobRecord::queued(
        id(job),
        tenant,
        JobKind::Training,
        JobPayload::new(job),
        started - ChronoDuration::seconds(5),
    );
    r.start(started).unwrap();
    r.complete(finished).unwrap();
    r
}

fn feed(tenant: TenantId, records: Vec<JobRecord>, at: DateTime<Utc>) -> FeedEvent {
    FeedEvent::Snapshot(FeedSnapshot::new(tenant, records, at))
}

#[tokio::test]
async fn scenario_a_submitted_job_is_provisional_until_the_feed_reports_it() {
    let h = harness(EngineConfig::default()).await;

    let receipt = h
        .tracker
        .submit_request(
            SubmitRequest::new(JobKind::Training, JobPayload::new("churn model").with_model_ref("xgb"))
                .with_identity(id("T1")),
        )
        .await
        .unwrap();
    assert_eq!(receipt.identity, id("T1"));

    let pending = h.tracker.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].identity, Some(id("T1")));
    let view = h.tracker.view().await;
    assert_eq!(view.provisional.len(), 1);
    assert!(view.jobs.is_empty());

    let now = h.clock.now();
    let mut record = JobRecord::queued(id("T1"), h.tenant, JobKind::Training, JobPayload::new("churn model"), now);
    record.start(now).unwrap();
    record.complete(now + ChronoDuration::milliseconds(120_000)).unwrap();
    assert_eq!(record.duration_ms, Some(120_000));

    let update = h.tracker.apply(feed(h.tenant, vec![record.clone()], now)).await;
    assert_eq!(update.retired.len(), 1);
    assert!(h.tracker.pending().await.is_empty());

    let notifications = h.tracker.notifications(50).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].level, NotificationLevel::Success);
    assert_eq!(notifications[0].job_id, id("T1"));

    // Reconnect: the same terminal record again changes nothing.
    let again = h.tracker.apply(feed(h.tenant, vec![record], now)).await;
    assert!(again.retired.is_empty());
    assert!(again.notifications.is_empty());
    assert_eq!(h.tracker.notifications(50).await.unwrap().len(), 1);
}

#[tokio::test]
async fn scenario_b_count_delta_retires_the_oldest_entry() {
    let h = harness(EngineConfig::default().with_strategy(ReconcileStrategy::CountDelta)).await;
    let now = h.clock.now();

    // Establish the baseline before anything is pending.
    let primed = h.tracker.apply(feed(h.tenant, vec![], now)).await;
    assert!(primed.retired.is_empty());

    h.tracker.submit(JobKind::Training, JobPayload::new("first")).await.unwrap();
    h.clock.advance(ChronoDuration::seconds(1));
    h.tracker.submit(JobKind::Training, JobPayload::new("second")).await.unwrap();
    assert_eq!(h.tracker.pending().await.len(), 2);

    // One record appears that carries no identity this client knows.
    let unrelated = completed(h.tenant, "remote-1", 60, now);
    let update = h.tracker.apply(feed(h.tenant, vec![unrelated.clone()], now)).await;
    assert_eq!(update.retired.len(), 1);
    assert_eq!(update.retired[0].label, "first");
    assert!(update.drift.is_none());

    let pending = h.tracker.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].label, "second");

    // Three more records with one pending: clamped, reported as drift.
    let records = vec![
        unrelated,
        completed(h.tenant, "remote-2", 60, now),
        completed(h.tenant, "remote-3", 60, now),
        completed(h.tenant, "remote-4", 60, now),
    ];
    let update = h.tracker.apply(feed(h.tenant, records.clone(), now)).await;
    assert_eq!(update.retired.len(), 1);
    assert_eq!(update.drift, Some(ReconciliationDrift::Overcount { delta: 3, pending: 1 }));
    assert!(h.tracker.pending().await.is_empty());

    // Unchanged feed: nothing more to retire.
    assert!(h.tracker.apply(feed(h.tenant, records, now)).await.retired.is_empty());
}

#[tokio::test]
async fn scenario_c_cancel_on_processing_job_is_rejected_without_side_effects() {
    let h = harness(EngineConfig::default()).await;
    let job = h.tracker.submit(JobKind::Prediction, JobPayload::new("scoring")).await.unwrap();
    h.tracker.refresh().await;
    h.store.claim_next(Some(h.tenant)).unwrap();
    h.tracker.refresh().await;

    let before = h.tracker.view().await;
    let err = h.tracker.cancel(&job).await.unwrap_err();
    assert_eq!(
        err,
        CancelError::Conflict {
            job_id: job.clone(),
            current: JobStatus::Processing,
        }
    );

    let after = h.tracker.view().await;
    assert_eq!(before.jobs, after.jobs);
    assert_eq!(after.job(&job).unwrap().record.status, JobStatus::Processing);
    assert!(!after.job(&job).unwrap().cancel_pending);
    assert!(h.tracker.pending().await.is_empty());
    assert!(h.tracker.notifications(50).await.unwrap().is_empty());

    let update = h.tracker.refresh().await;
    assert!(update.notifications.is_empty());
    assert_eq!(h.store.stats(h.tenant).processing, 1);
}

#[tokio::test]
async fn cancel_on_queued_job_is_accepted_and_notified() {
    let h = harness(EngineConfig::default()).await;
    let job = h.tracker.submit(JobKind::Training, JobPayload::new("retrain")).await.unwrap();
    h.tracker.refresh().await;
    assert!(h.tracker.view().await.job(&job).unwrap().cancelable);

    h.tracker.cancel(&job).await.unwrap();
    let update = h.tracker.refresh().await;
    assert_eq!(update.notifications.len(), 1);
    assert_eq!(update.notifications[0].level, NotificationLevel::Info);
    assert_eq!(update.notifications[0].title, "Training canceled");
}

#[tokio::test]
async fn scenario_d_eta_from_recent_completions() {
    let h = harness(EngineConfig::default()).await;
    let now = h.clock.now();

    let mut history: Vec<JobRecord> = [200, 180, 220, 190, 210]
        .iter()
        .enumerate()
        .map(|(i, secs)| completed(h.tenant, &format!("hist-{i}"), *secs, now - ChronoDuration::minutes(10 + i as i64)))
        .collect();
    let eta = EtaEstimator::default();
    assert_eq!(eta.baseline(JobKind::Training, &history), Duration::from_secs(200));

    let ahead = JobRecord::queued(id("ahead"), h.tenant, JobKind::Training, JobPayload::new("ahead"), now - ChronoDuration::seconds(30));
    let fresh = JobRecord::queued(id("fresh"), h.tenant, JobKind::Training, JobPayload::new("fresh"), now);
    history.push(ahead);
    history.push(fresh);
    h.store.seed(history);

    h.tracker.refresh().await;
    let view = h.tracker.view().await;
    assert_eq!(view.job(&id("fresh")).unwrap().eta, Some(Duration::from_secs(400)));
    assert_eq!(view.job(&id("ahead")).unwrap().eta, Some(Duration::from_secs(200)));
    assert_eq!(view.job(&id("hist-0")).unwrap().eta, None);

    // History does not notify on the first snapshot.
    assert_eq!(h.tracker.unread_count().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_submission_creates_no_entry() {
    let h = harness(EngineConfig::default().with_submit_retry(RetryPolicy::no_retry())).await;
    h.store.fail_next_writes(1);

    let err = h.tracker.submit(JobKind::Training, JobPayload::new("lost")).await;
    assert!(err.is_err());
    assert!(h.tracker.pending().await.is_empty());
    assert!(h.tracker.view().await.is_empty());
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        /// Property: optimistic entries created == successful submissions.
        #[test]
        fn entries_match_successful_submissions(failures in prop::collection::vec(any::<bool>(), 1..12)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (succeeded, pending, stored) = rt.block_on(async {
                let h = harness(EngineConfig::default().with_submit_retry(RetryPolicy::no_retry())).await;
                let mut succeeded = 0;
                for (i, fail) in failures.iter().enumerate() {
                    if *fail {
                        h.store.fail_next_writes(1);
                    }
                    if h.tracker.submit(JobKind::Prediction, JobPayload::new(format!("job-{i}"))).await.is_ok() {
                        succeeded += 1;
                    }
                }
                let pending = h.tracker.pending().await.len();
                (succeeded, pending, h.store.snapshot(h.tenant).records.len())
            });
            prop_assert_eq!(pending, succeeded);
            prop_assert_eq!(stored, succeeded);
            prop_assert_eq!(succeeded, failures.iter().filter(|f| !**f).count());
        }
    }
}
