use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Args;

use jobwatch_core::{JobKind, JobPayload, JobRecord, ResultRecord, TenantId};
use jobwatch_engine::{
    EmailOutbox, EmailTransport, EngineConfig, FeedEvent, HttpBackend, HttpEmailTransport,
    InMemoryJobStore, InMemoryOutboxStore, InMemoryResultStore, JobFeed, JobTracker, OutboxStore,
    PushFeed, RecordingEmailTransport, SimulatedWorker, SqliteLocalStore, SqliteNotificationSink,
    SqliteOutboxStore, TrackerParts, TrackerUpdate, WorkOutcome, WorkerConfig,
};
use jobwatch_events::{EventBus, InMemoryEventBus};

use crate::render::{render_notification, render_view};

const DEFAULT_LEDGER_DB: &str = ".jobwatch/ledger.db";
const EMAIL_API_KEY_VAR: &str = "JOBWATCH_EMAIL_API_KEY";

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Tenant to follow (random in demo mode when omitted).
    #[arg(long)]
    pub tenant: Option<TenantId>,

    /// Base URL of the job/enqueue/result services.
    #[arg(long)]
    pub api: Option<String>,

    /// Poll interval in milliseconds.
    #[arg(long)]
    pub poll_ms: Option<u64>,

    /// Run against an in-process backend with a simulated worker.
    #[arg(long)]
    pub demo: bool,

    /// Stop after this many seconds (0 = until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    pub duration_secs: u64,

    /// SQLite file holding the optimistic ledger, notifications and email outbox.
    #[arg(long)]
    pub ledger_db: Option<PathBuf>,

    /// Email this address when a job completes.
    #[arg(long)]
    pub notify_email: Option<String>,

    /// Email provider endpoint (key read from JOBWATCH_EMAIL_API_KEY).
    #[arg(long)]
    pub email_api: Option<String>,

    /// Sender address for completion emails.
    #[arg(long)]
    pub email_sender: Option<String>,
}

pub async fn execute(args: WatchArgs, mut config: EngineConfig) -> anyhow::Result<()> {
    if let Some(ms) = args.poll_ms {
        config = config.with_poll_interval(Duration::from_millis(ms));
    }
    if let Some(url) = &args.api {
        config = config.with_api_base_url(url.as_str());
    }
    if let Some(path) = &args.ledger_db {
        config = config.with_ledger_db_path(path);
    }
    if let Some(to) = &args.notify_email {
        config = config.with_notify_email(to.as_str());
    }
    if let Some(url) = &args.email_api {
        config.email.api_url = Some(url.clone());
    }
    if let Some(sender) = &args.email_sender {
        config.email.sender_email = Some(sender.clone());
    }
    let limit = (args.duration_secs > 0).then(|| Duration::from_secs(args.duration_secs));

    if args.demo {
        return demo(args.tenant.unwrap_or_default(), config, limit).await;
    }

    let tenant = args.tenant.context("--tenant is required unless --demo is set")?;
    let Some(api) = config.api_base_url.clone() else {
        bail!("--api (or JOBWATCH_API_BASE_URL) is required unless --demo is set");
    };

    let backend = Arc::new(HttpBackend::new(api.as_str()));
    let ledger_path = config
        .ledger_db_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_DB));
    let db = SqliteLocalStore::new(ledger_path);
    let transport = match &config.email.recipient {
        Some(_) => Some(http_transport(&config)?),
        None => None,
    };

    let parts = TrackerParts {
        store: backend.clone(),
        enqueue: backend.clone(),
        results: backend,
        notifications: Arc::new(SqliteNotificationSink::new(db.clone())),
        local: Arc::new(db.clone()),
        clock: Arc::new(jobwatch_core::SystemClock),
    };
    let tracker = JobTracker::start(tenant, config, parts)
        .await
        .context("failed to start job tracker")?;
    let outbox = transport.and_then(|transport| {
        start_outbox(&tracker, Arc::new(SqliteOutboxStore::new(db)), transport)
    });

    tracing::info!(tenant_id = %tenant, api = %api, "watching remote jobs");
    let feed = tracker.polling_feed();
    let result = follow(&tracker, feed, limit).await;
    stop_outbox(outbox).await;
    result
}

fn http_transport(config: &EngineConfig) -> anyhow::Result<Arc<dyn EmailTransport>> {
    let Some(api_url) = config.email.api_url.clone() else {
        bail!("--email-api (or JOBWATCH_EMAIL_API_URL) is required with --notify-email");
    };
    let Some(sender) = config.email.sender_email.clone() else {
        bail!("--email-sender (or JOBWATCH_EMAIL_SENDER) is required with --notify-email");
    };
    let api_key = std::env::var(EMAIL_API_KEY_VAR)
        .with_context(|| format!("{EMAIL_API_KEY_VAR} must be set to send completion emails"))?;
    let transport = HttpEmailTransport::with_timeout(api_url, api_key, sender, Duration::from_secs(15))
        .context("failed to build email client")?
        .with_sender_name(config.email.sender_name.as_str());
    Ok(Arc::new(transport))
}

/// Feed the tracker's transitions into an email outbox on a background task.
fn start_outbox(
    tracker: &JobTracker,
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn EmailTransport>,
) -> Option<(Arc<EmailOutbox>, tokio::task::JoinHandle<()>)> {
    let email = &tracker.config().email;
    let recipient = email.recipient.clone()?;
    let outbox = Arc::new(
        EmailOutbox::new(recipient, store, transport, Arc::new(jobwatch_core::SystemClock))
            .with_retry(email.retry.clone())
            .with_batch_size(email.batch_size),
    );
    let interval = email.poll_interval;
    let transitions = tracker.transitions();
    let task = {
        let outbox = outbox.clone();
        tokio::spawn(async move { outbox.run(transitions, interval).await })
    };
    tracing::info!(recipient = %outbox.recipient(), "completion emails enabled");
    Some((outbox, task))
}

async fn stop_outbox(outbox: Option<(Arc<EmailOutbox>, tokio::task::JoinHandle<()>)>) {
    let Some((outbox, task)) = outbox else {
        return;
    };
    task.abort();
    match outbox.deliver_due().await {
        Ok(report) if !report.is_empty() => tracing::info!(?report, "final email delivery pass"),
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "final email delivery pass failed"),
    }
}

async fn demo(tenant: TenantId, config: EngineConfig, limit: Option<Duration>) -> anyhow::Result<()> {
    let bus = Arc::new(InMemoryEventBus::new());
    let store = Arc::new(InMemoryJobStore::new().publishing_to(bus.clone()));
    let results = InMemoryResultStore::arc();

    let mut parts = TrackerParts::in_memory(store.clone());
    parts.results = results.clone();
    let outbox_store: Arc<dyn OutboxStore> = match &config.ledger_db_path {
        Some(path) => {
            let db = SqliteLocalStore::new(path);
            parts.notifications = Arc::new(SqliteNotificationSink::new(db.clone()));
            parts.local = Arc::new(db.clone());
            Arc::new(SqliteOutboxStore::new(db))
        }
        None => InMemoryOutboxStore::arc(),
    };
    let tracker = JobTracker::start(tenant, config, parts).await?;
    // Demo mode never reaches a real provider.
    let mailer = RecordingEmailTransport::arc();
    let outbox = start_outbox(&tracker, outbox_store, mailer.clone());

    let mut worker = SimulatedWorker::new(store.clone()).with_results(results);
    worker.register_handler(JobKind::Training, |job: &JobRecord| {
        WorkOutcome::SuccessWithResult(
            ResultRecord::new(job.id.clone(), job.tenant_id, job.payload.label.clone(), chrono::Utc::now())
                .with_metric("accuracy", 0.87)
                .with_metric("f1", 0.81),
        )
    });
    worker.register_handler(JobKind::Prediction, |job: &JobRecord| match job.payload.row_count {
        Some(0) | None => WorkOutcome::Failure("input dataset is empty".into()),
        Some(_) => WorkOutcome::Success,
    });
    let worker = worker.spawn(
        WorkerConfig::default()
            .with_tenant(tenant)
            .with_work_time(Duration::from_secs(3)),
    );

    let feed = PushFeed::new(tenant, bus.subscribe()).primed_with(store.snapshot(tenant));

    tracker
        .submit(JobKind::Training, JobPayload::new("Churn model").with_model_ref("gbm-v2"))
        .await?;
    tracker
        .submit(
            JobKind::Prediction,
            JobPayload::new("Churn model").with_mode("batch").with_row_count(1200),
        )
        .await?;
    tracker
        .submit(JobKind::Prediction, JobPayload::new("Churn model").with_mode("batch").with_row_count(0))
        .await?;
    let doomed = tracker
        .submit(JobKind::Training, JobPayload::new("Experimental model"))
        .await?;
    match tracker.cancel(&doomed).await {
        Ok(outcome) => tracing::info!(job_id = %doomed, ?outcome, "demo cancel sent"),
        Err(err) => tracing::info!(job_id = %doomed, error = %err, "demo cancel rejected"),
    }

    tracing::info!(tenant_id = %tenant, "demo backend running");
    let result = follow(&tracker, feed, limit).await;
    worker.shutdown().await;
    stop_outbox(outbox).await;
    for message in mailer.sent() {
        println!("email to {}: {}\n{}", message.to, message.subject, message.text);
    }
    result
}

/// Apply feed updates and print the view until the feed ends, the time
/// limit passes or Ctrl-C.
async fn follow<F: JobFeed>(tracker: &JobTracker, mut feed: F, limit: Option<Duration>) -> anyhow::Result<()> {
    let updates = async {
        while let Some(event) = feed.next().await {
            let stale = matches!(event, FeedEvent::Unavailable { .. });
            let update = tracker.apply(event).await;
            report(tracker, &update, stale).await;
        }
    };
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = updates => tracing::info!("job feed ended"),
        _ = deadline => tracing::info!("time limit reached"),
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for Ctrl-C")?;
            tracing::info!("interrupted");
        }
    }

    let unread = tracker.unread_count().await?;
    tracing::info!(unread, "stopped watching");
    Ok(())
}

async fn report(tracker: &JobTracker, update: &TrackerUpdate, stale: bool) {
    for n in &update.notifications {
        println!("{}", render_notification(n));
    }
    if stale || !update.transitions.is_empty() || !update.retired.is_empty() {
        println!("{}", render_view(&tracker.view().await));
    }
}
