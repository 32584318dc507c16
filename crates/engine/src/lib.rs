//! `jobwatch-engine`
//!
//! Job lifecycle tracking and reconciliation.
//!
//! Data flow for one tenant:
//!
//! ```text
//! submit ──► EnqueueGateway ──► JobStore (queued record) ──► EnqueueService
//!    └──────► OptimisticLedger (provisional entry)
//!
//! JobFeed (poll | push) ──► JobTracker::apply
//!                             ├─ Reconciler        retire provisional entries
//!                             ├─ transition detect  JobTransition events
//!                             ├─ NotificationCenter durable, deduped notifications
//!                             └─ EtaEstimator      advisory remaining time in the view
//!
//! JobTracker::transitions ──► EmailOutbox ──► OutboxStore ──► EmailTransport
//! ```
//!
//! External collaborators are ports (`JobStore`, `EnqueueService`,
//! `ResultStore`, `NotificationSink`, `LocalStore`, `OutboxStore`,
//! `EmailTransport`) with in-memory implementations for tests/dev, HTTP
//! adapters for the remote services and SQLite adapters for local state.

pub mod cancel;
pub mod config;
pub mod email;
pub mod enqueue;
pub mod error;
pub mod eta;
pub mod feed;
pub mod http;
pub mod ledger;
pub mod local_store;
pub mod notify;
pub mod reconcile;
pub mod results;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod view;
pub mod worker;

pub use cancel::{CancelGuard, CancelOutcome};
pub use config::EngineConfig;
pub use email::{
    DeliveryReport, EmailConfig, EmailMessage, EmailOutbox, EmailStatus, EmailTransport,
    HttpEmailTransport, InMemoryOutboxStore, OutboxStore, RecordingEmailTransport, SqliteOutboxStore,
};
pub use enqueue::{
    EnqueueAck, EnqueueError, EnqueueGateway, EnqueueRequest, EnqueueService,
    RecordingEnqueueService, SubmitReceipt, SubmitRequest,
};
pub use error::{CancelError, EmailError, FeedError, SubmissionError, TrackerError};
pub use eta::{EtaConfig, EtaEstimator};
pub use feed::{FeedEvent, JobFeed, PollingFeed, PushFeed, drive};
pub use http::HttpBackend;
pub use ledger::{LEDGER_KEY, OptimisticEntry, OptimisticLedger};
pub use local_store::{InMemoryLocalStore, LocalStore, LocalStoreError, SqliteLocalStore};
pub use notify::{
    InMemoryNotificationSink, NotificationCenter, NotificationProjector, NotificationSink,
    NotificationSinkError, SqliteNotificationSink,
};
pub use reconcile::{
    CountBasis, ReconcileOutcome, ReconcileStrategy, ReconciliationDrift, Reconciler,
};
pub use results::{InMemoryResultStore, ResultStore, ResultStoreError};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{CreateOutcome, InMemoryJobStore, JobQuery, JobStats, JobStore, JobStoreError};
pub use tracker::{JobTracker, NOTIFY_WATERMARK_KEY, TrackerParts, TrackerUpdate};
pub use view::{FeedHealth, JobRow, JobView, ProvisionalRow, ViewRow};
pub use worker::{SimulatedWorker, WorkOutcome, WorkerConfig, WorkerHandle, WorkerStats};
