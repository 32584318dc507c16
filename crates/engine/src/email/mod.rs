//! Completion emails.
//!
//! [`EmailOutbox`] listens to the tracker's transitions, writes one message
//! per completed job into an [`OutboxStore`] and drains due messages through
//! an [`EmailTransport`]. A failed send is rescheduled on the outbox's
//! [`RetryPolicy`]; once the attempts run out the message stays `failed` in
//! the store with its last error.
//!
//! ```text
//! JobTracker ──► transitions ──► EmailOutbox::enqueue ──► OutboxStore (pending)
//!                                 EmailOutbox::deliver_due ──► EmailTransport
//! ```

mod compose;
mod store;
mod transport;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwatch_core::{Clock, DomainError, JobIdentity, TenantId};
use jobwatch_events::{EventEnvelope, JobTransition, Subscription};

use crate::error::EmailError;
use crate::retry::RetryPolicy;

pub use compose::{ComposedEmail, compose};
pub use store::{InMemoryOutboxStore, OutboxStore, SqliteOutboxStore};
pub use transport::{EmailTransport, HttpEmailTransport, RecordingEmailTransport};

/// Longest `last_error` kept on a message.
pub const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Pending,
    Sent,
    Failed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for EmailStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!("unknown email status '{other}'"))),
        }
    }
}

/// One queued email. At most one exists per `(tenant_id, job_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub tenant_id: TenantId,
    pub job_id: JobIdentity,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub status: EmailStatus,
    /// Failed sends so far.
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailMessage {
    pub fn new(
        tenant_id: TenantId,
        job_id: JobIdentity,
        to: impl Into<String>,
        content: ComposedEmail,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            job_id,
            to: to.into(),
            subject: content.subject,
            text: content.text,
            html: content.html,
            status: EmailStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EmailStatus::Pending && self.next_attempt_at <= now
    }

    fn record_sent(&mut self, now: DateTime<Utc>) {
        self.status = EmailStatus::Sent;
        self.last_error = None;
        self.updated_at = now;
    }

    fn record_failure(&mut self, error: &EmailError, retry: &RetryPolicy, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_error = Some(error.to_string().chars().take(MAX_ERROR_CHARS).collect());
        self.updated_at = now;
        if retry.should_retry(self.attempts) {
            let delay = retry.delay_for_attempt(self.attempts);
            self.next_attempt_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        } else {
            self.status = EmailStatus::Failed;
        }
    }
}

/// Email settings; `EngineConfig::email`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Where completion emails go. No outbox runs without one.
    pub recipient: Option<String>,
    /// Provider endpoint for [`HttpEmailTransport`].
    pub api_url: Option<String>,
    pub sender_email: Option<String>,
    pub sender_name: String,
    /// Attempts and spacing for failed sends.
    pub retry: RetryPolicy,
    /// How often due messages are drained.
    pub poll_interval: Duration,
    /// Messages sent per drain.
    pub batch_size: usize,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            api_url: None,
            sender_email: None,
            sender_name: "Job Watch".to_string(),
            retry: RetryPolicy::exponential(5, Duration::from_secs(15), Duration::from_secs(3600)),
            poll_interval: Duration::from_secs(3),
            batch_size: 10,
        }
    }
}

/// What one drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn is_empty(&self) -> bool {
        self.sent + self.retried + self.failed == 0
    }
}

pub struct EmailOutbox {
    recipient: String,
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn EmailTransport>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl EmailOutbox {
    pub fn new(
        recipient: impl Into<String>,
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn EmailTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let defaults = EmailConfig::default();
        Self {
            recipient: recipient.into(),
            store,
            transport,
            clock,
            retry: defaults.retry,
            batch_size: defaults.batch_size,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Queue the completion email for `transition`.
    ///
    /// Returns `false` for anything but a completion and for jobs that
    /// already have a message.
    pub async fn enqueue(&self, transition: &JobTransition) -> Result<bool, EmailError> {
        let Some(content) = compose(transition) else {
            return Ok(false);
        };
        let message = EmailMessage::new(
            transition.record.tenant_id,
            transition.job_id.clone(),
            self.recipient.as_str(),
            content,
            self.clock.now(),
        );
        let inserted = self.store.enqueue(message).await?;
        if inserted {
            tracing::info!(
                tenant_id = %transition.record.tenant_id,
                job_id = %transition.job_id,
                "completion email queued"
            );
        }
        Ok(inserted)
    }

    /// Try every message due now, oldest first, up to the batch size.
    pub async fn deliver_due(&self) -> Result<DeliveryReport, EmailError> {
        let now = self.clock.now();
        let mut report = DeliveryReport::default();

        for mut message in self.store.due(now, self.batch_size).await? {
            match self.transport.send(&message).await {
                Ok(()) => {
                    message.record_sent(now);
                    report.sent += 1;
                    tracing::info!(job_id = %message.job_id, to = %message.to, "completion email sent");
                }
                Err(err) => {
                    message.record_failure(&err, &self.retry, now);
                    if message.status == EmailStatus::Failed {
                        report.failed += 1;
                        tracing::warn!(job_id = %message.job_id, attempts = message.attempts, error = %err, "giving up on completion email");
                    } else {
                        report.retried += 1;
                        tracing::debug!(
                            job_id = %message.job_id,
                            attempts = message.attempts,
                            next_attempt_at = %message.next_attempt_at,
                            error = %err,
                            "completion email send failed"
                        );
                    }
                }
            }
            self.store.update(&message).await?;
        }

        Ok(report)
    }

    pub async fn messages(&self, tenant_id: TenantId) -> Result<Vec<EmailMessage>, EmailError> {
        self.store.list(tenant_id).await
    }

    /// Queue completions from `transitions` and drain every `interval`
    /// until the publisher goes away, then drain once more.
    pub async fn run(&self, mut transitions: Subscription<EventEnvelope<JobTransition>>, interval: Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                next = transitions.recv() => match next {
                    Some(envelope) => {
                        if let Err(err) = self.enqueue(envelope.payload()).await {
                            tracing::warn!(job_id = %envelope.payload().job_id, error = %err, "failed to queue completion email");
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    if let Err(err) = self.deliver_due().await {
                        tracing::warn!(error = %err, "email delivery pass failed");
                    }
                }
            }
        }

        if let Err(err) = self.deliver_due().await {
            tracing::warn!(error = %err, "email delivery pass failed");
        }
        tracing::info!(recipient = %self.recipient, "email outbox stopped");
    }
}
