use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use jobwatch_core::{JobIdentity, TenantId};

use super::EmailMessage;
use crate::error::EmailError;
use crate::local_store::SqliteLocalStore;

/// Where queued emails live between enqueue and delivery.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert unless a message for the same `(tenant_id, job_id)` exists.
    /// Returns whether it was inserted.
    async fn enqueue(&self, message: EmailMessage) -> Result<bool, EmailError>;

    /// Pending messages due at `now`, oldest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EmailMessage>, EmailError>;

    /// Overwrite the delivery state of an existing message.
    async fn update(&self, message: &EmailMessage) -> Result<(), EmailError>;

    /// Every message for `tenant_id`, oldest first.
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<EmailMessage>, EmailError>;
}

#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    messages: RwLock<Vec<EmailMessage>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, message: EmailMessage) -> Result<bool, EmailError> {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        if messages
            .iter()
            .any(|m| m.tenant_id == message.tenant_id && m.job_id == message.job_id)
        {
            return Ok(false);
        }
        messages.push(message);
        Ok(true)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EmailMessage>, EmailError> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        let mut due: Vec<EmailMessage> = messages.iter().filter(|m| m.is_due(now)).cloned().collect();
        due.sort_by_key(|m| m.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn update(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        match messages
            .iter_mut()
            .find(|m| m.tenant_id == message.tenant_id && m.job_id == message.job_id)
        {
            Some(existing) => {
                *existing = message.clone();
                Ok(())
            }
            None => Err(EmailError::Storage(format!("no queued email for job {}", message.job_id))),
        }
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<EmailMessage>, EmailError> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<EmailMessage> = messages.iter().filter(|m| m.tenant_id == tenant_id).cloned().collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }
}

/// Outbox table in the local SQLite file, sharing the ledger's pool.
#[derive(Debug, Clone)]
pub struct SqliteOutboxStore {
    db: SqliteLocalStore,
    schema: Arc<tokio::sync::OnceCell<()>>,
}

impl SqliteOutboxStore {
    pub fn new(db: SqliteLocalStore) -> Self {
        Self {
            db,
            schema: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    async fn pool(&self) -> anyhow::Result<SqlitePool> {
        let pool = self.db.pool().await?;
        self.schema
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS email_outbox (
                        tenant_id        TEXT NOT NULL,
                        job_id           TEXT NOT NULL,
                        to_email         TEXT NOT NULL,
                        subject          TEXT NOT NULL,
                        text             TEXT NOT NULL,
                        html             TEXT NOT NULL,
                        status           TEXT NOT NULL,
                        attempts         INTEGER NOT NULL DEFAULT 0,
                        next_attempt_at  TEXT NOT NULL,
                        next_attempt_us  INTEGER NOT NULL,
                        last_error       TEXT,
                        created_at       TEXT NOT NULL,
                        created_at_us    INTEGER NOT NULL,
                        updated_at       TEXT NOT NULL,
                        PRIMARY KEY (tenant_id, job_id)
                    )
                    "#,
                )
                .execute(&pool)
                .await
                .context("failed to create email_outbox table")?;
                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_email_outbox_due ON email_outbox (status, next_attempt_us)",
                )
                .execute(&pool)
                .await
                .context("failed to index email_outbox table")?;
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        Ok(pool)
    }
}

const COLUMNS: &str = "tenant_id, job_id, to_email, subject, text, html, status, attempts, \
                       next_attempt_at, last_error, created_at, updated_at";

fn decode_message(row: &SqliteRow) -> anyhow::Result<EmailMessage> {
    Ok(EmailMessage {
        tenant_id: row.try_get::<String, _>("tenant_id")?.parse()?,
        job_id: JobIdentity::parse(row.try_get::<String, _>("job_id")?)?,
        to: row.try_get("to_email")?,
        subject: row.try_get("subject")?,
        text: row.try_get("text")?,
        html: row.try_get("html")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        attempts: u32::try_from(row.try_get::<i64, _>("attempts")?)?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn decode_all(rows: &[SqliteRow]) -> Result<Vec<EmailMessage>, EmailError> {
    rows.iter()
        .map(|row| decode_message(row).map_err(EmailError::from))
        .collect()
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn enqueue(&self, message: EmailMessage) -> Result<bool, EmailError> {
        let pool = self.pool().await?;
        let done = sqlx::query(
            r#"
            INSERT OR IGNORE INTO email_outbox
                (tenant_id, job_id, to_email, subject, text, html, status, attempts,
                 next_attempt_at, next_attempt_us, last_error, created_at, created_at_us, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(message.tenant_id.to_string())
        .bind(message.job_id.as_str())
        .bind(&message.to)
        .bind(&message.subject)
        .bind(&message.text)
        .bind(&message.html)
        .bind(message.status.as_str())
        .bind(i64::from(message.attempts))
        .bind(message.next_attempt_at)
        .bind(message.next_attempt_at.timestamp_micros())
        .bind(&message.last_error)
        .bind(message.created_at)
        .bind(message.created_at.timestamp_micros())
        .bind(message.updated_at)
        .execute(&pool)
        .await
        .context("failed to queue email")?;
        Ok(done.rows_affected() > 0)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EmailMessage>, EmailError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM email_outbox \
             WHERE status = 'pending' AND next_attempt_us <= ?1 \
             ORDER BY created_at_us ASC, job_id ASC LIMIT ?2"
        ))
        .bind(now.timestamp_micros())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&pool)
        .await
        .context("failed to read due emails")?;
        decode_all(&rows)
    }

    async fn update(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let pool = self.pool().await?;
        let done = sqlx::query(
            r#"
            UPDATE email_outbox
            SET status = ?1, attempts = ?2, next_attempt_at = ?3, next_attempt_us = ?4,
                last_error = ?5, updated_at = ?6
            WHERE tenant_id = ?7 AND job_id = ?8
            "#,
        )
        .bind(message.status.as_str())
        .bind(i64::from(message.attempts))
        .bind(message.next_attempt_at)
        .bind(message.next_attempt_at.timestamp_micros())
        .bind(&message.last_error)
        .bind(message.updated_at)
        .bind(message.tenant_id.to_string())
        .bind(message.job_id.as_str())
        .execute(&pool)
        .await
        .context("failed to update queued email")?;
        if done.rows_affected() == 0 {
            return Err(EmailError::Storage(format!("no queued email for job {}", message.job_id)));
        }
        Ok(())
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<EmailMessage>, EmailError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM email_outbox WHERE tenant_id = ?1 ORDER BY created_at_us ASC, job_id ASC"
        ))
        .bind(tenant_id.to_string())
        .fetch_all(&pool)
        .await
        .context("failed to list queued emails")?;
        decode_all(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::tests::transition;
    use crate::email::{EmailStatus, compose};
    use jobwatch_core::{JobKind, JobStatus};

    fn message(tenant: TenantId, id: &str, at: DateTime<Utc>) -> EmailMessage {
        let t = transition(tenant, id, JobKind::Prediction, JobStatus::Completed);
        EmailMessage::new(tenant, t.job_id.clone(), "ops@example.com", compose(&t).unwrap(), at)
    }

    #[tokio::test]
    async fn sqlite_outbox_dedupes_schedules_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobwatch.db");
        let tenant = TenantId::new();
        let now = Utc::now();

        let store = SqliteOutboxStore::new(SqliteLocalStore::new(&path));
        assert!(store.enqueue(message(tenant, "first", now)).await.unwrap());
        assert!(!store.enqueue(message(tenant, "first", now)).await.unwrap());
        assert!(store.enqueue(message(tenant, "second", now + chrono::Duration::seconds(1))).await.unwrap());

        let due = store.due(now + chrono::Duration::seconds(5), 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].job_id.as_str(), "first");
        assert_eq!(store.due(now + chrono::Duration::seconds(5), 1).await.unwrap().len(), 1);

        let mut retry = due[0].clone();
        retry.attempts = 1;
        retry.next_attempt_at = now + chrono::Duration::minutes(10);
        retry.last_error = Some("provider down".into());
        store.update(&retry).await.unwrap();
        let mut sent = due[1].clone();
        sent.status = EmailStatus::Sent;
        store.update(&sent).await.unwrap();
        assert!(store.due(now + chrono::Duration::seconds(5), 10).await.unwrap().is_empty());

        let reopened = SqliteOutboxStore::new(SqliteLocalStore::new(&path));
        let listed = reopened.list(tenant).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].attempts, 1);
        assert_eq!(listed[0].last_error.as_deref(), Some("provider down"));
        assert_eq!(listed[1].status, EmailStatus::Sent);
        assert_eq!(reopened.due(now + chrono::Duration::minutes(10), 10).await.unwrap().len(), 1);
        assert!(reopened.list(TenantId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn updating_an_unknown_message_is_an_error() {
        let store = InMemoryOutboxStore::new();
        let err = store.update(&message(TenantId::new(), "ghost", Utc::now())).await.unwrap_err();
        assert!(matches!(err, EmailError::Storage(_)));
    }
}
