//! Notifications for terminal job transitions.
//!
//! [`NotificationProjector`] is the pure part: a projection over
//! [`JobTransition`] envelopes that emits at most one record per job identity.
//! [`NotificationCenter`] wires it to a durable [`NotificationSink`] and owns
//! the read/unread operations. [`SqliteNotificationSink`] is the sink that
//! survives restarts.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use jobwatch_core::{
    JobIdentity, JobKind, JobStatus, NotificationId, NotificationLevel, NotificationRecord,
    TenantId,
};
use jobwatch_events::{EventEnvelope, JobTransition, Projection, ProjectionRunner};

use crate::eta::format_duration;
use crate::local_store::SqliteLocalStore;

/// Ids per `mark_read` write issued by `mark_all_read`.
pub const MARK_READ_BATCH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotificationSinkError {
    #[error("notification storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for NotificationSinkError {
    fn from(err: anyhow::Error) -> Self {
        NotificationSinkError::Storage(format!("{err:#}"))
    }
}

/// Durable notification log.
///
/// Append-only; the only mutation is setting `read_at`.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn append(&self, record: NotificationRecord) -> Result<(), NotificationSinkError>;

    /// The newest `limit` records for the tenant, newest first.
    async fn list(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, NotificationSinkError>;

    /// Set `read_at` on the given unread records; returns how many changed.
    async fn mark_read(
        &self,
        tenant_id: TenantId,
        ids: &[NotificationId],
        at: DateTime<Utc>,
    ) -> Result<usize, NotificationSinkError>;
}

#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    records: RwLock<Vec<NotificationRecord>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn append(&self, record: NotificationRecord) -> Result<(), NotificationSinkError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, NotificationSinkError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = records
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn mark_read(
        &self,
        tenant_id: TenantId,
        ids: &[NotificationId],
        at: DateTime<Utc>,
    ) -> Result<usize, NotificationSinkError> {
        let wanted: HashSet<&NotificationId> = ids.iter().collect();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter_mut()
            .filter(|r| r.tenant_id == tenant_id && wanted.contains(&r.id))
            .map(|r| r.mark_read(at))
            .filter(|changed| *changed)
            .count())
    }
}

/// Notification log kept in the local SQLite file next to the ledger state,
/// so read state and dedupe survive restarts.
#[derive(Debug, Clone)]
pub struct SqliteNotificationSink {
    db: SqliteLocalStore,
    schema: Arc<tokio::sync::OnceCell<()>>,
}

impl SqliteNotificationSink {
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
                    CREATE TABLE IF NOT EXISTS notifications (
                        id             TEXT PRIMARY KEY,
                        tenant_id      TEXT NOT NULL,
                        job_id         TEXT NOT NULL,
                        title          TEXT NOT NULL,
                        detail         TEXT NOT NULL,
                        level          TEXT NOT NULL,
                        created_at     TEXT NOT NULL,
                        created_at_us  INTEGER NOT NULL,
                        read_at        TEXT
                    )
                    "#,
                )
                .execute(&pool)
                .await
                .context("failed to create notifications table")?;
                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_notifications_tenant ON notifications (tenant_id, created_at_us)",
                )
                .execute(&pool)
                .await
                .context("failed to index notifications table")?;
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        Ok(pool)
    }
}

fn decode_notification(tenant_id: TenantId, row: &SqliteRow) -> anyhow::Result<NotificationRecord> {
    Ok(NotificationRecord {
        id: row.try_get::<String, _>("id")?.parse()?,
        tenant_id,
        job_id: JobIdentity::parse(row.try_get::<String, _>("job_id")?)?,
        title: row.try_get("title")?,
        detail: row.try_get("detail")?,
        level: row.try_get::<String, _>("level")?.parse()?,
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
    })
}

#[async_trait]
impl NotificationSink for SqliteNotificationSink {
    async fn append(&self, record: NotificationRecord) -> Result<(), NotificationSinkError> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, tenant_id, job_id, title, detail, level, created_at, created_at_us, read_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.tenant_id.to_string())
        .bind(record.job_id.as_str())
        .bind(&record.title)
        .bind(&record.detail)
        .bind(record.level.as_str())
        .bind(record.created_at)
        .bind(record.created_at.timestamp_micros())
        .bind(record.read_at)
        .execute(&pool)
        .await
        .context("failed to append notification")?;
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, NotificationSinkError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, title, detail, level, created_at, read_at
            FROM notifications
            WHERE tenant_id = ?1
            ORDER BY created_at_us DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&pool)
        .await
        .context("failed to list notifications")?;

        rows.iter()
            .map(|row| decode_notification(tenant_id, row).map_err(NotificationSinkError::from))
            .collect()
    }

    async fn mark_read(
        &self,
        tenant_id: TenantId,
        ids: &[NotificationId],
        at: DateTime<Utc>,
    ) -> Result<usize, NotificationSinkError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.context("failed to begin mark-read transaction")?;
        let mut changed = 0;
        for id in ids {
            let done = sqlx::query(
                "UPDATE notifications SET read_at = ?1 WHERE tenant_id = ?2 AND id = ?3 AND read_at IS NULL",
            )
            .bind(at)
            .bind(tenant_id.to_string())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("failed to mark notification read")?;
            changed += done.rows_affected() as usize;
        }
        tx.commit().await.context("failed to commit mark-read transaction")?;
        Ok(changed)
    }
}

/// Turns terminal transitions into notification records, once per job.
#[derive(Debug)]
pub struct NotificationProjector {
    tenant_id: TenantId,
    notified: HashSet<JobIdentity>,
    outbox: Vec<NotificationRecord>,
}

impl NotificationProjector {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            notified: HashSet::new(),
            outbox: Vec::new(),
        }
    }

    /// Mark jobs as already notified (e.g. from the durable log).
    pub fn seed(&mut self, ids: impl IntoIterator<Item = JobIdentity>) {
        self.notified.extend(ids);
    }

    pub fn has_notified(&self, id: &JobIdentity) -> bool {
        self.notified.contains(id)
    }

    /// Allow a job to be notified again (its record never reached the sink).
    pub fn forget(&mut self, id: &JobIdentity) {
        self.notified.remove(id);
    }

    pub fn take_outbox(&mut self) -> Vec<NotificationRecord> {
        std::mem::take(&mut self.outbox)
    }
}

impl Projection for NotificationProjector {
    type Ev = JobTransition;

    fn apply(&mut self, envelope: &EventEnvelope<JobTransition>) {
        let transition = envelope.payload();
        if envelope.tenant_id() != self.tenant_id || !transition.is_terminal() {
            return;
        }
        if !self.notified.insert(transition.job_id.clone()) {
            tracing::debug!(job_id = %transition.job_id, "terminal transition already notified");
            return;
        }

        self.outbox.push(render(self.tenant_id, transition));
    }
}

fn render(tenant_id: TenantId, t: &JobTransition) -> NotificationRecord {
    let payload = &t.record.payload;
    let (level, outcome) = match t.to {
        JobStatus::Completed => (NotificationLevel::Success, "complete"),
        JobStatus::Failed => (NotificationLevel::Error, "failed"),
        _ => (NotificationLevel::Info, "canceled"),
    };
    let subject = match t.kind {
        JobKind::Training => "Training",
        JobKind::Prediction => "Prediction",
    };

    let mut detail = match t.kind {
        JobKind::Training => format!("Model: {}", payload.label),
        JobKind::Prediction => {
            let mode = payload.mode.as_deref().unwrap_or("single");
            match payload.row_count {
                Some(rows) => format!("Mode: {mode} ({rows} rows) for {}", payload.label),
                None => format!("Mode: {mode} for {}", payload.label),
            }
        }
    };
    match t.to {
        JobStatus::Completed => {
            if let Some(ms) = t.record.duration_ms {
                detail.push_str(&format!(
                    ". Finished in {}",
                    format_duration(std::time::Duration::from_millis(ms))
                ));
            }
        }
        JobStatus::Failed => {
            if let Some(err) = &t.record.error {
                detail.push_str(&format!(". Error: {err}"));
            }
        }
        _ => detail.push_str(". Canceled before it started"),
    }

    NotificationRecord {
        id: NotificationId::new(),
        tenant_id,
        job_id: t.job_id.clone(),
        title: format!("{subject} {outcome}"),
        detail,
        level,
        created_at: t.observed_at,
        read_at: None,
    }
}

/// Durable notification log with dedupe, for one tenant.
pub struct NotificationCenter {
    tenant_id: TenantId,
    sink: Arc<dyn NotificationSink>,
    runner: ProjectionRunner<NotificationProjector>,
    sequence: u64,
}

impl NotificationCenter {
    /// Open the center, seeding dedupe from what the sink already holds.
    pub async fn load(
        tenant_id: TenantId,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, NotificationSinkError> {
        let existing = sink.list(tenant_id, usize::MAX).await?;
        let mut projector = NotificationProjector::new(tenant_id);
        projector.seed(existing.into_iter().map(|n| n.job_id));

        Ok(Self {
            tenant_id,
            sink,
            runner: ProjectionRunner::new(tenant_id, projector),
            sequence: 0,
        })
    }

    pub fn has_notified(&self, id: &JobIdentity) -> bool {
        self.runner.projection().has_notified(id)
    }

    /// Feed transitions through the projector and persist new records.
    ///
    /// Records that fail to persist are forgotten by the projector so a later
    /// observation can retry them; the first such error is returned.
    pub async fn observe(
        &mut self,
        transitions: &[JobTransition],
    ) -> Result<Vec<NotificationRecord>, NotificationSinkError> {
        for transition in transitions {
            self.sequence += 1;
            let envelope = EventEnvelope::new(
                transition.record.tenant_id,
                self.sequence,
                transition.observed_at,
                transition.clone(),
            );
            if let Err(err) = self.runner.apply(&envelope) {
                tracing::warn!(error = %err, "dropping transition for another tenant");
            }
        }

        let mut created = Vec::new();
        let mut first_error = None;
        for record in self.runner.projection_mut().take_outbox() {
            match self.sink.append(record.clone()).await {
                Ok(()) => {
                    tracing::info!(
                        tenant_id = %self.tenant_id,
                        job_id = %record.job_id,
                        level = ?record.level,
                        title = %record.title,
                        "notification created"
                    );
                    created.push(record);
                }
                Err(err) => {
                    tracing::warn!(job_id = %record.job_id, error = %err, "failed to store notification");
                    self.runner.projection_mut().forget(&record.job_id);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(created),
        }
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<NotificationRecord>, NotificationSinkError> {
        self.sink.list(self.tenant_id, limit).await
    }

    pub async fn unread_count(&self) -> Result<usize, NotificationSinkError> {
        Ok(self
            .sink
            .list(self.tenant_id, usize::MAX)
            .await?
            .iter()
            .filter(|n| n.is_unread())
            .count())
    }

    /// Mark every record unread at invocation time as read.
    ///
    /// The unread ids are collected once up front and written in batches of
    /// [`MARK_READ_BATCH`]; records appended meanwhile stay unread.
    pub async fn mark_all_read(&self, at: DateTime<Utc>) -> Result<usize, NotificationSinkError> {
        let unread: Vec<NotificationId> = self
            .sink
            .list(self.tenant_id, usize::MAX)
            .await?
            .into_iter()
            .filter(|n| n.is_unread())
            .map(|n| n.id)
            .collect();

        let mut marked = 0;
        for batch in unread.chunks(MARK_READ_BATCH) {
            marked += self.sink.mark_read(self.tenant_id, batch, at).await?;
        }
        if marked > 0 {
            tracing::debug!(tenant_id = %self.tenant_id, marked, "notifications marked read");
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_core::{JobPayload, JobRecord};

    fn finished(tenant: TenantId, id: &str, kind: JobKind, to: JobStatus) -> JobTransition {
        let now = Utc::now();
        let mut record = JobRecord::queued(
            JobIdentity::parse(id).unwrap(),
            tenant,
            kind,
            JobPayload::new("Retail v3").with_mode("batch").with_row_count(1200),
            now,
        );
        match to {
            JobStatus::Canceled => record.cancel(now).unwrap(),
            JobStatus::Failed => {
                record.start(now).unwrap();
                record.fail("out of memory", now).unwrap();
            }
            _ => {
                record.start(now).unwrap();
                record.complete(now + chrono::Duration::seconds(120)).unwrap();
            }
        }
        JobTransition::new(Some(JobStatus::Processing), record, now)
    }

    #[test]
    fn levels_and_titles_follow_outcome() {
        let tenant = TenantId::new();
        let mut p = NotificationProjector::new(tenant);
        for (i, (kind, to)) in [
            (JobKind::Training, JobStatus::Completed),
            (JobKind::Prediction, JobStatus::Failed),
            (JobKind::Training, JobStatus::Canceled),
        ]
        .into_iter()
        .enumerate()
        {
            let t = finished(tenant, &format!("j{i}"), kind, to);
            p.apply(&EventEnvelope::new(tenant, i as u64 + 1, Utc::now(), t));
        }

        let out = p.take_outbox();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].title, "Training complete");
        assert_eq!(out[0].level, NotificationLevel::Success);
        assert!(out[0].detail.contains("2m 0s"));
        assert_eq!(out[1].title, "Prediction failed");
        assert_eq!(out[1].level, NotificationLevel::Error);
        assert!(out[1].detail.contains("1200 rows"));
        assert!(out[1].detail.contains("out of memory"));
        assert_eq!(out[2].level, NotificationLevel::Info);
    }

    #[test]
    fn non_terminal_and_foreign_transitions_are_ignored() {
        let tenant = TenantId::new();
        let mut p = NotificationProjector::new(tenant);
        let mut t = finished(tenant, "a", JobKind::Training, JobStatus::Completed);
        t.to = JobStatus::Processing;
        p.apply(&EventEnvelope::new(tenant, 1, Utc::now(), t));

        let foreign = finished(tenant, "b", JobKind::Training, JobStatus::Completed);
        p.apply(&EventEnvelope::new(TenantId::new(), 2, Utc::now(), foreign));

        assert!(p.take_outbox().is_empty());
    }

    #[tokio::test]
    async fn observing_the_same_terminal_job_repeatedly_notifies_once() {
        let tenant = TenantId::new();
        let sink = InMemoryNotificationSink::arc();
        let mut center = NotificationCenter::load(tenant, sink.clone()).await.unwrap();
        let t = finished(tenant, "T1", JobKind::Training, JobStatus::Completed);

        for _ in 0..5 {
            center.observe(std::slice::from_ref(&t)).await.unwrap();
        }
        assert_eq!(sink.list(tenant, 100).await.unwrap().len(), 1);

        // A reloaded center is seeded from the sink.
        let mut reloaded = NotificationCenter::load(tenant, sink.clone()).await.unwrap();
        assert!(reloaded.observe(&[t]).await.unwrap().is_empty());
        assert_eq!(reloaded.unread_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mark_all_read_only_touches_records_unread_at_invocation() {
        let tenant = TenantId::new();
        let sink = InMemoryNotificationSink::arc();
        let mut center = NotificationCenter::load(tenant, sink.clone()).await.unwrap();
        center
            .observe(&[
                finished(tenant, "a", JobKind::Training, JobStatus::Completed),
                finished(tenant, "b", JobKind::Prediction, JobStatus::Failed),
            ])
            .await
            .unwrap();
        assert_eq!(center.unread_count().await.unwrap(), 2);

        let at = Utc::now();
        assert_eq!(center.mark_all_read(at).await.unwrap(), 2);
        assert_eq!(center.mark_all_read(at).await.unwrap(), 0);

        center
            .observe(&[finished(tenant, "c", JobKind::Training, JobStatus::Canceled)])
            .await
            .unwrap();
        assert_eq!(center.unread_count().await.unwrap(), 1);
        let listed = center.list(10).await.unwrap();
        assert!(listed.iter().filter(|n| n.read_at.is_some()).all(|n| n.read_at == Some(at)));
    }

    #[tokio::test]
    async fn mark_all_read_covers_more_than_one_batch() {
        let tenant = TenantId::new();
        let sink = InMemoryNotificationSink::arc();
        let mut center = NotificationCenter::load(tenant, sink.clone()).await.unwrap();
        let batch: Vec<_> = (0..MARK_READ_BATCH + 10)
            .map(|i| finished(tenant, &format!("job-{i}"), JobKind::Training, JobStatus::Completed))
            .collect();
        center.observe(&batch).await.unwrap();
        assert_eq!(center.unread_count().await.unwrap(), 60);

        assert_eq!(center.mark_all_read(Utc::now()).await.unwrap(), 60);
        assert_eq!(center.unread_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sqlite_sink_keeps_order_read_state_and_dedupe_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobwatch.db");
        let tenant = TenantId::new();

        let sink = Arc::new(SqliteNotificationSink::new(SqliteLocalStore::new(&path)));
        let mut center = NotificationCenter::load(tenant, sink.clone()).await.unwrap();
        let mut older = finished(tenant, "older", JobKind::Training, JobStatus::Completed);
        older.observed_at -= chrono::Duration::minutes(5);
        let newer = finished(tenant, "newer", JobKind::Prediction, JobStatus::Failed);
        center.observe(&[older.clone(), newer]).await.unwrap();

        let listed = sink.list(tenant, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].title, "Prediction failed");
        assert_eq!(listed[0].level, NotificationLevel::Error);
        assert_eq!(listed[1].job_id, older.job_id);
        assert_eq!(sink.list(tenant, 1).await.unwrap().len(), 1);
        assert!(sink.list(TenantId::new(), 10).await.unwrap().is_empty());

        let at = Utc::now();
        assert_eq!(center.mark_all_read(at).await.unwrap(), 2);
        assert_eq!(sink.mark_read(tenant, &[listed[0].id], at).await.unwrap(), 0);
        drop(center);

        let reopened = Arc::new(SqliteNotificationSink::new(SqliteLocalStore::new(&path)));
        let mut center = NotificationCenter::load(tenant, reopened.clone()).await.unwrap();
        assert_eq!(center.unread_count().await.unwrap(), 0);
        assert!(center.observe(&[older]).await.unwrap().is_empty());
        assert_eq!(reopened.list(tenant, 10).await.unwrap().len(), 2);
    }
}
