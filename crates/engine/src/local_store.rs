//! Durable client-local key/value state.
//!
//! Holds the optimistic ledger across restarts. Values are opaque strings
//! scoped by tenant; the SQLite implementation keeps them in one table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use jobwatch_core::TenantId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocalStoreError {
    #[error("local storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for LocalStoreError {
    fn from(err: anyhow::Error) -> Self {
        LocalStoreError::Storage(format!("{err:#}"))
    }
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, tenant_id: TenantId, key: &str) -> Result<Option<String>, LocalStoreError>;

    async fn put(&self, tenant_id: TenantId, key: &str, value: &str) -> Result<(), LocalStoreError>;

    async fn remove(&self, tenant_id: TenantId, key: &str) -> Result<(), LocalStoreError>;
}

/// Process-lifetime store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLocalStore {
    values: RwLock<HashMap<(TenantId, String), String>>,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn get(&self, tenant_id: TenantId, key: &str) -> Result<Option<String>, LocalStoreError> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(&(tenant_id, key.to_string())).cloned())
    }

    async fn put(&self, tenant_id: TenantId, key: &str, value: &str) -> Result<(), LocalStoreError> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert((tenant_id, key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove(&self, tenant_id: TenantId, key: &str) -> Result<(), LocalStoreError> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.remove(&(tenant_id, key.to_string()));
        Ok(())
    }
}

/// SQLite-backed local state.
///
/// The database is opened (and the table created) lazily on first use. Cheap
/// to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteLocalStore {
    path: PathBuf,
    pool: Arc<tokio::sync::Mutex<Option<SqlitePool>>>,
}

impl SqliteLocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub(crate) async fn pool(&self) -> anyhow::Result<SqlitePool> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create local state directory at {parent:?}"))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", self.path.to_string_lossy());
        let pool = SqlitePool::connect(&db_url)
            .await
            .with_context(|| format!("failed to open local state DB at {:?}", self.path))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_state (
                tenant_id   TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (tenant_id, key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create local_state table")?;

        *guard = Some(pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn get(&self, tenant_id: TenantId, key: &str) -> Result<Option<String>, LocalStoreError> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT value FROM local_state WHERE tenant_id = ?1 AND key = ?2")
            .bind(tenant_id.to_string())
            .bind(key)
            .fetch_optional(&pool)
            .await
            .context("failed to read local state")?;

        match row {
            Some(row) => Ok(Some(
                row.try_get::<String, _>("value")
                    .context("failed to decode local state value")?,
            )),
            None => Ok(None),
        }
    }

    async fn put(&self, tenant_id: TenantId, key: &str, value: &str) -> Result<(), LocalStoreError> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO local_state (tenant_id, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (tenant_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .context("failed to write local state")?;
        Ok(())
    }

    async fn remove(&self, tenant_id: TenantId, key: &str) -> Result<(), LocalStoreError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM local_state WHERE tenant_id = ?1 AND key = ?2")
            .bind(tenant_id.to_string())
            .bind(key)
            .execute(&pool)
            .await
            .context("failed to delete local state")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobwatch.db");
        let tenant = TenantId::new();

        let store = SqliteLocalStore::new(&path);
        assert_eq!(store.get(tenant, "k").await.unwrap(), None);
        store.put(tenant, "k", "v1").await.unwrap();
        store.put(tenant, "k", "v2").await.unwrap();

        let reopened = SqliteLocalStore::new(&path);
        assert_eq!(reopened.get(tenant, "k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(reopened.get(TenantId::new(), "k").await.unwrap(), None);

        reopened.remove(tenant, "k").await.unwrap();
        assert_eq!(store.get(tenant, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn in_memory_store_is_tenant_scoped() {
        let store = InMemoryLocalStore::new();
        let a = TenantId::new();
        store.put(a, "k", "v").await.unwrap();
        assert_eq!(store.get(a, "k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.get(TenantId::new(), "k").await.unwrap(), None);
    }
}
