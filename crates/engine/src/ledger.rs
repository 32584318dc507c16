//! Optimistic ledger: provisional entries for submitted jobs whose
//! authoritative record has not been observed yet.
//!
//! Entries are kept oldest first internally and listed newest first. They are
//! only ever removed by reconciliation. The count-delta baseline lives next to
//! the entries so both survive a restart together.
//!
//! Mutations are in-memory; [`OptimisticLedger::persist`] writes the whole
//! state through to the [`LocalStore`] under [`LEDGER_KEY`].

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwatch_core::{JobIdentity, JobKind, TempId, TenantId};

use crate::local_store::{LocalStore, LocalStoreError};

/// Fixed storage key of the serialized ledger.
pub const LEDGER_KEY: &str = "optimistic-ledger";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticEntry {
    pub temp_id: TempId,
    /// Submission identity; absent on entries written before identities were
    /// threaded through.
    #[serde(default)]
    pub identity: Option<JobIdentity>,
    pub kind: JobKind,
    pub label: String,
    pub created_at_client: DateTime<Utc>,
}

impl OptimisticEntry {
    pub fn new(
        identity: JobIdentity,
        kind: JobKind,
        label: impl Into<String>,
        created_at_client: DateTime<Utc>,
    ) -> Self {
        Self {
            temp_id: TempId::new(),
            identity: Some(identity),
            kind,
            label: label.into(),
            created_at_client,
        }
    }

    /// An entry without a submission identity.
    pub fn anonymous(kind: JobKind, label: impl Into<String>, created_at_client: DateTime<Utc>) -> Self {
        Self {
            temp_id: TempId::new(),
            identity: None,
            kind,
            label: label.into(),
            created_at_client,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.identity.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LedgerState {
    /// Oldest first.
    entries: VecDeque<OptimisticEntry>,
    #[serde(default)]
    previous_count: Option<usize>,
}

/// Stored shapes: the current object, or a bare entry array from older clients.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredLedger {
    Current(LedgerState),
    Legacy(Vec<OptimisticEntry>),
}

pub struct OptimisticLedger {
    tenant_id: TenantId,
    store: Arc<dyn LocalStore>,
    state: LedgerState,
    dirty: bool,
}

impl std::fmt::Debug for OptimisticLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticLedger")
            .field("tenant_id", &self.tenant_id)
            .field("state", &self.state)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl OptimisticLedger {
    /// Load the tenant's ledger; an unreadable value starts an empty ledger.
    pub async fn load(tenant_id: TenantId, store: Arc<dyn LocalStore>) -> Result<Self, LocalStoreError> {
        let state = match store.get(tenant_id, LEDGER_KEY).await? {
            None => LedgerState::default(),
            Some(raw) => match serde_json::from_str::<StoredLedger>(&raw) {
                Ok(StoredLedger::Current(state)) => state,
                Ok(StoredLedger::Legacy(entries)) => LedgerState {
                    entries: entries.into(),
                    previous_count: None,
                },
                Err(err) => {
                    tracing::warn!(tenant_id = %tenant_id, error = %err, "discarding unreadable optimistic ledger");
                    LedgerState::default()
                }
            },
        };

        tracing::debug!(tenant_id = %tenant_id, pending = state.entries.len(), "optimistic ledger loaded");

        Ok(Self {
            tenant_id,
            store,
            state,
            dirty: false,
        })
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn append(&mut self, entry: OptimisticEntry) {
        self.state.entries.push_back(entry);
        self.dirty = true;
    }

    /// Entries, most recent first.
    pub fn list(&self) -> Vec<&OptimisticEntry> {
        self.state.entries.iter().rev().collect()
    }

    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }

    pub fn contains_identity(&self, identity: &JobIdentity) -> bool {
        self.state
            .entries
            .iter()
            .any(|e| e.identity.as_ref() == Some(identity))
    }

    pub fn pending_identities(&self) -> HashSet<JobIdentity> {
        self.state
            .entries
            .iter()
            .filter_map(|e| e.identity.clone())
            .collect()
    }

    /// Remove the `n` oldest entries (clamped to what is pending).
    pub fn retire(&mut self, n: usize) -> Vec<OptimisticEntry> {
        let n = n.min(self.state.entries.len());
        if n > 0 {
            self.dirty = true;
        }
        self.state.entries.drain(..n).collect()
    }

    /// Remove every entry whose identity is in `present`.
    pub fn retire_matching(&mut self, present: &HashSet<JobIdentity>) -> Vec<OptimisticEntry> {
        let (retired, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.state.entries)
            .into_iter()
            .partition(|e| e.identity.as_ref().is_some_and(|id| present.contains(id)));
        self.state.entries = kept;
        if !retired.is_empty() {
            self.dirty = true;
        }
        retired.into()
    }

    /// Count-delta baseline (`None` until the first observation).
    pub fn previous_count(&self) -> Option<usize> {
        self.state.previous_count
    }

    pub fn set_previous_count(&mut self, count: usize) {
        if self.state.previous_count != Some(count) {
            self.state.previous_count = Some(count);
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the state through if anything changed since the last write.
    pub async fn persist(&mut self) -> Result<(), LocalStoreError> {
        if !self.dirty {
            return Ok(());
        }
        let raw = serde_json::to_string(&self.state)
            .map_err(|e| LocalStoreError::Storage(format!("failed to encode ledger: {e}")))?;
        self.store.put(self.tenant_id, LEDGER_KEY, &raw).await?;
        self.dirty = false;
        Ok(())
    }
}
