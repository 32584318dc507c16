//! Reconciliation of the optimistic ledger against authoritative snapshots.
//!
//! Two strategies:
//!
//! - **Identity** (default): an entry is retired as soon as a record with its
//!   submission identity appears, in any status. Exact.
//! - **Count-delta** (legacy feeds that cannot carry the identity): when the
//!   counted records grow by `delta`, the `delta` oldest entries are retired.
//!   Best-effort; `delta` is clamped to what is pending and the baseline is
//!   updated on every pass.
//!
//! Reconciliation never fails. Count mismatches are reported as
//! [`ReconciliationDrift`] and heal on the next accurate refresh.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use jobwatch_core::{DomainError, JobIdentity};
use jobwatch_events::FeedSnapshot;

use crate::ledger::{OptimisticEntry, OptimisticLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStrategy {
    #[default]
    Identity,
    CountDelta,
}

impl FromStr for ReconcileStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(Self::Identity),
            "count_delta" | "count-delta" => Ok(Self::CountDelta),
            other => Err(DomainError::validation(format!("unknown reconcile strategy '{other}'"))),
        }
    }
}

/// Which records the count-delta fallback counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountBasis {
    /// Every record in the snapshot.
    #[default]
    Visible,
    /// Only records in a terminal status.
    Terminal,
}

impl CountBasis {
    pub fn count(&self, snapshot: &FeedSnapshot) -> usize {
        match self {
            CountBasis::Visible => snapshot.records.len(),
            CountBasis::Terminal => snapshot.records.iter().filter(|r| r.is_terminal()).count(),
        }
    }
}

impl FromStr for CountBasis {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "visible" => Ok(Self::Visible),
            "terminal" => Ok(Self::Terminal),
            other => Err(DomainError::validation(format!("unknown count basis '{other}'"))),
        }
    }
}

/// Count-delta mismatch between feed growth and pending entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReconciliationDrift {
    /// More new records than pending entries; retirement was clamped.
    Overcount { delta: usize, pending: usize },
    /// The counted records shrank (remote deletion or filtering).
    Undercount { delta: i64 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub retired: Vec<OptimisticEntry>,
    pub drift: Option<ReconciliationDrift>,
    /// The count-delta baseline was established by this pass.
    pub primed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciler {
    strategy: ReconcileStrategy,
    basis: CountBasis,
}

impl Reconciler {
    pub fn new(strategy: ReconcileStrategy, basis: CountBasis) -> Self {
        Self { strategy, basis }
    }

    pub fn strategy(&self) -> ReconcileStrategy {
        self.strategy
    }

    /// Apply one snapshot to the ledger.
    ///
    /// Idempotent: a second pass over an unchanged snapshot retires nothing.
    /// The count baseline is tracked in both modes so switching strategy does
    /// not trigger a spurious mass retirement.
    pub fn reconcile(
        &self,
        ledger: &mut OptimisticLedger,
        snapshot: &FeedSnapshot,
    ) -> ReconcileOutcome {
        let current = self.basis.count(snapshot);
        let previous = ledger.previous_count();

        let outcome = match self.strategy {
            ReconcileStrategy::Identity => {
                let present: HashSet<JobIdentity> =
                    snapshot.records.iter().map(|r| r.id.clone()).collect();
                ReconcileOutcome {
                    retired: ledger.retire_matching(&present),
                    ..ReconcileOutcome::default()
                }
            }
            ReconcileStrategy::CountDelta => count_delta(ledger, previous, current),
        };

        ledger.set_previous_count(current);

        if !outcome.retired.is_empty() {
            tracing::info!(
                tenant_id = %snapshot.tenant_id,
                strategy = ?self.strategy,
                retired = outcome.retired.len(),
                pending = ledger.len(),
                "optimistic entries retired"
            );
        }
        match outcome.drift {
            Some(ReconciliationDrift::Overcount { delta, pending }) if pending > 0 => {
                tracing::warn!(tenant_id = %snapshot.tenant_id, delta, pending, "reconciliation drift: more new records than pending entries");
            }
            Some(drift) => {
                tracing::debug!(tenant_id = %snapshot.tenant_id, ?drift, "reconciliation drift");
            }
            None => {}
        }

        outcome
    }
}

fn count_delta(
    ledger: &mut OptimisticLedger,
    previous: Option<usize>,
    current: usize,
) -> ReconcileOutcome {
    let Some(previous) = previous else {
        return ReconcileOutcome {
            primed: true,
            ..ReconcileOutcome::default()
        };
    };

    let delta = current as i64 - previous as i64;
    if delta < 0 {
        return ReconcileOutcome {
            drift: Some(ReconciliationDrift::Undercount { delta }),
            ..ReconcileOutcome::default()
        };
    }

    let delta = delta as usize;
    let pending = ledger.len();
    let drift = (delta > pending).then_some(ReconciliationDrift::Overcount { delta, pending });

    ReconcileOutcome {
        retired: ledger.retire(delta.min(pending)),
        drift,
        primed: false,
    }
}
