//! Result records produced by completed jobs.
//!
//! Unlike job records these are user-mutable (label) and user-deletable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobIdentity, TenantId};

/// Per-entity prediction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPrediction {
    pub entity_id: String,
    pub segment: u32,
    pub churn_probability: f64,
    pub ltv_estimate: f64,
    pub recommended_action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: JobIdentity,
    pub tenant_id: TenantId,
    pub label: String,
    /// Training metrics (accuracy, f1, business cost, ...).
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub predictions: Vec<EntityPrediction>,
    pub created_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(
        job_id: JobIdentity,
        tenant_id: TenantId,
        label: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            tenant_id,
            label: label.into(),
            metrics: BTreeMap::new(),
            predictions: Vec::new(),
            created_at,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_predictions(mut self, predictions: Vec<EntityPrediction>) -> Self {
        self.predictions = predictions;
        self
    }

    /// Rename the result. Labels are trimmed and must not be blank.
    pub fn relabel(&mut self, label: &str) -> DomainResult<()> {
        let label = label.trim();
        if label.is_empty() {
            return Err(DomainError::validation("result label must not be blank"));
        }
        self.label = label.to_string();
        Ok(())
    }
}
