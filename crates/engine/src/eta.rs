//! Advisory remaining-time estimates for in-flight jobs.
//!
//! Baseline per kind: mean `duration_ms` of the K most recently completed jobs
//! of that kind, falling back to a per-kind default, floored at
//! `min_baseline`. A queued job waits for every in-flight job created before it
//! (strict FIFO), each contributing its own kind's baseline. A processing job
//! has `baseline - elapsed` left, never less than `processing_floor`.
//!
//! Estimates never influence scheduling.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwatch_core::{JobIdentity, JobKind, JobRecord, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtaConfig {
    /// K: completed jobs averaged into the baseline.
    pub sample_size: usize,
    pub min_baseline: Duration,
    pub processing_floor: Duration,
    pub default_training: Duration,
    pub default_prediction: Duration,
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self {
            sample_size: 5,
            min_baseline: Duration::from_secs(30),
            processing_floor: Duration::from_secs(5),
            default_training: Duration::from_secs(4 * 60),
            default_prediction: Duration::from_secs(60),
        }
    }
}

impl EtaConfig {
    pub fn default_for(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Training => self.default_training,
            JobKind::Prediction => self.default_prediction,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EtaEstimator {
    config: EtaConfig,
}

impl EtaEstimator {
    pub fn new(config: EtaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EtaConfig {
        &self.config
    }

    /// Rolling baseline duration for `kind`.
    pub fn baseline(&self, kind: JobKind, records: &[JobRecord]) -> Duration {
        let mut samples: Vec<(DateTime<Utc>, u64)> = records
            .iter()
            .filter(|r| r.kind == kind && r.status == JobStatus::Completed)
            .filter_map(|r| {
                let finished = r.completed_at.unwrap_or(r.created_at);
                r.duration_ms.map(|ms| (finished, ms))
            })
            .collect();

        if samples.is_empty() {
            return self.config.default_for(kind).max(self.config.min_baseline);
        }

        samples.sort_by(|a, b| b.0.cmp(&a.0));
        samples.truncate(self.config.sample_size.max(1));

        let total: u64 = samples.iter().map(|(_, ms)| ms).sum();
        let avg = Duration::from_millis(total / samples.len() as u64);
        avg.max(self.config.min_baseline)
    }

    /// Remaining time for one job; `None` if unknown or already terminal.
    pub fn estimate(
        &self,
        job_id: &JobIdentity,
        records: &[JobRecord],
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let job = records.iter().find(|r| &r.id == job_id)?;
        let baselines = Baselines::compute(self, records);
        self.remaining(job, records, &baselines, now)
    }

    /// Remaining time for every in-flight job.
    pub fn estimate_all(
        &self,
        records: &[JobRecord],
        now: DateTime<Utc>,
    ) -> HashMap<JobIdentity, Duration> {
        let baselines = Baselines::compute(self, records);

        // Walk in-flight jobs in queue order, accumulating the wait.
        let mut in_flight: Vec<&JobRecord> =
            records.iter().filter(|r| r.status.is_in_flight()).collect();
        in_flight.sort_by(|a, b| queue_order(a, b));

        let mut out = HashMap::with_capacity(in_flight.len());
        let mut ahead = Duration::ZERO;
        for job in in_flight {
            let own = baselines.get(job.kind);
            let remaining = match job.status {
                JobStatus::Queued => own + ahead,
                _ => self.processing_remaining(job, own, now),
            };
            out.insert(job.id.clone(), remaining);
            ahead += own;
        }
        out
    }

    fn remaining(
        &self,
        job: &JobRecord,
        records: &[JobRecord],
        baselines: &Baselines,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let own = baselines.get(job.kind);
        match job.status {
            JobStatus::Queued => {
                let ahead: Duration = records
                    .iter()
                    .filter(|r| r.status.is_in_flight() && r.id != job.id)
                    .filter(|r| queue_order(r, job).is_lt())
                    .map(|r| baselines.get(r.kind))
                    .sum();
                Some(own + ahead)
            }
            JobStatus::Processing => Some(self.processing_remaining(job, own, now)),
            _ => None,
        }
    }

    fn processing_remaining(&self, job: &JobRecord, baseline: Duration, now: DateTime<Utc>) -> Duration {
        let elapsed = job
            .started_at
            .and_then(|started| (now - started).to_std().ok())
            .unwrap_or(Duration::ZERO);
        baseline
            .saturating_sub(elapsed)
            .max(self.config.processing_floor)
    }
}

fn queue_order(a: &JobRecord, b: &JobRecord) -> std::cmp::Ordering {
    (a.created_at, &a.id).cmp(&(b.created_at, &b.id))
}

struct Baselines {
    training: Duration,
    prediction: Duration,
}

impl Baselines {
    fn compute(estimator: &EtaEstimator, records: &[JobRecord]) -> Self {
        Self {
            training: estimator.baseline(JobKind::Training, records),
            prediction: estimator.baseline(JobKind::Prediction, records),
        }
    }

    fn get(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Training => self.training,
            JobKind::Prediction => self.prediction,
        }
    }
}

/// Compact human form used in notifications and the CLI (`3m 20s`).
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m {s}s"),
        (h, m, _) => format!("{h}h {m}m"),
    }
}
