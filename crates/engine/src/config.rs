//! Engine configuration.
//!
//! Every knob has a default matching the observed behaviour of the hosted
//! product; `from_env()` overrides them from `JOBWATCH_*` variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::email::EmailConfig;
use crate::eta::EtaConfig;
use crate::reconcile::{CountBasis, ReconcileStrategy};
use crate::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "JOBWATCH_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between polls of the job store.
    pub poll_interval: Duration,
    pub strategy: ReconcileStrategy,
    /// What the count-delta fallback counts.
    pub count_basis: CountBasis,
    pub eta: EtaConfig,
    /// Provisional rows older than this are flagged stale in the view.
    pub stale_after: Duration,
    /// Retries for the job-store write during submission.
    pub submit_retry: RetryPolicy,
    /// Reconnect spacing while the feed is unavailable.
    pub feed_backoff: RetryPolicy,
    pub api_base_url: Option<String>,
    pub ledger_db_path: Option<PathBuf>,
    /// Completion emails; off unless a recipient is set.
    pub email: EmailConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            strategy: ReconcileStrategy::Identity,
            count_basis: CountBasis::Visible,
            eta: EtaConfig::default(),
            stale_after: Duration::from_secs(10 * 60),
            submit_retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(200),
                Duration::from_secs(5),
            ),
            feed_backoff: RetryPolicy::unbounded(Duration::from_millis(500), Duration::from_secs(60)),
            api_base_url: None,
            ledger_db_path: None,
            email: EmailConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `JOBWATCH_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(ms) = parse_var::<u64>(&get, "POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(strategy) = parse_var::<ReconcileStrategy>(&get, "STRATEGY") {
            cfg.strategy = strategy;
        }
        if let Some(basis) = parse_var::<CountBasis>(&get, "COUNT_BASIS") {
            cfg.count_basis = basis;
        }
        if let Some(k) = parse_var::<usize>(&get, "ETA_SAMPLE_SIZE") {
            cfg.eta.sample_size = k.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&get, "ETA_MIN_BASELINE_MS") {
            cfg.eta.min_baseline = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&get, "ETA_PROCESSING_FLOOR_MS") {
            cfg.eta.processing_floor = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&get, "ETA_DEFAULT_TRAINING_MS") {
            cfg.eta.default_training = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&get, "ETA_DEFAULT_PREDICTION_MS") {
            cfg.eta.default_prediction = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&get, "STALE_AFTER_MS") {
            cfg.stale_after = Duration::from_millis(ms);
        }
        if let Some(url) = get("API_BASE_URL") {
            cfg.api_base_url = Some(url.trim().trim_end_matches('/').to_string());
        }
        if let Some(path) = get("LEDGER_DB_PATH") {
            cfg.ledger_db_path = Some(PathBuf::from(path));
        }
        if let Some(to) = get("NOTIFY_EMAIL") {
            cfg.email.recipient = Some(to.trim().to_string());
        }
        if let Some(url) = get("EMAIL_API_URL") {
            cfg.email.api_url = Some(url.trim().to_string());
        }
        if let Some(sender) = get("EMAIL_SENDER") {
            cfg.email.sender_email = Some(sender.trim().to_string());
        }
        if let Some(name) = get("EMAIL_SENDER_NAME") {
            cfg.email.sender_name = name.trim().to_string();
        }
        if let Some(n) = parse_var::<u32>(&get, "EMAIL_MAX_ATTEMPTS") {
            cfg.email.retry.max_attempts = n.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&get, "EMAIL_POLL_INTERVAL_MS") {
            cfg.email.poll_interval = Duration::from_millis(ms.max(1));
        }

        cfg
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_strategy(mut self, strategy: ReconcileStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_count_basis(mut self, basis: CountBasis) -> Self {
        self.count_basis = basis;
        self
    }

    pub fn with_eta(mut self, eta: EtaConfig) -> Self {
        self.eta = eta;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_submit_retry(mut self, policy: RetryPolicy) -> Self {
        self.submit_retry = policy;
        self
    }

    pub fn with_feed_backoff(mut self, policy: RetryPolicy) -> Self {
        self.feed_backoff = policy;
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn with_ledger_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_db_path = Some(path.into());
        self
    }

    pub fn with_notify_email(mut self, recipient: impl Into<String>) -> Self {
        self.email.recipient = Some(recipient.into());
        self
    }

    pub fn with_email(mut self, email: EmailConfig) -> Self {
        self.email = email;
        self
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let raw = get(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(var = %format!("{ENV_PREFIX}{name}"), value = %raw, error = %err, "ignoring invalid config value");
            None
        }
    }
}
