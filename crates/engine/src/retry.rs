//! Retry and backoff policies.
//!
//! Used for two things: retrying the job-store write during submission (same
//! identity every attempt) and spacing out feed reconnects while the remote
//! feed is unavailable.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * 2^(attempt - 1)`, capped.
    #[default]
    Exponential,
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first; 1 means never retry.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(200), Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Reconnect spacing for a loop that never gives up.
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self::exponential(u32::MAX, base_delay, max_delay)
    }

    /// Wait after failed attempt number `attempt` (1-indexed; 0 waits nothing).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(doublings) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(doublings.min(31)).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Run `op` until it succeeds, the error is not transient, or attempts run out.
    ///
    /// `op` receives the 1-indexed attempt number.
    pub async fn retry<T, E, F, Fut>(
        &self,
        mut op: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delays_double_and_cap() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(500), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(60));
    }

    #[test]
    fn fixed_delay_ignores_attempt() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(250));
        assert!(fixed.should_retry(2));
        assert!(!fixed.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(5, Duration::from_millis(10), Duration::from_millis(50));

        let result: Result<(), &str> = policy
            .retry(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("rejected") }
                },
                |e| *e != "rejected",
            )
            .await;

        assert_eq!(result, Err("rejected"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_errors() {
        let policy = RetryPolicy::default();

        let result: Result<u32, &str> = policy
            .retry(
                |attempt| async move { if attempt < 3 { Err("busy") } else { Ok(attempt) } },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(3));
    }
}
