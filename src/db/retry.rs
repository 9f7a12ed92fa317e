//! Retry with exponential backoff for the initial connectivity probe.
//!
//! The first delay is `base_delay`; every following delay doubles, capped at
//! `max_delay`. After `max_attempts` failed attempts the operation gives up
//! with [`DbError::ConnectionUnavailable`].

use crate::error::{DbError, DbResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        use crate::config::{
            DEFAULT_CONNECT_RETRIES, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS,
        };
        Self {
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            max_attempts: DEFAULT_CONNECT_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            ..Self::default()
        }
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max_attempts == 0 {
            return Err(DbError::configuration(
                "retry max_attempts must be greater than 0",
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(DbError::configuration(format!(
                "retry max_delay ({:?}) is below base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        Ok(())
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn total_delay_budget(&self) -> Duration {
        let mut state = RetryState::new(self);
        while state.next_delay().is_some() {}
        state.elapsed_delay
    }
}

/// Progress through one retry sequence. Dropped once the operation succeeds
/// or attempts run out.
#[derive(Debug)]
pub struct RetryState<'p> {
    policy: &'p RetryPolicy,
    /// Attempts made so far.
    pub attempt: u32,
    /// Sum of all delays handed out so far.
    pub elapsed_delay: Duration,
    /// Doubles after every delay.
    pub multiplier: u32,
}

impl<'p> RetryState<'p> {
    pub fn new(policy: &'p RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 1,
            elapsed_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self
            .policy
            .base_delay
            .saturating_mul(self.multiplier)
            .min(self.policy.max_delay);
        self.attempt += 1;
        self.multiplier = self.multiplier.saturating_mul(2);
        self.elapsed_delay += delay;
        Some(delay)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// Configuration errors are not retried; no number of attempts fixes them.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut state = RetryState::new(policy);
    loop {
        match op().await {
            Ok(value) => {
                if state.attempt > 1 {
                    debug!(
                        operation,
                        attempts = state.attempt,
                        "Succeeded after retrying"
                    );
                }
                return Ok(value);
            }
            Err(e @ DbError::Configuration { .. }) => return Err(e),
            Err(e) => match state.next_delay() {
                Some(delay) => {
                    warn!(
                        operation,
                        attempt = state.attempt - 1,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        operation,
                        attempts = state.attempt,
                        error = %e,
                        "Giving up after exhausting retries"
                    );
                    return Err(DbError::connection_unavailable(state.attempt, e.to_string()));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(base_ms: u64, attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(base_ms), attempts)
            .max_delay(Duration::from_secs(60))
    }

    #[test]
    fn test_delays_double() {
        let policy = policy(100, 5);
        let mut state = RetryState::new(&policy);
        let delays: Vec<_> = std::iter::from_fn(|| state.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn test_delays_capped() {
        let policy = RetryPolicy::new(Duration::from_millis(100), 6)
            .max_delay(Duration::from_millis(300));
        let mut state = RetryState::new(&policy);
        let delays: Vec<_> = std::iter::from_fn(|| state.next_delay()).collect();
        assert_eq!(delays.last(), Some(&Duration::from_millis(300)));
        assert_eq!(state.elapsed_delay, Duration::from_millis(100 + 200 + 300 * 3));
    }

    #[test]
    fn test_total_delay_budget() {
        assert_eq!(
            policy(10, 3).total_delay_budget(),
            Duration::from_millis(10 + 20)
        );
        assert_eq!(policy(10, 1).total_delay_budget(), Duration::ZERO);
    }

    #[test]
    fn test_validate() {
        assert!(policy(10, 0).validate().is_err());
        let inverted = RetryPolicy::new(Duration::from_secs(2), 3).max_delay(Duration::from_secs(1));
        assert!(inverted.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_with_backoff(&policy(10, 5), "probe", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DbError::connection("refused", "start the server"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: DbResult<()> = retry_with_backoff(&policy(10, 3), "probe", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(DbError::connection("refused", "start the server"))
        })
        .await;
        match result {
            Err(DbError::ConnectionUnavailable { attempts, message }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("refused"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: DbResult<()> = retry_with_backoff(&policy(10, 5), "probe", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(DbError::configuration("bad url"))
        })
        .await;
        assert!(matches!(result, Err(DbError::Configuration { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
