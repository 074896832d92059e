//! Busy-retry for store operations.
//!
//! SQLite signals contention with `SQLITE_BUSY` / `SQLITE_LOCKED`; both are
//! transient under WAL. Store calls run through [`with_retry`], which backs
//! off exponentially with jitter and only surfaces the error once the
//! attempt budget is exhausted.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff parameters for [`with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Symmetric jitter fraction applied to each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            factor: 2.0,
            max_delay: Duration::from_secs(2),
            max_attempts: 5,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// The jittered delay preceding `attempt` (1-based; attempt 1 has none).
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.factor.powi(attempt as i32 - 1);
        let capped = base.min(self.max_delay.as_millis() as f64);
        // fastrand::f64() is uniform in [0, 1); map to [-jitter, +jitter].
        let spread = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
        Duration::from_millis((capped * (1.0 + spread)).max(0.0) as u64)
    }
}

/// Runs `op`, retrying recoverable store errors per `policy`.
///
/// Only busy/locked/transaction-failed store errors are retried; anything
/// else — including fatal store errors — surfaces immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "store contention, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if retryable(&e) {
                    warn!(op = op_name, attempts = attempt, error = %e, "retry budget exhausted");
                }
                return Err(e);
            }
        }
    }
}

fn retryable(e: &Error) -> bool {
    matches!(e, Error::Store(_)) && e.recoverable()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);

        let result: Result<&str> = with_retry(&RetryPolicy::default(), "insert", move || {
            let a = Arc::clone(&a);
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(StoreError::Busy("SQLITE_BUSY".into()).into())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);

        let result: Result<()> = with_retry(&RetryPolicy::default(), "open", move || {
            let a = Arc::clone(&a);
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::ConnectionFailed("no such file".into()).into())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempt_budget() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);

        let result: Result<()> = with_retry(&policy, "update", move || {
            let a = Arc::clone(&a);
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Locked("SQLITE_LOCKED".into()).into())
            }
        })
        .await;

        assert_eq!(result.unwrap_err().code(), "store.locked");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
        // beyond the cap
        assert_eq!(policy.delay_for(10), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_for(1).as_millis() as f64;
            assert!((37.0..=63.0).contains(&d), "jittered delay {d} out of band");
        }
    }
}
