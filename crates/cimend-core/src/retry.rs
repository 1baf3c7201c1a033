//! Exponential backoff for transient collaborator failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry budget with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (milliseconds).
    pub base_delay_ms: u64,
    /// Multiplier applied per retry.
    pub factor: u32,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Upper bound on a single delay (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            factor: 2,
            max_attempts: 5,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let multiplier = u64::from(self.factor.max(1)).saturating_pow(exp);
        let ms = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt budget is spent. Returns the last error on failure.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_transient(&err) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_policy_default() {
        let p = BackoffPolicy::default();
        assert_eq!(p.base_delay_ms, 1_000);
        assert_eq!(p.factor, 2);
        assert_eq!(p.max_attempts, 5);
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let p = BackoffPolicy {
            base_delay_ms: 100,
            factor: 2,
            max_attempts: 10,
            max_delay_ms: 500,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(500));
        assert_eq!(p.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_transient(
            &BackoffPolicy::default(),
            "test",
            |_| true,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("flaky".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_transient(
            &BackoffPolicy::default(),
            "test",
            |e: &String| e != "fatal",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
        )
        .await;
        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_respects_attempt_cap() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            max_attempts: 5,
            ..Default::default()
        };
        let result: Result<(), String> = retry_transient(&policy, "test", |_| true, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("timeout".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
