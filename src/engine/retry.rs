//! Bounded retry with exponential backoff for flaky engine calls.
//!
//! The engine API races with itself under load ("container already
//! stopping", transient 500s from the daemon). The operations most prone to
//! those races (start, stop, kill, remove) run through [`RetryPolicy`],
//! an explicit higher-order wrapper rather than an implicit decorator so the
//! policy stays visible and testable in isolation.

use crate::engine::{EngineError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const RETRY_COUNT_VAR: &str = "CONVOY_API_RETRY_COUNT";
const RETRY_MULTIPLIER_VAR: &str = "CONVOY_API_RETRY_MULTIPLIER";

const DEFAULT_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Retry policy for transient engine failures.
///
/// Retries only errors classified transient by
/// [`EngineError::is_transient`], sleeping `base_delay * 2^(attempt - 1)`
/// between attempts. Exhausting the attempt budget surfaces the final
/// underlying error unchanged in kind.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Build a policy from `CONVOY_API_RETRY_COUNT` and
    /// `CONVOY_API_RETRY_MULTIPLIER` (base delay in milliseconds), falling
    /// back to 5 attempts / 500ms.
    pub fn from_env() -> Self {
        let attempts = std::env::var(RETRY_COUNT_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ATTEMPTS);
        let base_ms = std::env::var(RETRY_MULTIPLIER_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BASE_DELAY_MS);
        Self::new(attempts, Duration::from_millis(base_ms))
    }

    /// Run `op`, retrying transient failures up to the attempt budget.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient engine error, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1).min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = quick_policy(5)
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::Api("daemon busy".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_final_error_after_exhaustion() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = quick_policy(3)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Api("still busy".into())) }
            })
            .await;
        assert!(matches!(result, Err(EngineError::Api(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = quick_policy(5)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::NotFound("deadbeef".into())) }
            })
            .await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
    }
}
