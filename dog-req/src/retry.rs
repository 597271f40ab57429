//! Uniform retry wrapper for store operations.
//!
//! Only `ReqError::Transient` is retried. Every attempt and every backoff
//! sleep races the caller's cancellation token, so a cancelled caller gets
//! `ReqError::Canceled` without waiting out the remaining attempts.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{QueueCtx, ReqError, ReqResult};

/// How transient store failures are retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts per operation, the first one included
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubled for each one after
    pub base_backoff: Duration,
    /// Upper bound for a single backoff
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Delay after the given (1-based) failed attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts or
/// the context is cancelled.
pub(crate) async fn retry<T, F, Fut>(
    ctx: &QueueCtx,
    policy: &RetryPolicy,
    name: &'static str,
    mut op: F,
) -> ReqResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReqResult<T>>,
{
    let mut attempt = 0;
    loop {
        if ctx.is_cancelled() {
            return Err(ReqError::Canceled);
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ReqError::Canceled),
            result = op() => result,
        };

        let message = match result {
            Err(ReqError::Transient(message)) => message,
            other => return other,
        };

        if attempt >= policy.max_attempts {
            warn!(op = name, attempt, error = %message, "store operation failed, giving up");
            return Err(ReqError::RetriesExhausted {
                op: name,
                attempts: attempt,
                message,
            });
        }

        let backoff = policy.backoff_for(attempt);
        debug!(op = name, attempt, ?backoff, error = %message, "transient store failure, retrying");

        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ReqError::Canceled),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_backoff(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::new(10).with_backoff(Duration::from_millis(10), Duration::from_millis(50));

        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(50));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = QueueCtx::new();

        let result = retry(&ctx, &fast_policy(5), "test", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ReqError::Transient("flaky".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausting_attempts_surfaces_fatal_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = QueueCtx::new();

        let result: ReqResult<()> = retry(&ctx, &fast_policy(3), "SET", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReqError::Transient("down".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(ReqError::RetriesExhausted { op: "SET", attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_and_not_found_are_not_retried() {
        for err in [
            ReqError::Decode("bad".to_string()),
            ReqError::not_found("x"),
            ReqError::locked("l"),
        ] {
            let calls = Arc::new(AtomicU32::new(0));
            let ctx = QueueCtx::new();
            let expected = err.clone();

            let result: ReqResult<()> = retry(&ctx, &fast_policy(5), "op", || {
                let calls = calls.clone();
                let err = err.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(err)
                }
            })
            .await;

            assert_eq!(result, Err(expected));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_remaining_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = QueueCtx::new();
        let policy = RetryPolicy::new(100).with_backoff(Duration::from_secs(5), Duration::from_secs(5));

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result: ReqResult<()> = retry(&ctx, &policy, "op", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReqError::Transient("down".to_string()))
            }
        })
        .await;

        assert_eq!(result, Err(ReqError::Canceled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_already_cancelled_context_never_calls_op() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = QueueCtx::new();
        ctx.cancel();

        let result: ReqResult<()> = retry(&ctx, &fast_policy(5), "op", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(result, Err(ReqError::Canceled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
