//! Retry with backoff for vendor and backend calls
//!
//! One policy type shared by the speech-to-text connector, speech synthesis,
//! and any other call that talks to a flaky remote. Only errors that
//! [`Error::is_retryable`] classifies as transient are retried.

use std::future::Future;
use std::time::Duration;

use crate::{Error, Result};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `step * retry` (1s, 2s, 3s, ...)
    Linear(Duration),
    /// `min(base * 2^(retry - 1), max)`
    Exponential { base: Duration, max: Duration },
}

/// Retry policy for remote calls
///
/// `max_retries` counts retries after the first attempt, so a policy with
/// `max_retries: 3` makes at most four attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay schedule
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Linear backoff: waits `step * retry` before each retry
    #[must_use]
    pub const fn linear(max_retries: u32, step: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Linear(step),
        }
    }

    /// Exponential backoff capped at `max`
    #[must_use]
    pub const fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Never retry
    #[must_use]
    pub const fn none() -> Self {
        Self::linear(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based)
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Linear(step) => step.saturating_mul(retry),
            Backoff::Exponential { base, max } => base
                .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
                .min(max),
        }
    }
}

/// Determine whether an HTTP status and response body indicate a recoverable error.
///
/// Recoverable errors are worth retrying: rate limits (429), server errors (5xx),
/// and certain transient network-level failures surfaced in the body text.
#[must_use]
pub fn is_recoverable(status: u16, body: &str) -> bool {
    if status == 429 {
        return true;
    }

    if (500..600).contains(&status) {
        return true;
    }

    let lower = body.to_lowercase();
    lower.contains("connection reset") || lower.contains("timed out") || lower.contains("dns error")
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retry budget is exhausted. The closure receives the retry number
/// (0 for the first attempt).
///
/// # Errors
///
/// Returns the last error produced by `op`
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && e.is_retryable() => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    op = label,
                    error = %e,
                    retry = attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis(),
                    "retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a failed `reqwest` send into the crate taxonomy
pub(crate) fn transport_error(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn linear_delays() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
    }

    #[test]
    fn exponential_delays_are_capped() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(500), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(8), Duration::from_secs(5));
    }

    #[test]
    fn recoverable_statuses() {
        assert!(is_recoverable(429, ""));
        assert!(is_recoverable(500, ""));
        assert!(is_recoverable(503, ""));
        assert!(!is_recoverable(400, ""));
        assert!(!is_recoverable(401, ""));
        assert!(!is_recoverable(404, ""));
        assert!(is_recoverable(200, "Connection Reset by peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let counter = Arc::clone(&calls);
        let result = retry(&policy, "test", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Network("flaky".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::linear(3, Duration::from_secs(1));

        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&policy, "test", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Network("down".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&RetryPolicy::default(), "test", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Auth("forbidden".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
