//! Retry executor: wraps one workflow run across up to `max_retries`
//! additional attempts with exponential backoff (§4.10).
//!
//! Only errors classified as transient are retried — a workflow validation
//! error or a fatal node failure is not, since retrying it would just fail
//! again. Classification is substring-based against the error's rendered
//! message, matching the specification's explicit list of retryable
//! signatures.

use std::time::Duration;

use tracing::warn;

use crate::{CoreError, Result};

const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "timeout",
    "rate_limit",
    "rate limit",
    "too many requests",
    "429",
    "500",
    "502",
    "503",
    "504",
    "connection reset",
    "connection refused",
    "eof",
    "overloaded",
    "capacity",
];

/// Whether an error's message matches one of the specification's retryable
/// signatures. `CoreError::RetryableTransient` always counts regardless of
/// message content, since node builders already classify it at the source.
pub fn is_retryable(error: &CoreError) -> bool {
    if matches!(error, CoreError::RetryableTransient(_)) {
        return true;
    }
    let message = error.to_string().to_lowercase();
    RETRYABLE_SUBSTRINGS.iter().any(|s| message.contains(s))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-indexed: the delay before
    /// the first retry is `attempt = 1`), per `min(initial * factor^(n-1),
    /// max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// One attempt's outcome, reported to the history store's retry metadata.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: Option<String>,
}

pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: Vec<AttemptRecord>,
    /// The run id of the attempt immediately before this one, if this
    /// wasn't the first — the specification's `retry_of` linkage.
    pub retry_of: Option<String>,
}

/// Runs `attempt_fn` up to `policy.max_retries + 1` times. `attempt_fn`
/// receives the 0-indexed attempt number and the run id of the previous
/// attempt (`None` on the first). Stops at the first success, the first
/// non-retryable failure, or after exhausting retries.
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    run_id_for_attempt: impl Fn(u32) -> String,
    mut attempt_fn: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32, Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = Vec::new();
    let mut previous_run_id: Option<String> = None;
    let mut retry_of: Option<String> = None;

    for attempt in 0..=policy.max_retries {
        let run_id = run_id_for_attempt(attempt);
        match attempt_fn(attempt, previous_run_id.clone()).await {
            Ok(value) => {
                attempts.push(AttemptRecord { attempt, error: None });
                return RetryOutcome { result: Ok(value), attempts, retry_of };
            }
            Err(err) => {
                let retryable = is_retryable(&err);
                attempts.push(AttemptRecord {
                    attempt,
                    error: Some(err.to_string()),
                });
                if !retryable || attempt == policy.max_retries {
                    return RetryOutcome { result: Err(err), attempts, retry_of };
                }
                warn!(
                    attempt,
                    error = %err,
                    "retryable workflow run failure, backing off before retry"
                );
                retry_of = Some(run_id.clone());
                previous_run_id = Some(run_id);
                tokio::time::sleep(policy.delay_for(attempt + 1)).await;
            }
        }
    }

    unreachable!("loop always returns on the final iteration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classifies_retryable_substrings_case_insensitively() {
        assert!(is_retryable(&CoreError::Other(anyhow::anyhow!("HTTP 503 Service Unavailable"))));
        assert!(is_retryable(&CoreError::Other(anyhow::anyhow!("Connection Reset by peer"))));
        assert!(!is_retryable(&CoreError::Validation("bad model string".into())));
    }

    #[test]
    fn retryable_transient_always_counts() {
        assert!(is_retryable(&CoreError::RetryableTransient("anything".into())));
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn stops_retrying_after_first_success() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
        };
        let calls = AtomicU32::new(0);
        let outcome = execute_with_retry(
            &policy,
            |attempt| format!("run-{attempt}"),
            |attempt, _prev| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(CoreError::RetryableTransient("not ready".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts.len(), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let policy = RetryPolicy::default();
        let outcome: RetryOutcome<()> = execute_with_retry(
            &policy,
            |attempt| format!("run-{attempt}"),
            |_attempt, _prev| async { Err(CoreError::Validation("nope".into())) },
        )
        .await;
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.result.is_err());
    }
}
