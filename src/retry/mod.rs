//! Error classification and retry policy.
//!
//! - [`ErrorClassifier`] turns an error message (plus an optional explicit
//!   hint from the processor) into an [`ErrorClassification`].
//! - [`calculate_backoff`] computes the delay before attempt `n` under a
//!   [`RetryPolicy`].
//! - [`with_retry`] re-runs a fallible async operation in-process, used by
//!   processors around individual infrastructure calls.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryPolicy;

pub mod classifier;

pub use classifier::{ErrorCategory, ErrorClassification, ErrorClassifier, ErrorSeverity};

/// Delay before `attempt` (1-based) without jitter:
/// `min(base * multiplier^(attempt-1), max)`.
pub fn base_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let raw = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
    let capped = raw.min(policy.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Delay before `attempt` (1-based).
///
/// With jitter enabled the capped delay is scaled by a uniform factor in
/// [0.5, 1.0], so the result never exceeds `max_delay_ms`.
pub fn calculate_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = base_backoff(policy, attempt);
    if policy.jitter {
        delay.mul_f64(0.5 + fastrand::f64() * 0.5)
    } else {
        delay
    }
}

/// Run `operation` until it succeeds, a non-retryable error occurs, or
/// `policy.max_attempts` is spent.
///
/// Retryability comes from classifying each error message; `category` only
/// labels the operation in log records.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    category: ErrorCategory,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let classifier = ErrorClassifier::new();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, %category, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                let message = error.to_string();
                let classification = classifier.classify(&message, None);
                if !classification.retryable || attempt >= max_attempts {
                    tracing::debug!(
                        attempt,
                        max_attempts,
                        category = %classification.category,
                        "giving up on operation: {}",
                        message
                    );
                    return Err(error);
                }

                let delay = calculate_backoff(policy, attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    %category,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying: {}",
                    message
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
