//! Retry with classification, bounded backoff, and jitter.
//!
//! An operation is attempted up to `max_attempts` times. After a failure
//! the error is classified: only retryable failures earn another attempt,
//! and only after a backoff delay derived from the attempt number.
//!
//! ```text
//! attempt 1 ──fail(retryable)──> sleep(delay_for(1)) ──> attempt 2 ──> ...
//!    │
//!    └──fail(non-retryable)──> error returned, exactly one attempt
//! ```
//!
//! Delays grow exponentially (`base × 2^(attempt−1)`) or linearly
//! (`base × attempt`), capped at `max_delay`, with optional additive jitter
//! of up to 10% so a fleet of callers failing together does not retry in
//! lockstep. Exhaustion re-raises the last failure unchanged.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ResilienceError;

/// Growth curve for backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffShape {
    /// `base × 2^(attempt−1)`, capped at `max_delay`.
    Exponential,
    /// `base × attempt`, capped at `max_delay`.
    Linear,
}

/// Classification seam: whether a failure is worth another attempt.
///
/// Transient faults (timeouts, connection resets, 5xx-style upstream
/// hiccups) are retryable; domain errors (validation, not-found,
/// authorization) are not and must surface on the first attempt.
pub trait Retryable {
    /// Whether another attempt could plausibly succeed.
    fn is_retryable(&self) -> bool;
}

impl<E: Retryable> Retryable for ResilienceError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            // The operation may simply have been slow this once.
            Self::TimeoutExceeded { .. } => true,
            // Rejections mean the protection layer wants backpressure, and
            // cancellation means the caller has moved on.
            Self::ServiceUnavailable { .. }
            | Self::BulkheadRejected { .. }
            | Self::RateLimitExceeded { .. }
            | Self::Cancelled => false,
            Self::Operation(e) => e.is_retryable(),
        }
    }
}

/// Immutable retry policy derived from [`RetryConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth curve for successive delays.
    pub backoff: BackoffShape,
    /// Whether to add up to 10% random jitter to each delay.
    pub use_jitter: bool,
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            backoff: config.backoff,
            use_jitter: config.use_jitter,
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based),
    /// before jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let unclamped = match self.backoff {
            BackoffShape::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffShape::Linear => self.base_delay.saturating_mul(attempt),
        };
        unclamped.min(self.max_delay)
    }

    fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if !self.use_jitter || delay.is_zero() {
            return delay;
        }
        let jitter_cap = delay.as_secs_f64() * 0.1;
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_cap);
        delay + Duration::from_secs_f64(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Drives retry loops; stateless apart from the RNG used for jitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Retrier;

impl Retrier {
    /// Create a retrier.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Attempt `operation` up to `policy.max_attempts` times, using the
    /// error's own [`Retryable`] classification.
    ///
    /// # Errors
    ///
    /// The last failure, unchanged, when attempts are exhausted or the
    /// failure is not retryable.
    pub async fn execute<F, Fut, T, E>(&self, policy: &RetryPolicy, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        self.execute_with_classifier(policy, |e: &E| e.is_retryable(), operation)
            .await
    }

    /// As [`Self::execute`], with a caller-supplied classifier replacing
    /// the error's own [`Retryable`] impl entirely.
    ///
    /// # Errors
    ///
    /// The last failure, unchanged, when attempts are exhausted or
    /// `classify` returns `false`.
    pub async fn execute_with_classifier<F, Fut, T, E, C>(
        &self,
        policy: &RetryPolicy,
        classify: C,
        operation: F,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < max_attempts && classify(&error) => {
                    let delay = policy.jittered_delay_for(attempt);
                    debug!(attempt, ?delay, "attempt failed, backing off before retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, "retries exhausted");
                    }
                    return Err(error);
                }
            }
        }
    }

    /// As [`Self::execute`], honouring an external cancellation signal
    /// during backoff sleeps and while the operation runs.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::Cancelled`] when the token fires
    /// - [`ResilienceError::Operation`] carrying the last failure when
    ///   attempts are exhausted or the failure is not retryable
    pub async fn execute_cancellable<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        token: &CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = tokio::select! {
                () = token.cancelled() => return Err(ResilienceError::Cancelled),
                result = operation() => result,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if attempt < max_attempts && error.is_retryable() => {
                    let delay = policy.jittered_delay_for(attempt);
                    debug!(attempt, ?delay, "attempt failed, backing off before retry");
                    tokio::select! {
                        () = token.cancelled() => return Err(ResilienceError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, "retries exhausted");
                    }
                    return Err(ResilienceError::Operation(error));
                }
            }
        }
    }
}
