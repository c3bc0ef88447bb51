//! Error taxonomy for the resilience primitives.
//!
//! Every primitive returns `Result<T, ResilienceError<E>>` where `E` is the
//! operation's own error type. The primitives never transform `E`: an
//! operation failure is carried unchanged in [`ResilienceError::Operation`].
//! The remaining variants are rejection signals for calls where the
//! operation was never invoked (or, for timeouts, was abandoned).

use std::time::Duration;
use thiserror::Error;

/// Outcome signals added by the resilience primitives.
///
/// `E` is the protected operation's error type and is propagated without
/// wrapping or conversion — callers always see their original error.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// Circuit breaker is `Open` or `Isolated`; the operation was not attempted.
    #[error("service `{key}` unavailable: circuit is open")]
    ServiceUnavailable {
        /// Key of the protected dependency.
        key: String,
    },

    /// Bulkhead concurrency and queue capacity are exhausted; the operation
    /// was not attempted.
    #[error("bulkhead rejected call to `{key}`: concurrency and queue capacity exhausted")]
    BulkheadRejected {
        /// Key of the protected dependency.
        key: String,
    },

    /// Rate limiter window budget is exhausted; the operation was not
    /// attempted. Carries a retry-after hint (remaining window).
    #[error("rate limit exceeded for `{key}`: retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Key of the protected dependency.
        key: String,
        /// Time until the current window rolls over.
        retry_after: Duration,
    },

    /// The operation exceeded its deadline and was abandoned.
    #[error("call to `{key}` exceeded deadline of {deadline:?}")]
    TimeoutExceeded {
        /// Key of the protected dependency.
        key: String,
        /// The deadline that was exceeded.
        deadline: Duration,
    },

    /// The caller's cancellation signal fired while the call was suspended
    /// (queued, backing off, or inside the operation).
    #[error("operation cancelled")]
    Cancelled,

    /// The operation ran and failed; the original error is carried unchanged.
    #[error("operation failed: {0}")]
    Operation(E),
}

impl<E> ResilienceError<E> {
    /// Whether this is a fail-fast rejection — the operation was never invoked.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. }
                | Self::BulkheadRejected { .. }
                | Self::RateLimitExceeded { .. }
        )
    }

    /// Whether the call unwound due to caller-side cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Extract the underlying operation error, if the operation actually ran
    /// and failed.
    #[must_use]
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Key of the dependency this signal relates to, when one applies.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::ServiceUnavailable { key }
            | Self::BulkheadRejected { key }
            | Self::RateLimitExceeded { key, .. }
            | Self::TimeoutExceeded { key, .. } => Some(key),
            Self::Cancelled | Self::Operation(_) => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        let err: ResilienceError<String> = ResilienceError::ServiceUnavailable {
            key: "payments-api".to_string(),
        };
        assert!(err.is_rejection());

        let err: ResilienceError<String> = ResilienceError::BulkheadRejected {
            key: "orders-db".to_string(),
        };
        assert!(err.is_rejection());

        let err: ResilienceError<String> = ResilienceError::RateLimitExceeded {
            key: "search".to_string(),
            retry_after: Duration::from_millis(250),
        };
        assert!(err.is_rejection());

        // Timeouts attempted the operation, so they are not rejections.
        let err: ResilienceError<String> = ResilienceError::TimeoutExceeded {
            key: "search".to_string(),
            deadline: Duration::from_secs(1),
        };
        assert!(!err.is_rejection());

        let err: ResilienceError<String> = ResilienceError::Operation("boom".to_string());
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_into_operation_error_preserves_original() {
        let err: ResilienceError<String> = ResilienceError::Operation("boom".to_string());
        assert_eq!(err.into_operation_error().unwrap(), "boom");

        let err: ResilienceError<String> = ResilienceError::Cancelled;
        assert!(err.into_operation_error().is_none());
    }

    #[test]
    fn test_key_accessor() {
        let err: ResilienceError<String> = ResilienceError::BulkheadRejected {
            key: "orders-db".to_string(),
        };
        assert_eq!(err.key(), Some("orders-db"));

        let err: ResilienceError<String> = ResilienceError::Cancelled;
        assert!(err.key().is_none());
    }

    #[test]
    fn test_display_carries_key_and_hint() {
        let err: ResilienceError<String> = ResilienceError::RateLimitExceeded {
            key: "search".to_string(),
            retry_after: Duration::from_millis(500),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("search"));
        assert!(rendered.contains("retry after"));
    }
}
