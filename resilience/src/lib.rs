//! Resilience primitives for calling unreliable dependencies.
//!
//! Five composable protections, each tracking state per caller-chosen key
//! (one logical dependency per key):
//!
//! - **Circuit breaker**: samples outcomes in a sliding window and fails
//!   fast while a dependency is unhealthy
//! - **Bulkhead**: bounds concurrent executions per dependency with a
//!   bounded wait queue
//! - **Rate limiter**: fixed-window permit budgets with per-endpoint
//!   overrides and per-user partitions
//! - **Timeout guard**: abandons calls that exceed their deadline
//! - **Retry**: classified retries with exponential or linear backoff and
//!   jitter
//!
//! A [`monitor::ResilienceMonitor`] aggregates all of them into a health
//! score and operator recommendations.
//!
//! Primitives never look inside the operations they wrap: an operation is
//! any `async` closure returning `Result<T, E>`, and failures surface
//! unchanged inside [`ResilienceError::Operation`].
//!
//! ## Example
//!
//! ```ignore
//! use resilience_core::{CircuitBreakers, CircuitBreakerConfig};
//!
//! let breakers = CircuitBreakers::new(CircuitBreakerConfig::default());
//!
//! let response = breakers
//!     .execute("payments-api", || async { call_payments().await })
//!     .await?;
//! ```

pub mod bulkhead;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod monitor;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod timeout;

// Re-export commonly used types
pub use bulkhead::{BulkheadStats, Bulkheads};
pub use circuit_breaker::{CircuitBreakers, CircuitHealthInfo, CircuitState};
pub use config::{
    BulkheadConfig, CircuitBreakerConfig, ConfigError, EndpointOverride, RateLimiterConfig,
    ResilienceConfig, RetryConfig, TimeoutConfig,
};
pub use error::ResilienceError;
pub use health::{ComponentHealth, HealthCheckable, HealthStatus};
pub use monitor::{ResilienceHealthEndpoint, ResilienceMonitor, ResilienceReport};
pub use rate_limiter::{AdmissionDecision, RateLimitHealthInfo, RateLimiters};
pub use registry::StateRegistry;
pub use retry::{BackoffShape, Retrier, RetryPolicy, Retryable};
pub use timeout::{TimeoutGuards, TimeoutStats};
