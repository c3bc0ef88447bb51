//! Configuration for the resilience primitives.
//!
//! Configuration is an immutable startup input: it is resolved once (from
//! defaults, code, or environment variables) and handed to the primitives,
//! which treat it as read-only for the process lifetime. Keys may share one
//! configuration; the rate limiter additionally resolves per-endpoint and
//! per-user overrides.
//!
//! # Example
//!
//! ```no_run
//! use resilience_core::config::ResilienceConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResilienceConfig::from_env()?;
//! assert!(config.circuit_breaker.failure_threshold > 0.0);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::retry::BackoffShape;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configured value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// An environment variable could not be parsed.
    #[error("failed to parse `{var}`: {message}")]
    Parse {
        /// Name of the offending environment variable.
        var: String,
        /// Parser error message.
        message: String,
    },
}

/// Circuit breaker options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (0.0–1.0) within the sampling window that opens the circuit.
    pub failure_threshold: f64,
    /// Minimum number of samples in the window before the ratio is evaluated.
    pub minimum_throughput: u32,
    /// Length of the sampling window in milliseconds.
    pub sampling_duration_ms: u64,
    /// How long an open circuit stays open before admitting a trial call.
    pub break_duration_ms: u64,
}

impl CircuitBreakerConfig {
    /// Sampling window as a [`Duration`].
    #[must_use]
    pub const fn sampling_duration(&self) -> Duration {
        Duration::from_millis(self.sampling_duration_ms)
    }

    /// Break duration as a [`Duration`].
    #[must_use]
    pub const fn break_duration(&self) -> Duration {
        Duration::from_millis(self.break_duration_ms)
    }

    /// Validate circuit breaker options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.failure_threshold) || self.failure_threshold == 0.0 {
            return Err(ConfigError::Invalid(
                "failure_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }
        if self.minimum_throughput == 0 {
            return Err(ConfigError::Invalid(
                "minimum_throughput must be > 0".to_string(),
            ));
        }
        if self.sampling_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "sampling_duration_ms must be > 0".to_string(),
            ));
        }
        if self.break_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "break_duration_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            minimum_throughput: 10,
            sampling_duration_ms: 30_000,
            break_duration_ms: 30_000,
        }
    }
}

/// Bulkhead options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Maximum number of operations executing concurrently per key.
    pub max_parallelization: usize,
    /// Maximum number of callers allowed to wait for a free slot per key.
    pub max_queued_actions: usize,
}

impl BulkheadConfig {
    /// Validate bulkhead options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallelization == 0 {
            return Err(ConfigError::Invalid(
                "max_parallelization must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_parallelization: 10,
            max_queued_actions: 20,
        }
    }
}

/// Per-endpoint rate-limit override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointOverride {
    /// Endpoint (dependency key) the override applies to.
    pub endpoint: String,
    /// Permit limit replacing the global default for this endpoint.
    pub limit: u32,
}

/// Rate limiter options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Default permits per window.
    pub permit_limit: u32,
    /// Fixed window length in milliseconds.
    pub window_ms: u64,
    /// Whether authenticated users get individual budgets.
    pub per_user_limits_enabled: bool,
    /// Permits per window for each authenticated user, when enabled.
    pub per_user_limit: u32,
    /// Endpoint-specific overrides, taking precedence over all other limits.
    pub endpoint_overrides: Vec<EndpointOverride>,
}

impl RateLimiterConfig {
    /// Window length as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Resolve the effective permit limit for a request.
    ///
    /// Precedence: endpoint-specific override > per-user limit (when
    /// enabled and the request is authenticated) > global default.
    #[must_use]
    pub fn resolve_limit(&self, endpoint: Option<&str>, user: Option<&str>) -> u32 {
        if let Some(endpoint) = endpoint {
            if let Some(over) = self
                .endpoint_overrides
                .iter()
                .find(|o| o.endpoint == endpoint)
            {
                return over.limit;
            }
        }
        if self.per_user_limits_enabled && user.is_some() {
            return self.per_user_limit;
        }
        self.permit_limit
    }

    /// Endpoint override for a key, if one is configured.
    #[must_use]
    pub fn endpoint_override(&self, endpoint: &str) -> Option<u32> {
        self.endpoint_overrides
            .iter()
            .find(|o| o.endpoint == endpoint)
            .map(|o| o.limit)
    }

    /// Validate rate limiter options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.permit_limit == 0 {
            return Err(ConfigError::Invalid("permit_limit must be > 0".to_string()));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::Invalid("window_ms must be > 0".to_string()));
        }
        if self.per_user_limits_enabled && self.per_user_limit == 0 {
            return Err(ConfigError::Invalid(
                "per_user_limit must be > 0 when per-user limits are enabled".to_string(),
            ));
        }
        for over in &self.endpoint_overrides {
            if over.limit == 0 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint override for `{}` must be > 0",
                    over.endpoint
                )));
            }
        }
        Ok(())
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            permit_limit: 100,
            window_ms: 60_000,
            per_user_limits_enabled: false,
            per_user_limit: 20,
            endpoint_overrides: Vec::new(),
        }
    }
}

/// Timeout guard options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Default per-call deadline in milliseconds.
    pub default_deadline_ms: u64,
}

impl TimeoutConfig {
    /// Default deadline as a [`Duration`].
    #[must_use]
    pub const fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    /// Validate timeout options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the deadline is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_deadline_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 10_000,
        }
    }
}

/// Retry engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff shape.
    pub backoff: BackoffShape,
    /// Whether to perturb delays with random jitter.
    pub use_jitter: bool,
}

impl RetryConfig {
    /// Base delay as a [`Duration`].
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum delay as a [`Duration`].
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Validate retry options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".to_string()));
        }
        if self.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("base_delay_ms must be > 0".to_string()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid(
                "max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff: BackoffShape::Exponential,
            use_jitter: true,
        }
    }
}

/// Aggregate configuration for all five primitives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Circuit breaker options.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Bulkhead options.
    pub bulkhead: BulkheadConfig,
    /// Rate limiter options.
    pub rate_limiter: RateLimiterConfig,
    /// Timeout guard options.
    pub timeout: TimeoutConfig,
    /// Retry engine options.
    pub retry: RetryConfig,
}

impl ResilienceConfig {
    /// Load configuration from the environment, starting from defaults.
    ///
    /// Recognized variables: `RESILIENCE_CB_FAILURE_THRESHOLD`,
    /// `RESILIENCE_CB_MINIMUM_THROUGHPUT`, `RESILIENCE_CB_SAMPLING_MS`,
    /// `RESILIENCE_CB_BREAK_MS`, `RESILIENCE_BULKHEAD_MAX_PARALLEL`,
    /// `RESILIENCE_BULKHEAD_MAX_QUEUED`, `RESILIENCE_RATE_PERMIT_LIMIT`,
    /// `RESILIENCE_RATE_WINDOW_MS`, `RESILIENCE_TIMEOUT_DEADLINE_MS`,
    /// `RESILIENCE_RETRY_MAX_ATTEMPTS`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable fails to parse or the resulting
    /// configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = read_var::<f64>("RESILIENCE_CB_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = read_var::<u32>("RESILIENCE_CB_MINIMUM_THROUGHPUT")? {
            config.circuit_breaker.minimum_throughput = v;
        }
        if let Some(v) = read_var::<u64>("RESILIENCE_CB_SAMPLING_MS")? {
            config.circuit_breaker.sampling_duration_ms = v;
        }
        if let Some(v) = read_var::<u64>("RESILIENCE_CB_BREAK_MS")? {
            config.circuit_breaker.break_duration_ms = v;
        }
        if let Some(v) = read_var::<usize>("RESILIENCE_BULKHEAD_MAX_PARALLEL")? {
            config.bulkhead.max_parallelization = v;
        }
        if let Some(v) = read_var::<usize>("RESILIENCE_BULKHEAD_MAX_QUEUED")? {
            config.bulkhead.max_queued_actions = v;
        }
        if let Some(v) = read_var::<u32>("RESILIENCE_RATE_PERMIT_LIMIT")? {
            config.rate_limiter.permit_limit = v;
        }
        if let Some(v) = read_var::<u64>("RESILIENCE_RATE_WINDOW_MS")? {
            config.rate_limiter.window_ms = v;
        }
        if let Some(v) = read_var::<u64>("RESILIENCE_TIMEOUT_DEADLINE_MS")? {
            config.timeout.default_deadline_ms = v;
        }
        if let Some(v) = read_var::<u32>("RESILIENCE_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first section error encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.bulkhead.validate()?;
        self.rate_limiter.validate()?;
        self.timeout.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

fn read_var<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::Parse {
            var: var.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_circuit_breaker_validation() {
        let mut config = CircuitBreakerConfig::default();
        assert!(config.validate().is_ok());

        config.failure_threshold = 0.0;
        assert!(config.validate().is_err());

        config.failure_threshold = 1.5;
        assert!(config.validate().is_err());

        config.failure_threshold = 0.5;
        config.minimum_throughput = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bulkhead_validation() {
        let mut config = BulkheadConfig::default();
        assert!(config.validate().is_ok());

        config.max_parallelization = 0;
        assert!(config.validate().is_err());

        // Zero queued actions is a legal configuration: reject when full.
        config.max_parallelization = 1;
        config.max_queued_actions = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rate_limiter_validation() {
        let mut config = RateLimiterConfig::default();
        assert!(config.validate().is_ok());

        config.per_user_limits_enabled = true;
        config.per_user_limit = 0;
        assert!(config.validate().is_err());

        config.per_user_limit = 10;
        config.endpoint_overrides.push(EndpointOverride {
            endpoint: "payments-api".to_string(),
            limit: 0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_limit_resolution_precedence() {
        let config = RateLimiterConfig {
            permit_limit: 100,
            per_user_limits_enabled: true,
            per_user_limit: 20,
            endpoint_overrides: vec![EndpointOverride {
                endpoint: "payments-api".to_string(),
                limit: 5,
            }],
            ..RateLimiterConfig::default()
        };

        // Endpoint override beats everything, even for authenticated users.
        assert_eq!(config.resolve_limit(Some("payments-api"), Some("alice")), 5);
        // Per-user limit beats the global default.
        assert_eq!(config.resolve_limit(Some("orders-db"), Some("alice")), 20);
        // Global default applies to anonymous traffic on plain endpoints.
        assert_eq!(config.resolve_limit(Some("orders-db"), None), 100);
        assert_eq!(config.resolve_limit(None, None), 100);
    }

    #[test]
    fn test_retry_validation() {
        let mut config = RetryConfig::default();
        assert!(config.validate().is_ok());

        config.max_attempts = 0;
        assert!(config.validate().is_err());

        config.max_attempts = 3;
        config.max_delay_ms = 10;
        config.base_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.sampling_duration(), Duration::from_secs(30));
        assert_eq!(config.break_duration(), Duration::from_secs(30));

        let config = TimeoutConfig::default();
        assert_eq!(config.default_deadline(), Duration::from_secs(10));
    }
}
