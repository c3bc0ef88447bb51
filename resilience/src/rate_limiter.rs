//! Fixed-window rate limiting with per-endpoint and per-user budgets.
//!
//! Each key owns an independent window of `window_ms` milliseconds and a
//! permit budget for that window. When the window elapses it resets in
//! place on the next acquisition attempt; there is no background sweeper.
//!
//! Limit precedence when resolving a budget:
//!
//! 1. an endpoint override matching the key
//! 2. the per-user limit, when per-user limits are enabled and a user is
//!    supplied (each user gets a private window partitioned under the key)
//! 3. the global `permit_limit`
//!
//! Admission never suspends: [`RateLimiters::try_acquire`] takes a short
//! mutex over one key's counters and returns a decision immediately. A
//! rejected call is rejected for the remainder of the window — permits are
//! a budget, not a queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::RateLimiterConfig;
use crate::error::ResilienceError;
use crate::registry::StateRegistry;

/// Outcome of a permit acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The permits were granted; the caller may proceed.
    Permitted,
    /// The window budget is exhausted.
    Rejected {
        /// Time until the current window rolls over.
        retry_after: Duration,
    },
}

impl AdmissionDecision {
    /// Whether the caller may proceed.
    #[must_use]
    pub const fn is_permitted(&self) -> bool {
        matches!(self, Self::Permitted)
    }
}

/// Point-in-time view of one key's window, for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitHealthInfo {
    /// Key the budget applies to.
    pub key: String,
    /// Permit budget per window.
    pub permit_limit: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// When the current window started.
    pub window_started_at: DateTime<Utc>,
    /// Permits consumed in the current window.
    pub permits_consumed: u32,
    /// Acquisitions permitted since creation.
    pub total_permitted: u64,
    /// Acquisitions rejected since creation.
    pub total_rejected: u64,
    /// Time of the most recent permitted acquisition.
    pub last_permitted_at: Option<DateTime<Utc>>,
    /// Time of the most recent rejection.
    pub last_rejected_at: Option<DateTime<Utc>>,
}

struct WindowState {
    window_started: Instant,
    window_started_at: DateTime<Utc>,
    permits_consumed: u32,
    total_permitted: u64,
    total_rejected: u64,
    last_permitted_at: Option<DateTime<Utc>>,
    last_rejected_at: Option<DateTime<Utc>>,
}

/// One key's fixed window. The limit is resolved once at creation.
struct Window {
    key: String,
    limit: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

impl Window {
    fn new(key: &str, limit: u32, window: Duration) -> Self {
        Self {
            key: key.to_owned(),
            limit,
            window,
            state: Mutex::new(WindowState {
                window_started: Instant::now(),
                window_started_at: Utc::now(),
                permits_consumed: 0,
                total_permitted: 0,
                total_rejected: 0,
                last_permitted_at: None,
                last_rejected_at: None,
            }),
        }
    }

    fn acquire(&self, permits: u32) -> AdmissionDecision {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let elapsed = state.window_started.elapsed();
        if elapsed >= self.window {
            state.window_started = Instant::now();
            state.window_started_at = Utc::now();
            state.permits_consumed = 0;
        }

        if state.permits_consumed.saturating_add(permits) <= self.limit {
            state.permits_consumed += permits;
            state.total_permitted += 1;
            state.last_permitted_at = Some(Utc::now());
            AdmissionDecision::Permitted
        } else {
            state.total_rejected += 1;
            state.last_rejected_at = Some(Utc::now());
            let retry_after = self.window.saturating_sub(state.window_started.elapsed());
            warn!(
                key = %self.key,
                consumed = state.permits_consumed,
                limit = self.limit,
                ?retry_after,
                "rate limit exceeded"
            );
            AdmissionDecision::Rejected { retry_after }
        }
    }

    fn health_info(&self) -> RateLimitHealthInfo {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        RateLimitHealthInfo {
            key: self.key.clone(),
            permit_limit: self.limit,
            window_ms: u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX),
            window_started_at: state.window_started_at,
            permits_consumed: state.permits_consumed,
            total_permitted: state.total_permitted,
            total_rejected: state.total_rejected,
            last_permitted_at: state.last_permitted_at,
            last_rejected_at: state.last_rejected_at,
        }
    }

    /// Fraction of the current window's budget consumed, 0.0–1.0.
    fn utilization(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.window_started.elapsed() >= self.window || self.limit == 0 {
            return 0.0;
        }
        f64::from(state.permits_consumed) / f64::from(self.limit)
    }
}

/// Per-key fixed-window rate limiters.
pub struct RateLimiters {
    config: RateLimiterConfig,
    windows: StateRegistry<Window>,
}

impl RateLimiters {
    /// Create a collection with the given configuration.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: StateRegistry::new(),
        }
    }

    /// Try to consume `permits` from the window for `key`.
    ///
    /// The limit honours endpoint overrides matching `key`, falling back to
    /// the global `permit_limit`.
    pub fn try_acquire(&self, key: &str, permits: u32) -> AdmissionDecision {
        let limit = self.config.resolve_limit(Some(key), None);
        let window = self.config.window();
        self.windows
            .get_or_create(key, || Window::new(key, limit, window))
            .acquire(permits)
    }

    /// Try to consume `permits` from `user`'s budget for `key`.
    ///
    /// When per-user limits are enabled and no endpoint override applies,
    /// each user draws from a private window; one noisy user exhausting
    /// their budget leaves other users unaffected. Otherwise this behaves
    /// exactly like [`Self::try_acquire`].
    pub fn try_acquire_for_user(&self, key: &str, user: &str, permits: u32) -> AdmissionDecision {
        if self.config.endpoint_override(key).is_some() || !self.config.per_user_limits_enabled {
            return self.try_acquire(key, permits);
        }

        let limit = self.config.per_user_limit;
        let window = self.config.window();
        let partition = format!("{key}#{user}");
        self.windows
            .get_or_create(&partition, || Window::new(&partition, limit, window))
            .acquire(permits)
    }

    /// Execute `operation` if one permit is available for `key`.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::RateLimitExceeded`] when the window budget is
    ///   exhausted (the operation is not invoked)
    /// - [`ResilienceError::Operation`] carrying the operation's failure
    pub async fn execute<F, Fut, T, E>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.try_acquire(key, 1) {
            AdmissionDecision::Permitted => {
                operation().await.map_err(ResilienceError::Operation)
            }
            AdmissionDecision::Rejected { retry_after } => {
                Err(ResilienceError::RateLimitExceeded {
                    key: key.to_owned(),
                    retry_after,
                })
            }
        }
    }

    /// Health view for one key (or per-user partition), if a window exists.
    #[must_use]
    pub fn health_info(&self, key: &str) -> Option<RateLimitHealthInfo> {
        self.windows.get(key).map(|w| w.health_info())
    }

    /// Health view for every known window, per-user partitions included.
    #[must_use]
    pub fn all_health_info(&self) -> Vec<RateLimitHealthInfo> {
        self.windows
            .entries()
            .into_iter()
            .map(|(_, w)| w.health_info())
            .collect()
    }

    /// Fraction of `key`'s current window budget consumed, 0.0–1.0.
    #[must_use]
    pub fn utilization(&self, key: &str) -> Option<f64> {
        self.windows.get(key).map(|w| w.utilization())
    }

    /// Configuration shared by every window in this collection.
    #[must_use]
    pub const fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}
