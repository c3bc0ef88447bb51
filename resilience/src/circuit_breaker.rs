//! Circuit breaker: per-key failure-ratio state machine.
//!
//! Fails fast once a dependency is unhealthy, then probes for recovery.
//!
//! # States
//!
//! ```text
//! Closed ──[window ratio >= threshold, >= minimum throughput]──> Open
//!    ▲                                                             │
//!    │                                             [break duration elapsed]
//!    │                                                             ▼
//!    └────────────[trial succeeds]──────────── HalfOpen ──[trial fails]──> Open
//!
//! Isolated: manually forced open; only a manual close()/reset() clears it.
//! ```
//!
//! Trip evaluation samples outcomes inside a tumbling window of
//! `sampling_duration`: the circuit opens only once the window holds at
//! least `minimum_throughput` samples and the failure ratio meets the
//! threshold. The window counters reset wholesale when the window ages
//! out, so samples from an expired window never carry into the next one;
//! compared to a bucketed sliding window this can delay a trip by at most
//! one window at the boundary. While `HalfOpen`, exactly one trial call is
//! admitted; further calls fail fast until the trial resolves.
//!
//! # Usage
//!
//! ```ignore
//! let breakers = CircuitBreakers::new(CircuitBreakerConfig::default());
//!
//! let result = breakers
//!     .execute("payments-api", || async { charge_card().await })
//!     .await;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::ResilienceError;
use crate::registry::StateRegistry;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation; outcomes are sampled.
    Closed,
    /// Failing fast; calls are rejected without invoking the operation.
    Open,
    /// Probing recovery; exactly one trial call is admitted.
    HalfOpen,
    /// Manually forced open; sampled outcomes are ignored until a manual close.
    Isolated,
}

impl CircuitState {
    /// Whether calls may be admitted in this state.
    #[must_use]
    pub const fn allows_requests(&self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

/// Point-in-time health snapshot for one key's circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitHealthInfo {
    /// Key of the protected dependency.
    pub key: String,
    /// Current state.
    pub state: CircuitState,
    /// When the circuit entered the current state.
    pub state_changed_at: DateTime<Utc>,
    /// Cumulative requests that ran (successes + failures).
    pub total_requests: u64,
    /// Cumulative successful requests.
    pub successful_requests: u64,
    /// Cumulative failed requests.
    pub failed_requests: u64,
    /// `failed / total`, 0.0 when no requests have run.
    pub failure_rate: f64,
    /// Time of the most recent success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Time of the most recent failure.
    pub last_failure_at: Option<DateTime<Utc>>,
}

struct CircuitInner {
    state: CircuitState,
    state_changed_at: DateTime<Utc>,
    /// When the circuit entered `Open` (drives the half-open transition).
    opened_at: Option<Instant>,
    /// A half-open trial call is currently in flight.
    trial_in_flight: bool,
    window_started: Instant,
    window_total: u32,
    window_failed: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

struct Circuit {
    key: String,
    inner: RwLock<CircuitInner>,
}

/// Admission decision made under the circuit's lock.
enum Admission {
    Allow { trial: bool },
    Reject,
}

impl Circuit {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            inner: RwLock::new(CircuitInner {
                state: CircuitState::Closed,
                state_changed_at: Utc::now(),
                opened_at: None,
                trial_in_flight: false,
                window_started: Instant::now(),
                window_total: 0,
                window_failed: 0,
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                last_success_at: None,
                last_failure_at: None,
            }),
        }
    }

    async fn admit(&self, config: &CircuitBreakerConfig) -> Admission {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => Admission::Allow { trial: false },
            CircuitState::Isolated => Admission::Reject,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed());
                if elapsed.is_some_and(|e| e >= config.break_duration()) {
                    info!(key = %self.key, "circuit transitioning open -> half-open");
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Admission::Allow { trial: true }
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    // Only one probe at a time while half-open.
                    Admission::Reject
                } else {
                    inner.trial_in_flight = true;
                    Admission::Allow { trial: true }
                }
            }
        }
    }

    async fn record_success(&self, config: &CircuitBreakerConfig, trial: bool) {
        let mut inner = self.inner.write().await;

        inner.total_requests += 1;
        inner.successful_requests += 1;
        inner.last_success_at = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen if trial => {
                info!(key = %self.key, "circuit transitioning half-open -> closed (recovered)");
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Closed => {
                Self::rotate_window(&mut inner, config);
                inner.window_total += 1;
            }
            // Isolated ignores sampled outcomes; Open cannot happen for an
            // admitted call.
            _ => {}
        }
    }

    async fn record_failure(&self, config: &CircuitBreakerConfig, trial: bool) {
        let mut inner = self.inner.write().await;

        inner.total_requests += 1;
        inner.failed_requests += 1;
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen if trial => {
                warn!(key = %self.key, "circuit transitioning half-open -> open (trial failed)");
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                Self::rotate_window(&mut inner, config);
                inner.window_total += 1;
                inner.window_failed += 1;

                if inner.window_total >= config.minimum_throughput {
                    let ratio = f64::from(inner.window_failed) / f64::from(inner.window_total);
                    if ratio >= config.failure_threshold {
                        warn!(
                            key = %self.key,
                            failed = inner.window_failed,
                            total = inner.window_total,
                            "circuit transitioning closed -> open (failure ratio exceeded)"
                        );
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
            }
            _ => {}
        }
    }

    /// A call unwound via cancellation: release the trial slot without
    /// recording a sample.
    async fn record_cancelled(&self, trial: bool) {
        if trial {
            let mut inner = self.inner.write().await;
            inner.trial_in_flight = false;
        }
    }

    async fn force_state(&self, new_state: CircuitState) {
        let mut inner = self.inner.write().await;
        if inner.state == new_state {
            return;
        }
        info!(
            key = %self.key,
            old_state = %inner.state,
            new_state = %new_state,
            "circuit state forced"
        );
        self.transition(&mut inner, new_state);
    }

    fn transition(&self, inner: &mut CircuitInner, new_state: CircuitState) {
        inner.state = new_state;
        inner.state_changed_at = Utc::now();
        inner.trial_in_flight = false;

        match new_state {
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.window_started = Instant::now();
                inner.window_total = 0;
                inner.window_failed = 0;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen | CircuitState::Isolated => {
                inner.opened_at = None;
            }
        }
    }

    /// Tumbling window: an aged-out window is discarded in full before the
    /// next sample is recorded.
    fn rotate_window(inner: &mut CircuitInner, config: &CircuitBreakerConfig) {
        if inner.window_started.elapsed() >= config.sampling_duration() {
            inner.window_started = Instant::now();
            inner.window_total = 0;
            inner.window_failed = 0;
        }
    }

    async fn health_info(&self) -> CircuitHealthInfo {
        let inner = self.inner.read().await;
        let failure_rate = if inner.total_requests == 0 {
            0.0
        } else {
            inner.failed_requests as f64 / inner.total_requests as f64
        };
        CircuitHealthInfo {
            key: self.key.clone(),
            state: inner.state,
            state_changed_at: inner.state_changed_at,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            failure_rate,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
        }
    }
}

/// Per-key circuit breaker collection.
///
/// Circuits are created lazily on first use and share one configuration.
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    circuits: StateRegistry<Circuit>,
}

impl CircuitBreakers {
    /// Create a collection with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: StateRegistry::new(),
        }
    }

    /// Execute `operation` under the circuit for `key`.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::ServiceUnavailable`] if the circuit is `Open` or
    ///   `Isolated` (the operation is not invoked)
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
        self.execute_inner(key, None, operation).await
    }

    /// Execute with an external cancellation signal.
    ///
    /// Cancellation unwinds with [`ResilienceError::Cancelled`] and is not
    /// counted as a failure sample.
    ///
    /// # Errors
    ///
    /// As [`Self::execute`], plus [`ResilienceError::Cancelled`].
    pub async fn execute_cancellable<F, Fut, T, E>(
        &self,
        key: &str,
        token: &CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_inner(key, Some(token), operation).await
    }

    async fn execute_inner<F, Fut, T, E>(
        &self,
        key: &str,
        token: Option<&CancellationToken>,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let circuit = self.circuits.get_or_create(key, || Circuit::new(key));

        let trial = match circuit.admit(&self.config).await {
            Admission::Reject => {
                return Err(ResilienceError::ServiceUnavailable {
                    key: key.to_owned(),
                });
            }
            Admission::Allow { trial } => trial,
        };

        let outcome = match token {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => None,
                    result = operation() => Some(result),
                }
            }
            None => Some(operation().await),
        };

        match outcome {
            None => {
                circuit.record_cancelled(trial).await;
                Err(ResilienceError::Cancelled)
            }
            Some(Ok(value)) => {
                circuit.record_success(&self.config, trial).await;
                Ok(value)
            }
            Some(Err(e)) => {
                circuit.record_failure(&self.config, trial).await;
                Err(ResilienceError::Operation(e))
            }
        }
    }

    /// Current state of the circuit for `key`, if one exists.
    ///
    /// The `Open -> HalfOpen` transition is call-driven: a circuit past its
    /// break duration still reports `Open` until the next call arrives.
    pub async fn state(&self, key: &str) -> Option<CircuitState> {
        match self.circuits.get(key) {
            Some(circuit) => Some(circuit.inner.read().await.state),
            None => None,
        }
    }

    /// Force the circuit for `key` to `Closed`. Idempotent.
    pub async fn reset(&self, key: &str) {
        let circuit = self.circuits.get_or_create(key, || Circuit::new(key));
        circuit.force_state(CircuitState::Closed).await;
    }

    /// Force the circuit for `key` to `Isolated`. Idempotent.
    ///
    /// An isolated circuit fails fast and ignores sampled outcomes until a
    /// manual [`Self::close`] or [`Self::reset`].
    pub async fn isolate(&self, key: &str) {
        let circuit = self.circuits.get_or_create(key, || Circuit::new(key));
        circuit.force_state(CircuitState::Isolated).await;
    }

    /// Force the circuit for `key` to `Closed`. Idempotent.
    pub async fn close(&self, key: &str) {
        self.reset(key).await;
    }

    /// Health snapshot for one key, if a circuit exists.
    pub async fn health_info(&self, key: &str) -> Option<CircuitHealthInfo> {
        match self.circuits.get(key) {
            Some(circuit) => Some(circuit.health_info().await),
            None => None,
        }
    }

    /// Health snapshots for every known key.
    pub async fn all_health_info(&self) -> Vec<CircuitHealthInfo> {
        let mut infos = Vec::new();
        for (_, circuit) in self.circuits.entries() {
            infos.push(circuit.health_info().await);
        }
        infos
    }

    /// Configuration shared by every circuit in this collection.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}
