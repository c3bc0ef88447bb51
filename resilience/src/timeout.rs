//! Deadline enforcement for calls to slow dependencies.
//!
//! Every call races the operation against a deadline. When the deadline
//! wins the operation future is dropped (abandoned, not interrupted at a
//! lower level) and the caller receives
//! [`ResilienceError::TimeoutExceeded`]. Call and timeout counts are kept
//! per key so the monitor can surface chronically slow dependencies.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::TimeoutConfig;
use crate::error::ResilienceError;
use crate::registry::StateRegistry;

/// Point-in-time statistics for one key's timeout guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutStats {
    /// Key of the guarded dependency.
    pub key: String,
    /// The collection's configured default deadline, in milliseconds.
    /// Per-call deadlines passed to
    /// [`TimeoutGuards::execute_with_deadline`] are not reflected here.
    pub deadline_ms: u64,
    /// Calls made through the guard.
    pub total_calls: u64,
    /// Calls abandoned at the deadline.
    pub total_timeouts: u64,
    /// `timeouts / calls`, 0.0 when nothing has run.
    pub timeout_rate: f64,
    /// Mean duration of calls that completed before the deadline, in
    /// milliseconds.
    pub avg_duration_ms: f64,
}

struct GuardCounters {
    total_calls: u64,
    total_timeouts: u64,
    completed_duration: Duration,
}

struct Guard {
    key: String,
    counters: Mutex<GuardCounters>,
}

impl Guard {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            counters: Mutex::new(GuardCounters {
                total_calls: 0,
                total_timeouts: 0,
                completed_duration: Duration::ZERO,
            }),
        }
    }

    fn note_completed(&self, elapsed: Duration) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.total_calls += 1;
        counters.completed_duration += elapsed;
    }

    fn note_timeout(&self) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.total_calls += 1;
        counters.total_timeouts += 1;
    }

    fn stats(&self, deadline: Duration) -> TimeoutStats {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let completed = counters.total_calls - counters.total_timeouts;
        let timeout_rate = if counters.total_calls == 0 {
            0.0
        } else {
            counters.total_timeouts as f64 / counters.total_calls as f64
        };
        let avg_duration_ms = if completed == 0 {
            0.0
        } else {
            counters.completed_duration.as_secs_f64() * 1000.0 / completed as f64
        };
        TimeoutStats {
            key: self.key.clone(),
            deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            total_calls: counters.total_calls,
            total_timeouts: counters.total_timeouts,
            timeout_rate,
            avg_duration_ms,
        }
    }
}

/// Per-key timeout guards.
pub struct TimeoutGuards {
    config: TimeoutConfig,
    guards: StateRegistry<Guard>,
}

impl TimeoutGuards {
    /// Create a collection with the given configuration.
    #[must_use]
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            guards: StateRegistry::new(),
        }
    }

    /// Execute `operation` under the configured default deadline.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::TimeoutExceeded`] when the deadline elapses
    ///   before the operation completes (the operation is abandoned)
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
        self.execute_inner(key, self.config.default_deadline(), None, operation)
            .await
    }

    /// Execute with a per-call deadline overriding the configured default.
    ///
    /// # Errors
    ///
    /// As [`Self::execute`].
    pub async fn execute_with_deadline<F, Fut, T, E>(
        &self,
        key: &str,
        deadline: Duration,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_inner(key, deadline, None, operation).await
    }

    /// Execute with the default deadline and an external cancellation
    /// signal. Cancellation wins over the deadline and is not counted as a
    /// timeout.
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
        self.execute_inner(key, self.config.default_deadline(), Some(token), operation)
            .await
    }

    async fn execute_inner<F, Fut, T, E>(
        &self,
        key: &str,
        deadline: Duration,
        token: Option<&CancellationToken>,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self.guards.get_or_create(key, || Guard::new(key));
        let started = Instant::now();

        enum Raced<R> {
            Finished(R),
            DeadlineHit,
            CancelledByCaller,
        }

        let raced = match token {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => Raced::CancelledByCaller,
                    result = tokio::time::timeout(deadline, operation()) => match result {
                        Ok(inner) => Raced::Finished(inner),
                        Err(_) => Raced::DeadlineHit,
                    },
                }
            }
            None => match tokio::time::timeout(deadline, operation()).await {
                Ok(inner) => Raced::Finished(inner),
                Err(_) => Raced::DeadlineHit,
            },
        };

        match raced {
            Raced::Finished(result) => {
                guard.note_completed(started.elapsed());
                result.map_err(ResilienceError::Operation)
            }
            Raced::DeadlineHit => {
                guard.note_timeout();
                warn!(key = %key, ?deadline, "operation exceeded deadline, abandoning");
                Err(ResilienceError::TimeoutExceeded {
                    key: key.to_owned(),
                    deadline,
                })
            }
            Raced::CancelledByCaller => Err(ResilienceError::Cancelled),
        }
    }

    /// Statistics for one key, if a guard exists.
    #[must_use]
    pub fn stats(&self, key: &str) -> Option<TimeoutStats> {
        self.guards
            .get(key)
            .map(|g| g.stats(self.config.default_deadline()))
    }

    /// Statistics for every known key.
    #[must_use]
    pub fn all_stats(&self) -> Vec<TimeoutStats> {
        let deadline = self.config.default_deadline();
        self.guards
            .entries()
            .into_iter()
            .map(|(_, g)| g.stats(deadline))
            .collect()
    }

    /// Configuration shared by every guard in this collection.
    #[must_use]
    pub const fn config(&self) -> &TimeoutConfig {
        &self.config
    }
}
