//! Bulkhead: per-key bounded concurrency with a bounded wait queue.
//!
//! Named after ship bulkheads: one slow or overloaded dependency cannot
//! starve resources needed by calls to other dependencies in the same
//! process.
//!
//! Admission per key:
//!
//! ```text
//! slot free?            ──yes──> execute
//!   │no
//! queue has room?       ──yes──> wait for a slot, then execute
//!   │no
//! reject immediately (operation never invoked)
//! ```
//!
//! Waiters are admitted by a FIFO-fair semaphore, which satisfies the
//! best-effort arrival-order contract. A rejected call increments only the
//! rejection counter; executions and failures are counted solely for calls
//! that ran.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::BulkheadConfig;
use crate::error::ResilienceError;
use crate::registry::StateRegistry;

/// Point-in-time statistics for one key's bulkhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadStats {
    /// Key of the protected dependency.
    pub key: String,
    /// Configured maximum concurrent executions.
    pub max_parallelization: usize,
    /// Configured maximum queued callers.
    pub max_queued_actions: usize,
    /// Operations executing right now (never exceeds `max_parallelization`).
    pub in_flight: usize,
    /// Callers currently waiting for a slot.
    pub queued: usize,
    /// Operations that ran to completion (success or failure).
    pub total_executions: u64,
    /// Completed operations that returned an error.
    pub total_failures: u64,
    /// Calls rejected without invoking the operation.
    pub total_rejections: u64,
    /// `(executions - failures) / executions`, 1.0 when nothing has run.
    pub success_rate: f64,
    /// `rejections / (executions + rejections)`, 0.0 when nothing was seen.
    pub rejection_rate: f64,
    /// Mean duration of completed operations in milliseconds.
    pub avg_duration_ms: f64,
    /// Time of the most recent rejection.
    pub last_rejection_at: Option<DateTime<Utc>>,
}

struct LaneCounters {
    total_executions: u64,
    total_failures: u64,
    total_rejections: u64,
    total_duration: Duration,
    last_rejection_at: Option<DateTime<Utc>>,
}

/// Per-key bulkhead state.
struct Lane {
    key: String,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    counters: RwLock<LaneCounters>,
}

impl Lane {
    fn new(key: &str, config: &BulkheadConfig) -> Self {
        Self {
            key: key.to_owned(),
            semaphore: Arc::new(Semaphore::new(config.max_parallelization)),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            counters: RwLock::new(LaneCounters {
                total_executions: 0,
                total_failures: 0,
                total_rejections: 0,
                total_duration: Duration::ZERO,
                last_rejection_at: None,
            }),
        }
    }

    async fn note_rejection(&self) {
        let mut counters = self.counters.write().await;
        counters.total_rejections += 1;
        counters.last_rejection_at = Some(Utc::now());
    }

    async fn note_completion(&self, elapsed: Duration, failed: bool) {
        let mut counters = self.counters.write().await;
        counters.total_executions += 1;
        counters.total_duration += elapsed;
        if failed {
            counters.total_failures += 1;
        }
    }

    async fn stats(&self, config: &BulkheadConfig) -> BulkheadStats {
        let counters = self.counters.read().await;

        let success_rate = if counters.total_executions == 0 {
            1.0
        } else {
            (counters.total_executions - counters.total_failures) as f64
                / counters.total_executions as f64
        };
        let seen = counters.total_executions + counters.total_rejections;
        let rejection_rate = if seen == 0 {
            0.0
        } else {
            counters.total_rejections as f64 / seen as f64
        };
        let avg_duration_ms = if counters.total_executions == 0 {
            0.0
        } else {
            counters.total_duration.as_secs_f64() * 1000.0 / counters.total_executions as f64
        };

        BulkheadStats {
            key: self.key.clone(),
            max_parallelization: config.max_parallelization,
            max_queued_actions: config.max_queued_actions,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            total_executions: counters.total_executions,
            total_failures: counters.total_failures,
            total_rejections: counters.total_rejections,
            success_rate,
            rejection_rate,
            avg_duration_ms,
            last_rejection_at: counters.last_rejection_at,
        }
    }
}

/// Per-key bulkhead collection.
pub struct Bulkheads {
    config: BulkheadConfig,
    lanes: StateRegistry<Lane>,
}

impl Bulkheads {
    /// Create a collection with the given configuration.
    #[must_use]
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            lanes: StateRegistry::new(),
        }
    }

    /// Execute `operation` inside the bulkhead for `key`.
    ///
    /// Suspends while waiting for a free slot if the queue has room.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::BulkheadRejected`] when slots and queue room are
    ///   both exhausted (the operation is not invoked)
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
    /// Cancellation while queued (or while the operation runs) unwinds with
    /// [`ResilienceError::Cancelled`] and touches no execution counters.
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
        let lane = self.lanes.get_or_create(key, || Lane::new(key, &self.config));

        let permit = match Arc::clone(&lane.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // No free slot: queue if the wait allowance has room.
                let max_queued = self.config.max_queued_actions;
                if lane
                    .queued
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| {
                        (q < max_queued).then(|| q + 1)
                    })
                    .is_err()
                {
                    lane.note_rejection().await;
                    warn!(
                        key = %lane.key,
                        max_parallelization = self.config.max_parallelization,
                        max_queued_actions = max_queued,
                        "bulkhead rejected call: capacity exhausted"
                    );
                    return Err(ResilienceError::BulkheadRejected {
                        key: key.to_owned(),
                    });
                }

                let acquired = match token {
                    Some(token) => {
                        tokio::select! {
                            () = token.cancelled() => None,
                            permit = Arc::clone(&lane.semaphore).acquire_owned() => Some(permit),
                        }
                    }
                    None => Some(Arc::clone(&lane.semaphore).acquire_owned().await),
                };
                lane.queued.fetch_sub(1, Ordering::SeqCst);

                match acquired {
                    None => return Err(ResilienceError::Cancelled),
                    Some(Ok(permit)) => permit,
                    // The semaphore is never closed; treat it as a rejection
                    // rather than panicking.
                    Some(Err(_)) => {
                        lane.note_rejection().await;
                        return Err(ResilienceError::BulkheadRejected {
                            key: key.to_owned(),
                        });
                    }
                }
            }
        };

        lane.in_flight.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let outcome = match token {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => None,
                    result = operation() => Some(result),
                }
            }
            None => Some(operation().await),
        };

        lane.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        match outcome {
            None => Err(ResilienceError::Cancelled),
            Some(result) => {
                lane.note_completion(started.elapsed(), result.is_err()).await;
                result.map_err(ResilienceError::Operation)
            }
        }
    }

    /// Statistics for one key, if a bulkhead exists.
    pub async fn stats(&self, key: &str) -> Option<BulkheadStats> {
        match self.lanes.get(key) {
            Some(lane) => Some(lane.stats(&self.config).await),
            None => None,
        }
    }

    /// Statistics for every known key.
    pub async fn all_stats(&self) -> Vec<BulkheadStats> {
        let mut stats = Vec::new();
        for (_, lane) in self.lanes.entries() {
            stats.push(lane.stats(&self.config).await);
        }
        stats
    }

    /// Configuration shared by every bulkhead in this collection.
    #[must_use]
    pub const fn config(&self) -> &BulkheadConfig {
        &self.config
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(max_parallelization: usize, max_queued_actions: usize) -> BulkheadConfig {
        BulkheadConfig {
            max_parallelization,
            max_queued_actions,
        }
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_cap_under_load() {
        let bulkheads = Arc::new(Bulkheads::new(config(2, 10)));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let bulkheads = Arc::clone(&bulkheads);
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);

            handles.push(tokio::spawn(async move {
                bulkheads
                    .execute("svc", || async {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert!(
            max_seen.load(Ordering::SeqCst) <= 2,
            "in-flight exceeded max_parallelization: {}",
            max_seen.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_rejects_immediately_when_full_with_empty_queue() {
        let bulkheads = Arc::new(Bulkheads::new(config(2, 0)));

        // Occupy both slots with long-running calls.
        let mut slots = vec![];
        for _ in 0..2 {
            let bulkheads = Arc::clone(&bulkheads);
            slots.push(tokio::spawn(async move {
                bulkheads
                    .execute("svc", || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, String>(())
                    })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = Arc::clone(&invoked);
        let third = bulkheads
            .execute("svc", move || async move {
                invoked_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(
            third,
            Err(ResilienceError::BulkheadRejected { .. })
        ));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let stats = bulkheads.stats("svc").await.unwrap();
        assert_eq!(stats.total_rejections, 1);
        // A rejection never counts as an execution or failure.
        assert_eq!(stats.total_executions, 0);
        assert_eq!(stats.total_failures, 0);

        for slot in slots {
            assert!(slot.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_queued_call_runs_when_slot_frees() {
        let bulkheads = Arc::new(Bulkheads::new(config(1, 1)));

        let bulkheads_first = Arc::clone(&bulkheads);
        let first = tokio::spawn(async move {
            bulkheads_first
                .execute("svc", || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>("first")
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Queue capacity 1: this waits and then runs.
        let second = bulkheads
            .execute("svc", || async { Ok::<_, String>("second") })
            .await;

        assert_eq!(second.unwrap(), "second");
        assert_eq!(first.await.unwrap().unwrap(), "first");

        let stats = bulkheads.stats("svc").await.unwrap();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.total_rejections, 0);
    }

    #[tokio::test]
    async fn test_failure_counted_and_error_propagated() {
        let bulkheads = Bulkheads::new(config(2, 0));

        let result = bulkheads
            .execute("svc", || async { Err::<(), _>("boom".to_string()) })
            .await;

        match result {
            Err(ResilienceError::Operation(e)) => assert_eq!(e, "boom"),
            other => panic!("expected operation error, got {other:?}"),
        }

        let stats = bulkheads.stats("svc").await.unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.total_failures, 1);
        assert!((stats.success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_cancellation_while_queued() {
        let bulkheads = Arc::new(Bulkheads::new(config(1, 1)));

        let bulkheads_first = Arc::clone(&bulkheads);
        let first = tokio::spawn(async move {
            bulkheads_first
                .execute("svc", || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, String>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let token = CancellationToken::new();
        let bulkheads_second = Arc::clone(&bulkheads);
        let token_clone = token.clone();
        let second = tokio::spawn(async move {
            bulkheads_second
                .execute_cancellable("svc", &token_clone, || async { Ok::<_, String>(()) })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        assert!(matches!(
            second.await.unwrap(),
            Err(ResilienceError::Cancelled)
        ));
        assert!(first.await.unwrap().is_ok());

        let stats = bulkheads.stats("svc").await.unwrap();
        // The cancelled call never executed and was not a rejection.
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.total_rejections, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let bulkheads = Arc::new(Bulkheads::new(config(1, 0)));

        let bulkheads_busy = Arc::clone(&bulkheads);
        let busy = tokio::spawn(async move {
            bulkheads_busy
                .execute("slow-svc", || async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok::<_, String>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // A different key is unaffected by the saturated one.
        let result = bulkheads
            .execute("fast-svc", || async { Ok::<_, String>("ok") })
            .await;
        assert_eq!(result.unwrap(), "ok");

        assert!(busy.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_average_duration_tracked() {
        let bulkheads = Bulkheads::new(config(2, 0));

        let _ = bulkheads
            .execute("svc", || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, String>(())
            })
            .await;

        let stats = bulkheads.stats("svc").await.unwrap();
        assert!(stats.avg_duration_ms >= 40.0);
    }
}
