//! Aggregate observability over every resilience primitive.
//!
//! The monitor holds shared handles to the circuit breakers, bulkheads,
//! rate limiters, and timeout guards and derives a [`ResilienceReport`]
//! on demand: per-key snapshots, a 0–100 health score, and operator
//! recommendations. Reports are recomputed per request from live counters;
//! nothing is cached and generating a report never mutates primitive state.
//!
//! Scoring:
//!
//! - circuits: percentage of keys currently `Closed`
//! - bulkheads: average success rate, penalized by the rejection rate
//! - timeouts: `100 − timeout_rate × 100`, averaged over keys
//! - rate limiters: `100 − rejection_rate × 100`, averaged over keys
//!
//! The overall score is the mean of the sub-scores that have data. A
//! system with no traffic scores 100.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::bulkhead::{BulkheadStats, Bulkheads};
use crate::circuit_breaker::{CircuitBreakers, CircuitState};
use crate::health::{ComponentHealth, HealthCheckable};
use crate::rate_limiter::{RateLimitHealthInfo, RateLimiters};
use crate::timeout::{TimeoutGuards, TimeoutStats};

/// Point-in-time report over the whole protection layer.
///
/// Maps are keyed by dependency key and ordered for stable serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceReport {
    /// When the report was generated.
    pub generated_at: DateTime<Utc>,
    /// Circuit state per key.
    pub circuit_states: BTreeMap<String, CircuitState>,
    /// Bulkhead statistics per key.
    pub bulkheads: BTreeMap<String, BulkheadStats>,
    /// Timeout rate per key, 0.0–1.0.
    pub timeout_rates: BTreeMap<String, f64>,
    /// Current window utilization per rate-limited key, 0.0–1.0.
    pub rate_limiter_utilization: BTreeMap<String, f64>,
    /// Aggregate health score, 0–100.
    pub health_score: f64,
    /// Operator guidance derived from the snapshots.
    pub recommendations: Vec<String>,
}

/// Derives reports from live primitive state.
pub struct ResilienceMonitor {
    circuit_breakers: Arc<CircuitBreakers>,
    bulkheads: Arc<Bulkheads>,
    rate_limiters: Arc<RateLimiters>,
    timeout_guards: Arc<TimeoutGuards>,
}

impl ResilienceMonitor {
    /// Create a monitor over shared primitive handles.
    #[must_use]
    pub fn new(
        circuit_breakers: Arc<CircuitBreakers>,
        bulkheads: Arc<Bulkheads>,
        rate_limiters: Arc<RateLimiters>,
        timeout_guards: Arc<TimeoutGuards>,
    ) -> Self {
        Self {
            circuit_breakers,
            bulkheads,
            rate_limiters,
            timeout_guards,
        }
    }

    /// Generate a fresh report from current counters.
    pub async fn generate_report(&self) -> ResilienceReport {
        let (circuits, bulkhead_stats) = futures::join!(
            self.circuit_breakers.all_health_info(),
            self.bulkheads.all_stats(),
        );
        let timeout_stats = self.timeout_guards.all_stats();
        let limiter_info = self.rate_limiters.all_health_info();

        let circuit_states: BTreeMap<String, CircuitState> = circuits
            .iter()
            .map(|info| (info.key.clone(), info.state))
            .collect();
        let bulkheads: BTreeMap<String, BulkheadStats> = bulkhead_stats
            .iter()
            .map(|s| (s.key.clone(), s.clone()))
            .collect();
        let timeout_rates: BTreeMap<String, f64> = timeout_stats
            .iter()
            .map(|s| (s.key.clone(), s.timeout_rate))
            .collect();
        let rate_limiter_utilization: BTreeMap<String, f64> = limiter_info
            .iter()
            .filter_map(|info| {
                self.rate_limiters
                    .utilization(&info.key)
                    .map(|u| (info.key.clone(), u))
            })
            .collect();

        let health_score = Self::health_score(
            &circuit_states,
            &bulkhead_stats,
            &timeout_stats,
            &limiter_info,
        );
        let recommendations = Self::recommendations(
            &circuit_states,
            &bulkhead_stats,
            &timeout_stats,
            &limiter_info,
        );

        debug!(health_score, keys = circuit_states.len(), "generated resilience report");

        ResilienceReport {
            generated_at: Utc::now(),
            circuit_states,
            bulkheads,
            timeout_rates,
            rate_limiter_utilization,
            health_score,
            recommendations,
        }
    }

    /// Circuit state for one key, if a circuit exists.
    pub async fn circuit_state(&self, key: &str) -> Option<CircuitState> {
        self.circuit_breakers.state(key).await
    }

    /// Bulkhead statistics for one key, if a bulkhead exists.
    pub async fn bulkhead_stats(&self, key: &str) -> Option<BulkheadStats> {
        self.bulkheads.stats(key).await
    }

    /// Timeout statistics for one key, if a guard exists.
    #[must_use]
    pub fn timeout_stats(&self, key: &str) -> Option<TimeoutStats> {
        self.timeout_guards.stats(key)
    }

    /// Rate-limit window view for one key, if a window exists.
    #[must_use]
    pub fn rate_limit_info(&self, key: &str) -> Option<RateLimitHealthInfo> {
        self.rate_limiters.health_info(key)
    }

    fn health_score(
        circuit_states: &BTreeMap<String, CircuitState>,
        bulkheads: &[BulkheadStats],
        timeouts: &[TimeoutStats],
        limiters: &[RateLimitHealthInfo],
    ) -> f64 {
        let mut sub_scores = Vec::new();

        if !circuit_states.is_empty() {
            let closed = circuit_states
                .values()
                .filter(|s| **s == CircuitState::Closed)
                .count();
            sub_scores.push(closed as f64 / circuit_states.len() as f64 * 100.0);
        }

        if !bulkheads.is_empty() {
            let sum: f64 = bulkheads
                .iter()
                .map(|s| (s.success_rate * 100.0 - s.rejection_rate * 100.0).clamp(0.0, 100.0))
                .sum();
            sub_scores.push(sum / bulkheads.len() as f64);
        }

        if !timeouts.is_empty() {
            let sum: f64 = timeouts
                .iter()
                .map(|s| (100.0 - s.timeout_rate * 100.0).clamp(0.0, 100.0))
                .sum();
            sub_scores.push(sum / timeouts.len() as f64);
        }

        if !limiters.is_empty() {
            let sum: f64 = limiters
                .iter()
                .map(|info| {
                    let seen = info.total_permitted + info.total_rejected;
                    let rejection_rate = if seen == 0 {
                        0.0
                    } else {
                        info.total_rejected as f64 / seen as f64
                    };
                    (100.0 - rejection_rate * 100.0).clamp(0.0, 100.0)
                })
                .sum();
            sub_scores.push(sum / limiters.len() as f64);
        }

        if sub_scores.is_empty() {
            100.0
        } else {
            sub_scores.iter().sum::<f64>() / sub_scores.len() as f64
        }
    }

    fn recommendations(
        circuit_states: &BTreeMap<String, CircuitState>,
        bulkheads: &[BulkheadStats],
        timeouts: &[TimeoutStats],
        limiters: &[RateLimitHealthInfo],
    ) -> Vec<String> {
        let mut recommendations = Vec::new();

        for (key, state) in circuit_states {
            if matches!(state, CircuitState::Open | CircuitState::Isolated) {
                recommendations.push(format!(
                    "circuit for `{key}` is {state}: investigate the dependency before traffic resumes"
                ));
            }
        }

        for stats in bulkheads {
            if stats.rejection_rate > 0.10 {
                recommendations.push(format!(
                    "bulkhead for `{}` rejects {:.0}% of calls: consider raising max_parallelization or shedding load upstream",
                    stats.key,
                    stats.rejection_rate * 100.0
                ));
            }
        }

        for stats in timeouts {
            if stats.timeout_rate > 0.05 {
                recommendations.push(format!(
                    "`{}` exceeds its deadline on {:.0}% of calls: the dependency is slow or the deadline is too tight",
                    stats.key,
                    stats.timeout_rate * 100.0
                ));
            }
        }

        for info in limiters {
            let seen = info.total_permitted + info.total_rejected;
            if seen > 0 && info.total_rejected as f64 / seen as f64 > 0.10 {
                recommendations.push(format!(
                    "rate limiter for `{}` rejects more than 10% of requests: clients are over budget",
                    info.key
                ));
            }
        }

        if recommendations.is_empty() {
            recommendations.push("all resilience signals healthy".to_string());
        }
        recommendations
    }
}

#[async_trait]
impl HealthCheckable for ResilienceMonitor {
    async fn check_health(&self) -> ComponentHealth {
        let report = self.generate_report().await;
        let summary = format!("resilience health score {:.0}/100", report.health_score);

        let health = if report.health_score >= 90.0 {
            ComponentHealth::healthy(summary)
        } else if report.health_score >= 70.0 {
            ComponentHealth::degraded(summary)
        } else {
            ComponentHealth::unhealthy(summary)
        };

        match serde_json::to_value(&report) {
            Ok(detail) => health.with_detail("report", detail),
            Err(_) => health,
        }
    }

    fn component_name(&self) -> &str {
        "resilience"
    }
}

/// HTTP-shaped surface for scraping the report without a web framework.
#[derive(Clone)]
pub struct ResilienceHealthEndpoint {
    monitor: Arc<ResilienceMonitor>,
}

impl ResilienceHealthEndpoint {
    /// Create an endpoint over a shared monitor.
    #[must_use]
    pub fn new(monitor: Arc<ResilienceMonitor>) -> Self {
        Self { monitor }
    }

    /// Produce `(status_code, json_body)` for the current report.
    ///
    /// `200` while the layer is ready (score ≥ 70), `503` otherwise. The
    /// body is the serialized [`ResilienceReport`].
    pub async fn report(&self) -> (u16, String) {
        let report = self.monitor.generate_report().await;
        let status = if report.health_score >= 70.0 { 200 } else { 503 };
        let body = serde_json::to_string(&report)
            .unwrap_or_else(|_| r#"{"error":"report serialization failed"}"#.to_string());
        (status, body)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{
        BulkheadConfig, CircuitBreakerConfig, RateLimiterConfig, TimeoutConfig,
    };
    use crate::health::HealthStatus;
    use std::time::Duration;

    fn monitor() -> ResilienceMonitor {
        ResilienceMonitor::new(
            Arc::new(CircuitBreakers::new(CircuitBreakerConfig::default())),
            Arc::new(Bulkheads::new(BulkheadConfig::default())),
            Arc::new(RateLimiters::new(RateLimiterConfig::default())),
            Arc::new(TimeoutGuards::new(TimeoutConfig::default())),
        )
    }

    fn monitor_with(
        circuit: CircuitBreakerConfig,
        bulkhead: BulkheadConfig,
        limiter: RateLimiterConfig,
        timeout: TimeoutConfig,
    ) -> ResilienceMonitor {
        ResilienceMonitor::new(
            Arc::new(CircuitBreakers::new(circuit)),
            Arc::new(Bulkheads::new(bulkhead)),
            Arc::new(RateLimiters::new(limiter)),
            Arc::new(TimeoutGuards::new(timeout)),
        )
    }

    #[tokio::test]
    async fn test_empty_system_scores_perfect() {
        let report = monitor().generate_report().await;

        assert!((report.health_score - 100.0).abs() < f64::EPSILON);
        assert_eq!(
            report.recommendations,
            vec!["all resilience signals healthy".to_string()]
        );
        assert!(report.circuit_states.is_empty());
    }

    #[tokio::test]
    async fn test_healthy_traffic_keeps_score_high() {
        let monitor = monitor();

        for _ in 0..5 {
            let _ = monitor
                .circuit_breakers
                .execute("payments-api", || async { Ok::<_, String>(()) })
                .await;
            let _ = monitor
                .bulkheads
                .execute("payments-api", || async { Ok::<_, String>(()) })
                .await;
            let _ = monitor
                .timeout_guards
                .execute("payments-api", || async { Ok::<_, String>(()) })
                .await;
            monitor.rate_limiters.try_acquire("payments-api", 1);
        }

        let report = monitor.generate_report().await;
        assert!((report.health_score - 100.0).abs() < f64::EPSILON);
        assert_eq!(report.recommendations.len(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_drops_score_and_recommends() {
        let monitor = monitor();
        monitor.circuit_breakers.isolate("payments-api").await;

        let report = monitor.generate_report().await;
        assert!(report.health_score < 100.0);
        assert_eq!(
            report.circuit_states.get("payments-api"),
            Some(&CircuitState::Isolated)
        );
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("payments-api") && r.contains("isolated")));
    }

    #[tokio::test]
    async fn test_bulkhead_rejections_produce_recommendation() {
        let monitor = monitor_with(
            CircuitBreakerConfig::default(),
            BulkheadConfig {
                max_parallelization: 1,
                max_queued_actions: 0,
            },
            RateLimiterConfig::default(),
            TimeoutConfig::default(),
        );

        // One slow occupant, several rejected callers.
        let bulkheads = Arc::clone(&monitor.bulkheads);
        let slow = tokio::spawn(async move {
            bulkheads
                .execute("orders-db", || async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok::<_, String>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        for _ in 0..3 {
            let _ = monitor
                .bulkheads
                .execute("orders-db", || async { Ok::<_, String>(()) })
                .await;
        }
        let _ = slow.await.unwrap();

        let report = monitor.generate_report().await;
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("bulkhead") && r.contains("orders-db")));
        assert!(report.health_score < 100.0);
    }

    #[tokio::test]
    async fn test_timeout_rate_recommendation() {
        let monitor = monitor_with(
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
            RateLimiterConfig::default(),
            TimeoutConfig {
                default_deadline_ms: 20,
            },
        );

        let _ = monitor
            .timeout_guards
            .execute("slow-report", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(())
            })
            .await;

        let report = monitor.generate_report().await;
        assert!((report.timeout_rates["slow-report"] - 1.0).abs() < f64::EPSILON);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("slow-report") && r.contains("deadline")));
    }

    #[tokio::test]
    async fn test_rate_limit_rejections_recommendation() {
        let monitor = monitor_with(
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
            RateLimiterConfig {
                permit_limit: 1,
                window_ms: 60_000,
                per_user_limits_enabled: false,
                per_user_limit: 1,
                endpoint_overrides: vec![],
            },
            TimeoutConfig::default(),
        );

        monitor.rate_limiters.try_acquire("search", 1);
        for _ in 0..5 {
            monitor.rate_limiters.try_acquire("search", 1);
        }

        let report = monitor.generate_report().await;
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("rate limiter") && r.contains("search")));
        assert!(report.health_score < 100.0);
    }

    #[tokio::test]
    async fn test_report_serializes_to_json() {
        let monitor = monitor();
        monitor.rate_limiters.try_acquire("search", 1);

        let report = monitor.generate_report().await;
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("health_score"));
        assert!(json.contains("recommendations"));

        let parsed: ResilienceReport = serde_json::from_str(&json).unwrap();
        assert!((parsed.health_score - report.health_score).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_health_checkable_mapping() {
        let monitor = monitor();
        let health = monitor.check_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.details.unwrap().contains_key("report"));

        let monitor = monitor_with(
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
            RateLimiterConfig::default(),
            TimeoutConfig::default(),
        );
        monitor.circuit_breakers.isolate("a").await;
        monitor.circuit_breakers.isolate("b").await;
        let health = monitor.check_health().await;
        // All circuits open: circuit sub-score 0, overall well below 70.
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_endpoint_status_codes() {
        let endpoint = ResilienceHealthEndpoint::new(Arc::new(monitor()));
        let (status, body) = endpoint.report().await;
        assert_eq!(status, 200);
        assert!(body.contains("health_score"));

        let unhealthy = monitor();
        unhealthy.circuit_breakers.isolate("only-key").await;
        let endpoint = ResilienceHealthEndpoint::new(Arc::new(unhealthy));
        let (status, _) = endpoint.report().await;
        assert_eq!(status, 503);
    }
}
