//! Component health reporting seam.
//!
//! Anything that wants to surface its condition to an operator implements
//! [`HealthCheckable`] and returns a [`ComponentHealth`]. The resilience
//! monitor implements it over the aggregate health score, so the whole
//! protection layer can sit behind a readiness probe alongside other
//! components.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Coarse condition of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Functional but impaired (tripped circuits, elevated rejections).
    Degraded,
    /// Not operational.
    Unhealthy,
}

impl HealthStatus {
    /// Whether the component can accept traffic (healthy or degraded).
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Whether the component is fully operational.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// One component's health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Current condition.
    pub status: HealthStatus,
    /// Human-readable summary.
    pub message: String,
    /// When this report was produced.
    pub last_check: SystemTime,
    /// Structured detail for dashboards and debugging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

impl ComponentHealth {
    fn with_status(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            last_check: SystemTime::now(),
            details: None,
        }
    }

    /// Report a fully operational component.
    #[must_use]
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, message)
    }

    /// Report an impaired but functional component.
    #[must_use]
    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, message)
    }

    /// Report a non-operational component.
    #[must_use]
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy, message)
    }

    /// Attach a structured detail to the report.
    #[must_use]
    pub fn with_detail(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.details
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Implemented by components that report health.
///
/// `check_health` should complete quickly; it sits on probe paths.
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    /// Produce a current health report.
    async fn check_health(&self) -> ComponentHealth;

    /// Component name used in aggregated reports.
    fn component_name(&self) -> &str;
}
