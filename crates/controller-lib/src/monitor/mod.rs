//! Health checks and resource sampling for running services
//!
//! Health and lifecycle status are tracked independently: the monitor never
//! requests a transition, it only records checks and samples and notifies
//! the push channel when health crosses the failure threshold.

mod metrics;
mod probe;
mod tracker;
mod r#loop;

#[cfg(test)]
mod tests;

pub use metrics::MetricsStore;
pub use probe::NetworkProbe;
pub use r#loop::{MonitorConfig, MonitorLoop, TickSummary};
pub use tracker::{HealthReport, HealthTracker, HealthTransition};

use crate::models::ServiceInstance;

pub use async_trait::async_trait;

/// Outcome of one probe run
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub response_time_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn healthy(response_time_ms: f64) -> Self {
        Self {
            healthy: true,
            response_time_ms: Some(response_time_ms),
            status_code: None,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            response_time_ms: None,
            status_code: None,
            message: Some(message.into()),
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }
}

/// Performs a service's configured health check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe failures are results, never errors
    async fn probe(&self, instance: &ServiceInstance) -> ProbeResult;
}
