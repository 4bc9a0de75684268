//! Observability infrastructure for the controller
//!
//! Provides:
//! - Prometheus metrics (operations, build durations, health checks, push channel)
//! - Structured JSON logging with tracing

use crate::models::{
    DeploymentEvent, EventSeverity, ServiceId, ServiceStatus, TopologyAnalysis,
};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    TextEncoder,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Build durations range from seconds to tens of minutes
const BUILD_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    operations_total: IntCounterVec,
    build_duration_seconds: Histogram,
    health_checks_total: IntCounterVec,
    events_published_total: IntCounterVec,
    analyses_total: IntCounter,
    subscribers: IntGauge,
    instances: IntGaugeVec,
    runtime_errors_total: IntCounterVec,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            operations_total: register_int_counter_vec!(
                "fas_operations_total",
                "Lifecycle operations by kind and outcome",
                &["kind", "outcome"]
            )
            .expect("Failed to register operations_total"),

            build_duration_seconds: register_histogram!(
                "fas_build_duration_seconds",
                "Time spent building service images, retries included",
                BUILD_BUCKETS.to_vec()
            )
            .expect("Failed to register build_duration_seconds"),

            health_checks_total: register_int_counter_vec!(
                "fas_health_checks_total",
                "Service health checks by result",
                &["result"]
            )
            .expect("Failed to register health_checks_total"),

            events_published_total: register_int_counter_vec!(
                "fas_events_published_total",
                "Events published on the push channel by kind",
                &["kind"]
            )
            .expect("Failed to register events_published_total"),

            analyses_total: register_int_counter!(
                "fas_analyses_total",
                "Topology analyses run"
            )
            .expect("Failed to register analyses_total"),

            subscribers: register_int_gauge!(
                "fas_subscribers",
                "Live push channel subscribers"
            )
            .expect("Failed to register subscribers"),

            instances: register_int_gauge_vec!(
                "fas_instances",
                "Service instances by status",
                &["status"]
            )
            .expect("Failed to register instances"),

            runtime_errors_total: register_int_counter_vec!(
                "fas_runtime_errors_total",
                "Container runtime failures by classification",
                &["kind"]
            )
            .expect("Failed to register runtime_errors_total"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Count a finished (or rejected) lifecycle operation
    pub fn record_operation(&self, kind: &str, outcome: &str) {
        self.inner()
            .operations_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    pub fn observe_build_duration(&self, duration_secs: f64) {
        self.inner().build_duration_seconds.observe(duration_secs);
    }

    pub fn record_health_check(&self, result: &str) {
        self.inner()
            .health_checks_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn record_event_published(&self, kind: &str) {
        self.inner()
            .events_published_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_analyses(&self) {
        self.inner().analyses_total.inc();
    }

    pub fn set_subscribers(&self, count: i64) {
        self.inner().subscribers.set(count);
    }

    /// Replace the per-status instance gauges
    pub fn set_instance_counts(&self, counts: &[(ServiceStatus, i64)]) {
        for status in ServiceStatus::ALL {
            let count = counts
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, c)| *c)
                .unwrap_or(0);
            self.inner()
                .instances
                .with_label_values(&[status.as_str()])
                .set(count);
        }
    }

    pub fn record_runtime_error(&self, kind: &str) {
        self.inner()
            .runtime_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Text exposition of the default registry
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Structured logger for controller events
///
/// One canonical `event = "..."` line per significant occurrence, so logs
/// can be filtered and joined on the same keys as the push channel.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, runtime: &str, restored: usize) {
        info!(
            event = "controller_started",
            instance = %self.instance,
            version = %version,
            runtime = %runtime,
            restored_instances = restored,
            "Service controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Service controller shutting down"
        );
    }

    pub fn log_transition(
        &self,
        service_id: ServiceId,
        name: &str,
        from: ServiceStatus,
        to: ServiceStatus,
    ) {
        let message = "Service status changed";
        if to == ServiceStatus::Error {
            warn!(
                event = "status_changed",
                instance = %self.instance,
                service_id = %service_id,
                service_name = %name,
                previous_status = %from,
                status = %to,
                "{}",
                message
            );
        } else {
            info!(
                event = "status_changed",
                instance = %self.instance,
                service_id = %service_id,
                service_name = %name,
                previous_status = %from,
                status = %to,
                "{}",
                message
            );
        }
    }

    pub fn log_deployment_event(&self, event: &DeploymentEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        match event.severity {
            EventSeverity::Error => error!(
                event = "deployment_event",
                instance = %self.instance,
                service_id = %event.service_id,
                sequence = event.sequence,
                event_type = %event.event_type,
                success = event.success,
                duration_ms = ?event.duration_ms,
                detail = %detail,
                "Deployment event recorded"
            ),
            EventSeverity::Warning => warn!(
                event = "deployment_event",
                instance = %self.instance,
                service_id = %event.service_id,
                sequence = event.sequence,
                event_type = %event.event_type,
                success = event.success,
                duration_ms = ?event.duration_ms,
                detail = %detail,
                "Deployment event recorded"
            ),
            EventSeverity::Info => info!(
                event = "deployment_event",
                instance = %self.instance,
                service_id = %event.service_id,
                sequence = event.sequence,
                event_type = %event.event_type,
                success = event.success,
                duration_ms = ?event.duration_ms,
                detail = %detail,
                "Deployment event recorded"
            ),
        }
    }

    /// Health crossing the failure threshold, or recovering from it
    pub fn log_health_change(&self, service_id: ServiceId, healthy: bool, consecutive_failures: u32) {
        if healthy {
            info!(
                event = "health_recovered",
                instance = %self.instance,
                service_id = %service_id,
                "Service health recovered"
            );
        } else {
            warn!(
                event = "health_degraded",
                instance = %self.instance,
                service_id = %service_id,
                consecutive_failures = consecutive_failures,
                "Service health degraded"
            );
        }
    }

    pub fn log_analysis(&self, analysis: &TopologyAnalysis) {
        info!(
            event = "analysis_completed",
            instance = %self.instance,
            workspace_id = %analysis.workspace_id,
            folder_path = %analysis.folder_path,
            analysis_id = %analysis.id,
            candidates = analysis.recommendations.len(),
            strategy = ?analysis.deployment_strategy,
            "Topology analysis completed"
        );
    }

    /// A lifecycle request turned away synchronously
    pub fn log_rejected(&self, service_id: ServiceId, operation: &str, code: &str) {
        info!(
            event = "operation_rejected",
            instance = %self.instance,
            service_id = %service_id,
            operation = %operation,
            code = %code,
            "Lifecycle operation rejected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_metrics_render() {
        let metrics = ControllerMetrics::new();

        metrics.record_operation("deploy", "success");
        metrics.observe_build_duration(12.5);
        metrics.record_health_check("healthy");
        metrics.record_event_published("deployment_event");
        metrics.inc_analyses();
        metrics.set_instance_counts(&[(ServiceStatus::Running, 2)]);

        let text = metrics.render().unwrap();
        assert!(text.contains("fas_operations_total"));
        assert!(text.contains("fas_build_duration_seconds"));
    }

    #[test]
    fn test_metrics_handles_share_registration() {
        let a = ControllerMetrics::new();
        let b = a.clone();
        a.set_subscribers(3);
        b.set_subscribers(0);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("controller-0");
        assert_eq!(logger.instance, "controller-0");
    }
}
