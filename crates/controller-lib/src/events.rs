//! Team-keyed push channel for live observers
//!
//! Every team has its own broadcast topic. Publishers send while holding the
//! instance's store entry, so a subscriber sees one instance's events in the
//! order they happened; nothing is promised across instances.

use crate::models::{
    DeploymentEvent, DeploymentEventType, EventSeverity, HealthStatus, ResourceUtilization,
    ServiceId, ServiceStatus,
};
use crate::observability::ControllerMetrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Configuration for the event broadcaster
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Events buffered per team before slow subscribers start lagging
    pub capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Message delivered on the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    ServiceStatusChanged {
        service_id: ServiceId,
        status: ServiceStatus,
        previous_status: Option<ServiceStatus>,
        timestamp: DateTime<Utc>,
    },
    ServiceMetricsUpdated {
        service_id: ServiceId,
        metrics: ResourceUtilization,
        timestamp: DateTime<Utc>,
    },
    DeploymentEvent {
        service_id: ServiceId,
        sequence: u64,
        event_type: DeploymentEventType,
        severity: EventSeverity,
        duration_ms: Option<u64>,
        success: bool,
        detail: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ServiceHealthChanged {
        service_id: ServiceId,
        health: HealthStatus,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },
}

impl ServiceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceEvent::ServiceStatusChanged { .. } => "service_status_changed",
            ServiceEvent::ServiceMetricsUpdated { .. } => "service_metrics_updated",
            ServiceEvent::DeploymentEvent { .. } => "deployment_event",
            ServiceEvent::ServiceHealthChanged { .. } => "service_health_changed",
        }
    }

    pub fn service_id(&self) -> ServiceId {
        match self {
            ServiceEvent::ServiceStatusChanged { service_id, .. }
            | ServiceEvent::ServiceMetricsUpdated { service_id, .. }
            | ServiceEvent::DeploymentEvent { service_id, .. }
            | ServiceEvent::ServiceHealthChanged { service_id, .. } => *service_id,
        }
    }
}

impl From<&DeploymentEvent> for ServiceEvent {
    fn from(event: &DeploymentEvent) -> Self {
        ServiceEvent::DeploymentEvent {
            service_id: event.service_id,
            sequence: event.sequence,
            event_type: event.event_type,
            severity: event.severity,
            duration_ms: event.duration_ms,
            success: event.success,
            detail: event.detail.clone(),
            timestamp: event.occurred_at,
        }
    }
}

/// Fan-out of [`ServiceEvent`]s to per-team subscribers
pub struct EventBroadcaster {
    topics: DashMap<String, broadcast::Sender<ServiceEvent>>,
    config: BroadcasterConfig,
    metrics: ControllerMetrics,
}

impl EventBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            topics: DashMap::new(),
            config,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Subscribe to a team's topic, creating it on first use
    pub fn subscribe(&self, team_id: &str) -> broadcast::Receiver<ServiceEvent> {
        let capacity = self.config.capacity.max(1);
        let rx = self
            .topics
            .entry(team_id.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();
        self.refresh_subscriber_gauge();
        rx
    }

    /// Publish to a team's topic; returns the number of subscribers reached
    pub fn publish(&self, team_id: &str, event: ServiceEvent) -> usize {
        let kind = event.kind();
        let delivered = match self.topics.get(team_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        };

        if delivered == 0 {
            // Drop topics whose subscribers have all gone away
            self.topics
                .remove_if(team_id, |_, tx| tx.receiver_count() == 0);
            self.refresh_subscriber_gauge();
        }

        self.metrics.record_event_published(kind);
        trace!(team_id = %team_id, kind = kind, delivered = delivered, "Event published");
        delivered
    }

    /// Live subscribers of a team's topic
    pub fn subscriber_count(&self, team_id: &str) -> usize {
        self.topics
            .get(team_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn refresh_subscriber_gauge(&self) {
        let total: usize = self.topics.iter().map(|t| t.value().receiver_count()).sum();
        self.metrics.set_subscribers(total as i64);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}
