//! Self-health of the controller
//!
//! The `/healthz` and `/readyz` probes report on the controller process, not
//! on the services it deploys (those are covered by [`crate::monitor`]).
//! Each component below is reported on by the code that owns it:
//!
//! - `runtime`: the startup ping of the container engine
//! - `monitor`: the monitor loop, degraded while due work is backlogged or
//!   metric samples fail, unhealthy once the loop has stopped
//! - `store`: the state-file flush loop

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Ordered from best to worst, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, with a problem worth surfacing
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const RUNTIME: &str = "runtime";
    pub const MONITOR: &str = "monitor";
    pub const STORE: &str = "store";

    pub const ALL: [&str; 3] = [RUNTIME, MONITOR, STORE];
}

#[derive(Debug, Default)]
struct Inner {
    components: BTreeMap<String, ComponentHealth>,
    /// Set once startup wiring is done, cleared on shutdown
    ready: bool,
}

/// Shared, cloneable view of the controller's component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every component as healthy, keeping any already reported
    pub async fn register_all(&self) {
        let mut inner = self.inner.write().await;
        for name in components::ALL {
            inner
                .components
                .entry(name.to_string())
                .or_insert_with(|| ComponentHealth::new(ComponentStatus::Healthy, None));
        }
    }

    pub async fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.inner.read().await.components.get(name).map(|h| h.status)
    }

    async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        self.inner
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::new(status, message));
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into())).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into())).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.ready = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let inner = self.inner.read().await;
        let status = inner
            .components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            components: inner.components.clone(),
        }
    }

    /// Ready once started, as long as no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let inner = self.inner.read().await;
        let reason = if !inner.ready {
            Some("controller not started".to_string())
        } else {
            inner
                .components
                .iter()
                .find(|(_, h)| h.status == ComponentStatus::Unhealthy)
                .map(|(name, h)| match &h.message {
                    Some(message) => format!("{} unhealthy: {}", name, message),
                    None => format!("{} unhealthy", name),
                })
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}
