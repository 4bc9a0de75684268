//! The single writer of service status

use super::ops::{OperationGuard, OperationKind, OperationSlots};
use super::persist::PersistedState;
use super::ports::PortRegistry;
use super::state::check_transition;
use super::store::{Record, ServiceStore};
use crate::error::{ControlError, Result};
use crate::events::{EventBroadcaster, ServiceEvent};
use crate::models::{
    DeploymentEvent, DeploymentEventType, NewEvent, ServiceId, ServiceInstance, ServiceStatus,
};
use crate::observability::{ControllerMetrics, StructuredLogger};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Owns instance records and enforces the transition table.
///
/// Every status change, every event append and the push-channel publish
/// for both happen under the instance's store entry, which keeps one
/// instance's events in order for every subscriber.
pub struct LifecycleManager {
    store: Arc<ServiceStore>,
    ops: Arc<OperationSlots>,
    ports: PortRegistry,
    broadcaster: Arc<EventBroadcaster>,
    logger: StructuredLogger,
    metrics: ControllerMetrics,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<ServiceStore>,
        broadcaster: Arc<EventBroadcaster>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            ops: Arc::new(OperationSlots::new()),
            ports: PortRegistry::new(),
            broadcaster,
            logger,
            metrics: ControllerMetrics::new(),
        }
    }

    pub fn store(&self) -> &Arc<ServiceStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn get(&self, id: &ServiceId) -> Result<ServiceInstance> {
        self.store
            .get(id)
            .ok_or_else(|| ControlError::NotFound(format!("service {}", id)))
    }

    pub fn events(&self, id: &ServiceId) -> Result<Vec<DeploymentEvent>> {
        self.store
            .events(id)
            .ok_or_else(|| ControlError::NotFound(format!("service {}", id)))
    }

    /// Register a new instance in its initial status
    pub fn create(&self, instance: ServiceInstance) -> Result<ServiceInstance> {
        if !matches!(instance.status, ServiceStatus::Pending | ServiceStatus::Detecting) {
            return Err(ControlError::Internal(format!(
                "instances are created pending or detecting, not {}",
                instance.status
            )));
        }
        let instance = self.store.insert(instance)?;

        self.broadcaster.publish(
            &instance.team_id,
            ServiceEvent::ServiceStatusChanged {
                service_id: instance.id,
                status: instance.status,
                previous_status: None,
                timestamp: instance.created_at,
            },
        );
        debug!(service_id = %instance.id, status = %instance.status, "Service instance created");
        self.refresh_gauges();
        Ok(instance)
    }

    // ── Operation slots ────────────────────────────────────────────

    /// Claim the single-writer slot of an instance
    pub fn begin(&self, id: ServiceId, kind: OperationKind) -> Result<OperationGuard> {
        self.ops.try_begin(id, kind).map_err(|e| {
            self.metrics.record_operation(kind.as_str(), "conflict");
            self.logger.log_rejected(id, kind.as_str(), e.code());
            e
        })
    }

    /// Cancel the current holder (if any) and claim the slot
    pub fn preempt(&self, id: ServiceId, kind: OperationKind) -> OperationGuard {
        let (guard, previous) = self.ops.preempt(id, kind);
        if let Some(previous) = previous {
            warn!(service_id = %id, cancelled = %previous, by = %kind, "In-flight operation cancelled");
        }
        guard
    }

    /// Cancel the current holder and claim the slot, unless the holder is
    /// one of `spared`; returns whether something was cancelled
    pub fn preempt_unless(
        &self,
        id: ServiceId,
        kind: OperationKind,
        spared: &[OperationKind],
    ) -> std::result::Result<(OperationGuard, bool), OperationKind> {
        let (guard, previous) = self.ops.preempt_unless(id, kind, spared)?;
        if let Some(previous) = previous {
            warn!(service_id = %id, cancelled = %previous, by = %kind, "In-flight operation cancelled");
        }
        Ok((guard, previous.is_some()))
    }

    pub fn in_flight(&self, id: &ServiceId) -> Option<OperationKind> {
        self.ops.in_flight(id)
    }

    // ── Transitions ────────────────────────────────────────────────

    pub fn transition(&self, id: &ServiceId, to: ServiceStatus) -> Result<ServiceInstance> {
        self.apply_transition(id, to, None, |_| {}).map(|(i, _)| i)
    }

    /// Transition and mutate the instance in one step
    pub fn transition_with(
        &self,
        id: &ServiceId,
        to: ServiceStatus,
        apply: impl FnOnce(&mut ServiceInstance),
    ) -> Result<ServiceInstance> {
        self.apply_transition(id, to, None, apply).map(|(i, _)| i)
    }

    /// Transition and append the event describing it in one step
    pub fn transition_with_event(
        &self,
        id: &ServiceId,
        to: ServiceStatus,
        event: NewEvent,
        apply: impl FnOnce(&mut ServiceInstance),
    ) -> Result<(ServiceInstance, DeploymentEvent)> {
        let (instance, event) = self.apply_transition(id, to, Some(event), apply)?;
        let event = event.ok_or_else(|| ControlError::Internal("event not recorded".into()))?;
        Ok((instance, event))
    }

    fn apply_transition(
        &self,
        id: &ServiceId,
        to: ServiceStatus,
        event: Option<NewEvent>,
        apply: impl FnOnce(&mut ServiceInstance),
    ) -> Result<(ServiceInstance, Option<DeploymentEvent>)> {
        let (instance, appended) = self.store.with_record(id, |record| {
            let from = record.instance.status;
            check_transition(from, to)?;

            let now = Utc::now();
            apply(&mut record.instance);
            let instance = &mut record.instance;
            instance.status = to;
            instance.updated_at = now;
            match to {
                ServiceStatus::Running if from == ServiceStatus::Deploying => {
                    instance.deployed_at = Some(now);
                    instance.stopped_at = None;
                }
                ServiceStatus::Stopped => instance.stopped_at = Some(now),
                ServiceStatus::Deleted => instance.deleted_at = Some(now),
                _ => {}
            }

            self.broadcaster.publish(
                &instance.team_id,
                ServiceEvent::ServiceStatusChanged {
                    service_id: instance.id,
                    status: to,
                    previous_status: Some(from),
                    timestamp: now,
                },
            );
            self.logger.log_transition(instance.id, &instance.name, from, to);

            let appended = event.map(|e| self.append_event(record, e));
            Ok::<_, ControlError>((record.instance.clone(), appended))
        })??;

        if matches!(
            to,
            ServiceStatus::Stopped | ServiceStatus::Error | ServiceStatus::Deleted
        ) {
            self.ports.release(&instance.workspace_id, instance.id);
        }
        self.refresh_gauges();
        Ok((instance, appended))
    }

    /// Append an event to the instance's log without changing status
    pub fn record_event(&self, id: &ServiceId, event: NewEvent) -> Result<DeploymentEvent> {
        self.store.with_record(id, |record| self.append_event(record, event))
    }

    fn append_event(&self, record: &mut Record, event: NewEvent) -> DeploymentEvent {
        let now = Utc::now();
        // Keep occurrence times monotonic within one log
        let occurred_at = record
            .events
            .last()
            .map(|last| last.occurred_at.max(now))
            .unwrap_or(now);

        let event = DeploymentEvent {
            id: Uuid::new_v4(),
            service_id: record.instance.id,
            sequence: record.events.len() as u64 + 1,
            event_type: event.event_type,
            severity: event.severity,
            occurred_at,
            duration_ms: event.duration_ms,
            success: event.success,
            detail: event.detail,
        };
        record.events.push(event.clone());

        self.broadcaster
            .publish(&record.instance.team_id, ServiceEvent::from(&event));
        self.logger.log_deployment_event(&event);
        event
    }

    /// Mutate non-status fields; the status is restored if `f` touched it
    pub fn update(&self, id: &ServiceId, f: impl FnOnce(&mut ServiceInstance)) -> Result<ServiceInstance> {
        self.store.with_record(id, |record| {
            let status = record.instance.status;
            f(&mut record.instance);
            if record.instance.status != status {
                warn!(service_id = %id, "Status changes must go through a transition; ignored");
                record.instance.status = status;
            }
            record.instance.updated_at = Utc::now();
            record.instance.clone()
        })
    }

    /// Monitor bookkeeping that must not bump `updated_at`
    pub fn touch_health_check(&self, id: &ServiceId) -> Result<()> {
        self.store.with_record(id, |record| {
            record.instance.last_health_check_at = Some(Utc::now());
        })
    }

    pub fn rename(&self, id: &ServiceId, name: &str) -> Result<()> {
        self.store.rename(id, name)
    }

    // ── Ports ──────────────────────────────────────────────────────

    /// Bind-time reservation of the instance's host ports
    pub fn reserve_ports(&self, instance: &ServiceInstance) -> Result<()> {
        let ports: Vec<u16> = instance.config.host_ports().collect();
        self.ports.reserve(&instance.workspace_id, instance.id, &ports)
    }

    pub fn release_ports(&self, instance: &ServiceInstance) {
        self.ports.release(&instance.workspace_id, instance.id);
    }

    pub fn port_holder(&self, workspace_id: &str, port: u16) -> Option<ServiceId> {
        self.ports.holder(workspace_id, port)
    }

    // ── Persistence ────────────────────────────────────────────────

    pub fn snapshot(&self) -> PersistedState {
        self.store.snapshot()
    }

    /// Load persisted records. Instances caught mid-operation move to
    /// `error` with an `interrupted` event; live instances get their
    /// ports back. Returns the number of records loaded.
    pub fn restore(&self, state: PersistedState) -> usize {
        let count = state.records.len();
        self.store.load(state);

        for instance in self.store.list_all() {
            if instance.status.is_in_flight() {
                let interrupted = NewEvent::failure(
                    DeploymentEventType::Interrupted,
                    format!("controller restarted while {}", instance.status),
                );
                if let Err(e) = self.force_error(&instance.id, interrupted) {
                    warn!(service_id = %instance.id, error = %e, "Failed to mark interrupted instance");
                }
            } else if instance.status == ServiceStatus::Running {
                if let Err(e) = self.reserve_ports(&instance) {
                    warn!(service_id = %instance.id, error = %e, "Restored instance lost its ports");
                }
            }
        }
        self.refresh_gauges();
        count
    }

    /// `error` regardless of table; only used for interrupted operations
    fn force_error(&self, id: &ServiceId, event: NewEvent) -> Result<()> {
        self.store.with_record(id, |record| {
            let from = record.instance.status;
            record.instance.status = ServiceStatus::Error;
            record.instance.updated_at = Utc::now();
            self.logger
                .log_transition(record.instance.id, &record.instance.name, from, ServiceStatus::Error);
            self.append_event(record, event);
        })
    }

    fn refresh_gauges(&self) {
        self.metrics.set_instance_counts(&self.store.status_counts());
    }
}
