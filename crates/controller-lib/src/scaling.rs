//! Replica count changes for running services

use crate::error::{ControlError, Result};
use crate::executor::{DeploymentExecutor, OperationHandle};
use crate::lifecycle::OperationKind;
use crate::models::{ServiceId, ServiceStatus};
use std::sync::Arc;
use tracing::info;

/// Validates scale requests and hands convergence to the executor, which
/// moves one replica at a time and records the count after each step
pub struct ScalingController {
    executor: Arc<DeploymentExecutor>,
}

impl ScalingController {
    pub fn new(executor: Arc<DeploymentExecutor>) -> Self {
        Self { executor }
    }

    pub fn scale(&self, id: ServiceId, target: u32) -> Result<OperationHandle> {
        let lifecycle = self.executor.lifecycle();
        let instance = lifecycle.get(&id)?;

        let max = instance.config.scaling.max_replicas;
        if target == 0 {
            return Err(ControlError::Validation(
                "replica count must be at least 1; stop the service to run none".into(),
            ));
        }
        if target > max {
            return Err(ControlError::Validation(format!(
                "replica count {} exceeds the maximum of {}",
                target, max
            )));
        }

        let guard = lifecycle.begin(id, OperationKind::Scale)?;
        let instance = lifecycle.get(&id)?;
        if instance.status != ServiceStatus::Running {
            return Err(ControlError::InvalidTransition {
                from: instance.status,
                to: ServiceStatus::Scaling,
            });
        }

        if instance.config.scaling.current_replicas == target {
            let instance = lifecycle.update(&id, |i| i.config.scaling.target_replicas = target)?;
            return Ok(OperationHandle::completed(instance));
        }

        info!(
            service_id = %id,
            from = instance.config.scaling.current_replicas,
            to = target,
            "Scaling service"
        );
        lifecycle.transition_with(&id, ServiceStatus::Scaling, |i| {
            i.config.scaling.target_replicas = target;
        })?;
        self.executor.converge(guard, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{new_instance, Harness};
    use crate::executor::InMemoryRuntime;
    use crate::models::{DeploymentEventType, EventSeverity};
    use std::time::Duration;

    fn controller(h: &Harness) -> ScalingController {
        ScalingController::new(Arc::clone(&h.executor))
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let h = Harness::new(InMemoryRuntime::new());
        let instance = h.running("api", 8080).await;
        let scaling = controller(&h);

        let handle = scaling.scale(instance.id, 3).unwrap();
        assert_eq!(handle.instance().status, ServiceStatus::Scaling);
        handle.wait().await;
        let scaled = h.lifecycle.get(&instance.id).unwrap();
        assert_eq!(scaled.status, ServiceStatus::Running);
        assert_eq!(scaled.config.scaling.current_replicas, 3);
        assert_eq!(h.runtime.calls().iter().filter(|c| c.starts_with("scale:")).count(), 2);

        scaling.scale(instance.id, 1).unwrap().wait().await;
        let scaled = h.lifecycle.get(&instance.id).unwrap();
        assert_eq!(scaled.config.scaling.current_replicas, 1);
        assert_eq!(h.runtime.replicas(&instance.id), 1);
    }

    #[tokio::test]
    async fn test_partial_scale_returns_to_running() {
        let h = Harness::new(InMemoryRuntime::new().with_replica_capacity(2));
        let instance = h.running("api", 8080).await;

        controller(&h).scale(instance.id, 3).unwrap().wait().await;

        let instance = h.lifecycle.get(&instance.id).unwrap();
        assert_eq!(instance.status, ServiceStatus::Running);
        assert_eq!(instance.config.scaling.current_replicas, 2);

        let errors: Vec<_> = h
            .lifecycle
            .events(&instance.id)
            .unwrap()
            .into_iter()
            .filter(|e| e.severity == EventSeverity::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event_type, DeploymentEventType::ScalePartial);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_targets() {
        let h = Harness::new(InMemoryRuntime::new());
        let instance = h.running("api", 8080).await;
        let scaling = controller(&h);

        assert!(matches!(scaling.scale(instance.id, 0), Err(ControlError::Validation(_))));
        assert!(matches!(scaling.scale(instance.id, 11), Err(ControlError::Validation(_))));
        assert_eq!(h.lifecycle.get(&instance.id).unwrap().status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_scale_requires_running() {
        let h = Harness::new(InMemoryRuntime::new());
        let instance = h.create(new_instance("ws-1", "api", 8080));

        assert!(matches!(
            controller(&h).scale(instance.id, 2),
            Err(ControlError::InvalidTransition {
                from: ServiceStatus::Pending,
                to: ServiceStatus::Scaling
            })
        ));
        assert!(h.lifecycle.in_flight(&instance.id).is_none());
    }

    #[tokio::test]
    async fn test_start_conflicts_with_scale_in_flight() {
        let h = Harness::new(InMemoryRuntime::new().with_scale_delay(Duration::from_millis(100)));
        let instance = h.running("api", 8080).await;

        let scale = controller(&h).scale(instance.id, 2).unwrap();
        match h.executor.deploy(instance.id, OperationKind::Start) {
            Err(ControlError::Conflict { operation, .. }) => assert_eq!(operation, "scale"),
            other => panic!("expected conflict, got {:?}", other.is_ok()),
        }
        scale.wait().await;

        let instance = h.lifecycle.get(&instance.id).unwrap();
        assert_eq!(instance.status, ServiceStatus::Running);
        assert_eq!(instance.config.scaling.current_replicas, 2);
    }

    #[tokio::test]
    async fn test_scale_conflicts_with_start_in_flight() {
        let h = Harness::new(InMemoryRuntime::new().with_build_delay(Duration::from_millis(100)));
        let instance = h.create(new_instance("ws-1", "api", 8080));

        let start = h.executor.deploy(instance.id, OperationKind::Start).unwrap();
        assert!(matches!(
            controller(&h).scale(instance.id, 2),
            Err(ControlError::Conflict { .. })
        ));
        start.wait().await;

        let instance = h.lifecycle.get(&instance.id).unwrap();
        assert_eq!(instance.status, ServiceStatus::Running);
        assert_eq!(instance.config.scaling.current_replicas, 1);
        assert_eq!(instance.config.scaling.target_replicas, 1);
    }

    #[tokio::test]
    async fn test_same_count_is_a_noop() {
        let h = Harness::new(InMemoryRuntime::new());
        let instance = h.running("api", 8080).await;

        let handle = controller(&h).scale(instance.id, 1).unwrap();

        assert!(!handle.is_background());
        assert_eq!(handle.instance().status, ServiceStatus::Running);
        assert!(h.runtime.calls().iter().all(|c| !c.starts_with("scale:")));
    }
}
