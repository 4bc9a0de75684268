//! Deployment scenarios against the in-memory runtime

use super::*;
use crate::error::ControlError;
use crate::events::{BroadcasterConfig, EventBroadcaster};
use crate::lifecycle::{LifecycleManager, OperationKind, ServiceStore};
use crate::models::*;
use crate::observability::StructuredLogger;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

pub(crate) const TEAM: &str = "team-1";

pub(crate) fn config_with_port(host_port: u16) -> DeploymentConfig {
    DeploymentConfig {
        ports: vec![PortMapping {
            container_port: 3000,
            host_port,
            protocol: Protocol::Tcp,
        }],
        env: BTreeMap::new(),
        volumes: Vec::new(),
        resources: ResourceLimits::default(),
        health_check: HealthCheckConfig::default(),
        scaling: ScalingConfig::default(),
        build_file: "FROM node:20-alpine\nCMD [\"node\", \"index.js\"]\n".into(),
        metric_retention: 50,
    }
}

pub(crate) fn new_instance(workspace_id: &str, name: &str, host_port: u16) -> ServiceInstance {
    let now = Utc::now();
    ServiceInstance {
        id: Uuid::new_v4(),
        team_id: TEAM.into(),
        workspace_id: workspace_id.into(),
        name: name.into(),
        folder_path: name.into(),
        service_type: ServiceType::Nodejs,
        confidence: 0.9,
        status: ServiceStatus::Pending,
        container_id: None,
        image_id: None,
        analysis_id: None,
        config: config_with_port(host_port),
        created_at: now,
        updated_at: now,
        deployed_at: None,
        stopped_at: None,
        last_health_check_at: None,
        deleted_at: None,
    }
}

pub(crate) fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        initial_backoff: Duration::from_millis(1),
        ..ExecutorConfig::default()
    }
}

pub(crate) struct Harness {
    pub runtime: Arc<InMemoryRuntime>,
    pub lifecycle: Arc<LifecycleManager>,
    pub executor: Arc<DeploymentExecutor>,
}

impl Harness {
    pub fn new(runtime: InMemoryRuntime) -> Self {
        Self::with_config(runtime, fast_config())
    }

    pub fn with_config(runtime: InMemoryRuntime, config: ExecutorConfig) -> Self {
        let runtime = Arc::new(runtime);
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(ServiceStore::new()),
            Arc::new(EventBroadcaster::new(BroadcasterConfig::default())),
            StructuredLogger::new("test"),
        ));
        let executor = Arc::new(DeploymentExecutor::new(
            runtime.clone() as Arc<dyn ContainerRuntime>,
            Arc::clone(&lifecycle),
            config,
        ));
        Self {
            runtime,
            lifecycle,
            executor,
        }
    }

    pub fn create(&self, instance: ServiceInstance) -> ServiceInstance {
        self.lifecycle.create(instance).unwrap()
    }

    /// Create and deploy to `running`
    pub async fn running(&self, name: &str, host_port: u16) -> ServiceInstance {
        let instance = self.create(new_instance("ws-1", name, host_port));
        self.executor
            .deploy(instance.id, OperationKind::Deploy)
            .unwrap()
            .wait()
            .await;
        let instance = self.lifecycle.get(&instance.id).unwrap();
        assert_eq!(instance.status, ServiceStatus::Running);
        instance
    }

    pub async fn wait_for(&self, id: &ServiceId, status: ServiceStatus) -> ServiceInstance {
        for _ in 0..500 {
            let instance = self.lifecycle.get(id).unwrap();
            if instance.status == status {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("service {} never reached {}", id, status);
    }

    pub fn event_types(&self, id: &ServiceId) -> Vec<DeploymentEventType> {
        self.lifecycle
            .events(id)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

#[tokio::test]
async fn test_deploy_reaches_running() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = h.create(new_instance("ws-1", "billing-api", 8080));
    assert_eq!(instance.status, ServiceStatus::Pending);

    let handle = h.executor.deploy(instance.id, OperationKind::Deploy).unwrap();
    assert!(handle.is_background());
    handle.wait().await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Running);
    assert!(instance.deployed_at.is_some());
    assert!(instance.container_id.is_some());
    assert!(instance.image_id.is_some());
    assert_eq!(instance.config.scaling.current_replicas, 1);

    let types = h.event_types(&instance.id);
    assert_eq!(
        types,
        vec![
            DeploymentEventType::DeploymentStarted,
            DeploymentEventType::BuildCompleted,
            DeploymentEventType::DeploymentCompleted,
        ]
    );
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == DeploymentEventType::DeploymentCompleted)
            .count(),
        1
    );
    assert_eq!(h.lifecycle.port_holder("ws-1", 8080), Some(instance.id));
}

#[tokio::test]
async fn test_transient_build_failures_are_retried() {
    let runtime = InMemoryRuntime::new();
    runtime.fail_next_build(RuntimeError::transient("registry timeout"));
    runtime.fail_next_build(RuntimeError::transient("connection reset"));
    let h = Harness::new(runtime);
    let instance = h.create(new_instance("ws-1", "api", 8080));

    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Running);
    let retries = h
        .event_types(&instance.id)
        .into_iter()
        .filter(|t| *t == DeploymentEventType::BuildRetried)
        .count();
    assert_eq!(retries, 2);
    assert_eq!(h.runtime.calls().iter().filter(|c| *c == "build").count(), 3);
}

#[tokio::test]
async fn test_permanent_build_failure_is_not_retried() {
    let runtime = InMemoryRuntime::new();
    runtime.fail_next_build(RuntimeError::permanent("unknown instruction: FORM"));
    let h = Harness::new(runtime);
    let instance = h.create(new_instance("ws-1", "api", 8080));

    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Error);
    assert_eq!(h.runtime.calls(), vec!["build".to_string()]);

    let events = h.lifecycle.events(&instance.id).unwrap();
    let failed = events.last().unwrap();
    assert_eq!(failed.event_type, DeploymentEventType::DeploymentFailed);
    assert_eq!(failed.severity, EventSeverity::Error);
    assert!(!failed.success);
    assert!(failed.detail.as_deref().unwrap().contains("FORM"));
    // Ports are given back on error
    assert_eq!(h.lifecycle.port_holder("ws-1", 8080), None);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let runtime = InMemoryRuntime::new();
    for _ in 0..5 {
        runtime.fail_next_build(RuntimeError::transient("registry timeout"));
    }
    let h = Harness::new(runtime);
    let instance = h.create(new_instance("ws-1", "api", 8080));

    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;

    assert_eq!(h.lifecycle.get(&instance.id).unwrap().status, ServiceStatus::Error);
    // First attempt plus three retries
    assert_eq!(h.runtime.calls().iter().filter(|c| *c == "build").count(), 4);
}

#[tokio::test]
async fn test_build_timeout_is_permanent_and_cancels() {
    let config = ExecutorConfig {
        build_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let h = Harness::with_config(
        InMemoryRuntime::new().with_build_delay(Duration::from_secs(5)),
        config,
    );
    let instance = h.create(new_instance("ws-1", "api", 8080));

    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;

    assert_eq!(h.lifecycle.get(&instance.id).unwrap().status, ServiceStatus::Error);
    assert!(h.runtime.was_cancelled(&instance.id));
}

#[tokio::test]
async fn test_start_failure_lands_in_error() {
    let runtime = InMemoryRuntime::new();
    runtime.fail_next_start(RuntimeError::permanent("port is already allocated"));
    let h = Harness::new(runtime);
    let instance = h.create(new_instance("ws-1", "api", 8080));

    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Error);
    assert!(instance.deployed_at.is_none());
}

#[tokio::test]
async fn test_second_operation_conflicts_while_deploying() {
    let h = Harness::new(InMemoryRuntime::new().with_build_delay(Duration::from_millis(100)));
    let instance = h.create(new_instance("ws-1", "api", 8080));

    let first = h.executor.deploy(instance.id, OperationKind::Deploy).unwrap();
    match h.executor.restart(instance.id) {
        Err(ControlError::Conflict { operation, .. }) => assert_eq!(operation, "deploy"),
        other => panic!("expected conflict, got {:?}", other.map(|h| h.into_instance().status)),
    }
    assert!(matches!(
        h.executor.deploy(instance.id, OperationKind::Start),
        Err(ControlError::Conflict { .. })
    ));

    first.wait().await;
    assert_eq!(h.lifecycle.get(&instance.id).unwrap().status, ServiceStatus::Running);
}

#[tokio::test]
async fn test_port_race_loser_stays_pending() {
    let h = Harness::new(InMemoryRuntime::new());
    let a = h.create(new_instance("ws-1", "a", 8080));
    let b = h.create(new_instance("ws-1", "b", 8080));

    let first = h.executor.deploy(a.id, OperationKind::Deploy).unwrap();
    let second = h.executor.deploy(b.id, OperationKind::Deploy);

    match second {
        Err(ControlError::PortConflict { port, holder }) => {
            assert_eq!(port, 8080);
            assert_eq!(holder, a.id.to_string());
        }
        other => panic!("expected port conflict, got {:?}", other.is_ok()),
    }
    first.wait().await;

    let b = h.lifecycle.get(&b.id).unwrap();
    assert_eq!(b.status, ServiceStatus::Pending);
    assert_eq!(h.event_types(&b.id), vec![DeploymentEventType::DeploymentFailed]);
    // The loser's slot is free again
    assert!(h.lifecycle.in_flight(&b.id).is_none());
}

#[tokio::test]
async fn test_same_port_in_other_workspace_is_fine() {
    let h = Harness::new(InMemoryRuntime::new());
    let a = h.create(new_instance("ws-1", "a", 8080));
    let b = h.create(new_instance("ws-2", "a", 8080));

    let first = h.executor.deploy(a.id, OperationKind::Deploy).unwrap();
    let second = h.executor.deploy(b.id, OperationKind::Deploy).unwrap();
    first.wait().await;
    second.wait().await;

    assert_eq!(h.lifecycle.get(&b.id).unwrap().status, ServiceStatus::Running);
}

#[tokio::test]
async fn test_stop_running_instance() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = h.running("api", 8080).await;

    h.executor.stop(instance.id).unwrap().wait().await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Stopped);
    assert!(instance.stopped_at.is_some());
    assert_eq!(instance.config.scaling.current_replicas, 0);
    assert_eq!(h.runtime.running_containers(), 0);
    assert_eq!(h.lifecycle.port_holder("ws-1", 8080), None);
    assert_eq!(
        h.event_types(&instance.id).last(),
        Some(&DeploymentEventType::ServiceStopped)
    );
}

#[tokio::test]
async fn test_stop_succeeds_when_runtime_fails() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = h.running("api", 8080).await;
    h.runtime
        .fail_next_stop(RuntimeError::transient("daemon connection reset"));

    h.executor.stop(instance.id).unwrap().wait().await;

    assert_eq!(h.lifecycle.get(&instance.id).unwrap().status, ServiceStatus::Stopped);
    let events = h.lifecycle.events(&instance.id).unwrap();
    let n = events.len();
    assert_eq!(events[n - 2].event_type, DeploymentEventType::StopFailed);
    assert!(!events[n - 2].success);
    assert_eq!(events[n - 1].event_type, DeploymentEventType::ServiceStopped);
}

#[tokio::test]
async fn test_stop_from_pending_and_error() {
    let runtime = InMemoryRuntime::new();
    runtime.fail_next_build(RuntimeError::permanent("bad build file"));
    let h = Harness::new(runtime);

    let pending = h.create(new_instance("ws-1", "pending", 8080));
    h.executor.stop(pending.id).unwrap().wait().await;
    assert_eq!(h.lifecycle.get(&pending.id).unwrap().status, ServiceStatus::Stopped);

    let failed = h.create(new_instance("ws-1", "failed", 8081));
    h.executor
        .deploy(failed.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;
    assert_eq!(h.lifecycle.get(&failed.id).unwrap().status, ServiceStatus::Error);
    h.executor.stop(failed.id).unwrap().wait().await;
    assert_eq!(h.lifecycle.get(&failed.id).unwrap().status, ServiceStatus::Stopped);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = h.running("api", 8080).await;
    h.executor.stop(instance.id).unwrap().wait().await;
    let events_before = h.lifecycle.events(&instance.id).unwrap().len();

    let handle = h.executor.stop(instance.id).unwrap();
    assert!(!handle.is_background());
    assert_eq!(handle.instance().status, ServiceStatus::Stopped);
    assert_eq!(h.lifecycle.events(&instance.id).unwrap().len(), events_before);
}

#[tokio::test]
async fn test_stop_mid_build_cancels_the_deploy() {
    let h = Harness::new(InMemoryRuntime::new().with_build_delay(Duration::from_millis(300)));
    let instance = h.create(new_instance("ws-1", "api", 8080));
    let deploy = h.executor.deploy(instance.id, OperationKind::Deploy).unwrap();
    h.wait_for(&instance.id, ServiceStatus::Building).await;

    h.executor.stop(instance.id).unwrap().wait().await;
    tokio::time::timeout(Duration::from_secs(1), deploy.wait())
        .await
        .expect("cancelled deploy finishes promptly");
    // Past the build delay: the cancelled build must not resume the deploy
    tokio::time::sleep(Duration::from_millis(400)).await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Stopped);
    assert!(h.runtime.was_cancelled(&instance.id));
    assert_eq!(h.lifecycle.port_holder("ws-1", 8080), None);
    assert!(h.lifecycle.in_flight(&instance.id).is_none());
    let types = h.event_types(&instance.id);
    assert!(!types.contains(&DeploymentEventType::BuildCompleted));
    assert_eq!(types.last(), Some(&DeploymentEventType::ServiceStopped));
}

#[tokio::test]
async fn test_stop_during_scale_wins() {
    let h = Harness::new(InMemoryRuntime::new().with_scale_delay(Duration::from_millis(200)));
    let instance = h.running("api", 8080).await;
    let guard = h.lifecycle.begin(instance.id, OperationKind::Scale).unwrap();
    h.lifecycle.transition(&instance.id, ServiceStatus::Scaling).unwrap();
    let scale = h.executor.converge(guard, 3).unwrap();

    h.executor.stop(instance.id).unwrap().wait().await;
    scale.wait().await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Stopped);
    assert_eq!(instance.config.scaling.current_replicas, 0);
}

#[tokio::test]
async fn test_stop_leaves_in_flight_delete_alone() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = h.running("api", 8080).await;
    let delete = h.lifecycle.begin(instance.id, OperationKind::Delete).unwrap();

    let handle = h.executor.stop(instance.id).unwrap();

    assert!(!handle.is_background());
    assert!(!delete.is_cancelled());
    assert_eq!(h.lifecycle.in_flight(&instance.id), Some(OperationKind::Delete));
}

#[tokio::test]
async fn test_restart_running_instance() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = h.running("api", 8080).await;

    h.executor.restart(instance.id).unwrap().wait().await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Running);
    assert_eq!(
        h.event_types(&instance.id).last(),
        Some(&DeploymentEventType::RestartCompleted)
    );
}

#[tokio::test]
async fn test_restart_replaces_extra_replicas() {
    let h = Harness::new(InMemoryRuntime::new());
    let mut instance = new_instance("ws-1", "api", 8080);
    instance.config.scaling.target_replicas = 3;
    let instance = h.create(instance);
    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;
    let calls_before = h.runtime.calls().len();

    h.executor.restart(instance.id).unwrap().wait().await;

    let calls = h.runtime.calls();
    assert_eq!(&calls[calls_before..], &["restart", "scale:1", "scale:3"]);
    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Running);
    assert_eq!(instance.config.scaling.current_replicas, 3);
    assert_eq!(h.runtime.replicas(&instance.id), 3);
}

#[tokio::test]
async fn test_failed_restart_lands_in_error_not_stopped() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = h.running("api", 8080).await;
    h.runtime
        .fail_next_restart(RuntimeError::permanent("container exited with code 1"));

    h.executor.restart(instance.id).unwrap().wait().await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Error);
    let last = h.lifecycle.events(&instance.id).unwrap().pop().unwrap();
    assert_eq!(last.event_type, DeploymentEventType::RestartFailed);
    assert_eq!(last.severity, EventSeverity::Error);
}

#[tokio::test]
async fn test_restart_from_error_redeploys() {
    let runtime = InMemoryRuntime::new();
    runtime.fail_next_build(RuntimeError::permanent("bad build file"));
    let h = Harness::new(runtime);
    let instance = h.create(new_instance("ws-1", "api", 8080));
    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;
    assert_eq!(h.lifecycle.get(&instance.id).unwrap().status, ServiceStatus::Error);

    let handle = h.executor.restart(instance.id).unwrap();
    assert_eq!(handle.instance().status, ServiceStatus::Pending);
    handle.wait().await;

    assert_eq!(h.lifecycle.get(&instance.id).unwrap().status, ServiceStatus::Running);
}

#[tokio::test]
async fn test_restart_rejected_from_pending() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = h.create(new_instance("ws-1", "api", 8080));

    match h.executor.restart(instance.id) {
        Err(ControlError::InvalidTransition { from, to }) => {
            assert_eq!(from, ServiceStatus::Pending);
            assert_eq!(to, ServiceStatus::Restarting);
        }
        other => panic!("expected invalid transition, got {:?}", other.is_ok()),
    }
    assert!(h.lifecycle.events(&instance.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_mid_build_ends_deleted() {
    let h = Harness::new(InMemoryRuntime::new().with_build_delay(Duration::from_secs(10)));
    let instance = h.create(new_instance("ws-1", "api", 8080));
    let deploy = h.executor.deploy(instance.id, OperationKind::Deploy).unwrap();
    h.wait_for(&instance.id, ServiceStatus::Building).await;

    h.executor.delete(instance.id).unwrap().wait().await;
    tokio::time::timeout(Duration::from_secs(1), deploy.wait())
        .await
        .expect("cancelled deploy finishes promptly");

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Deleted);
    assert!(instance.deleted_at.is_some());
    assert!(h.runtime.was_cancelled(&instance.id));
    assert_eq!(h.lifecycle.port_holder("ws-1", 8080), None);
    assert_eq!(
        h.event_types(&instance.id).last(),
        Some(&DeploymentEventType::ServiceDeleted)
    );
    assert!(h.lifecycle.in_flight(&instance.id).is_none());
}

#[tokio::test]
async fn test_delete_when_stop_fails() {
    let h = Harness::new(InMemoryRuntime::new());
    let instance = h.running("api", 8080).await;
    h.runtime.fail_next_stop(RuntimeError::permanent("no such container"));

    h.executor.delete(instance.id).unwrap().wait().await;

    assert_eq!(h.lifecycle.get(&instance.id).unwrap().status, ServiceStatus::Deleted);
    let types = h.event_types(&instance.id);
    assert_eq!(
        &types[types.len() - 2..],
        &[DeploymentEventType::StopFailed, DeploymentEventType::ServiceDeleted]
    );
}

#[tokio::test]
async fn test_deploy_with_replicas_converges() {
    let h = Harness::new(InMemoryRuntime::new());
    let mut instance = new_instance("ws-1", "api", 8080);
    instance.config.scaling.target_replicas = 3;
    let instance = h.create(instance);

    h.executor
        .deploy(instance.id, OperationKind::Deploy)
        .unwrap()
        .wait()
        .await;

    let instance = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Running);
    assert_eq!(instance.config.scaling.current_replicas, 3);
    assert_eq!(h.runtime.replicas(&instance.id), 3);
    assert_eq!(
        h.event_types(&instance.id).last(),
        Some(&DeploymentEventType::ScaleCompleted)
    );
}

#[tokio::test]
async fn test_logs_and_stats_pass_through() {
    let h = Harness::new(InMemoryRuntime::new());
    let pending = h.create(new_instance("ws-1", "pending", 8081));
    assert!(matches!(
        h.executor.logs(&pending.id, 10).await,
        Err(ControlError::Validation(_))
    ));

    let instance = h.running("api", 8080).await;
    h.runtime.set_stats(ResourceSample {
        cpu_percent: 12.0,
        ..ResourceSample::default()
    });

    let logs = h.executor.logs(&instance.id, 2).await.unwrap();
    assert_eq!(logs.lines().count(), 2);
    let stats = h.executor.stats(&instance.id).await.unwrap();
    assert_eq!(stats.cpu_percent, 12.0);

    // Diagnostics never touch lifecycle state
    let after = h.lifecycle.get(&instance.id).unwrap();
    assert_eq!(after.updated_at, instance.updated_at);
    assert_eq!(after.status, ServiceStatus::Running);
}

#[test]
fn test_folder_resolution() {
    let h = Harness::with_config(
        InMemoryRuntime::new(),
        ExecutorConfig {
            workspace_root: Some("/srv/workspaces".into()),
            ..fast_config()
        },
    );
    let instance = new_instance("ws-1", "shop/web", 8080);
    assert_eq!(
        h.executor.folder_of(&instance),
        std::path::PathBuf::from("/srv/workspaces/ws-1/shop/web")
    );
}
