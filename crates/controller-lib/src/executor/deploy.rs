//! Background deployment operations
//!
//! Every public operation claims the instance's single-writer slot, makes
//! the synchronous checks, then hands the slow runtime calls to a spawned
//! task. Outcomes come back as lifecycle transitions plus deployment events.
//! `stop` and `delete` never wait for a slot: they cancel the holder.

use super::{ContainerRuntime, ScaleOutcome, ServiceRef};
use crate::error::{ControlError, Result, RuntimeError};
use crate::lifecycle::{LifecycleManager, OperationGuard, OperationKind};
use crate::models::{
    DeploymentEventType, NewEvent, ResourceSample, ServiceId, ServiceInstance, ServiceStatus,
};
use crate::observability::ControllerMetrics;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Configuration for the deployment executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Root that workspace folders resolve under; folder paths are used as given when unset
    pub workspace_root: Option<PathBuf>,
    pub build_timeout: Duration,
    pub deploy_timeout: Duration,
    pub stop_timeout: Duration,
    /// Retries after the first attempt, transient failures only
    pub max_build_retries: u32,
    /// Doubled after every retry
    pub initial_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            build_timeout: Duration::from_secs(600),
            deploy_timeout: Duration::from_secs(120),
            stop_timeout: Duration::from_secs(30),
            max_build_retries: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

/// An accepted operation: the instance as of acceptance plus the background task
#[derive(Debug)]
pub struct OperationHandle {
    instance: ServiceInstance,
    task: Option<JoinHandle<()>>,
}

impl OperationHandle {
    pub(crate) fn spawned(instance: ServiceInstance, task: JoinHandle<()>) -> Self {
        Self {
            instance,
            task: Some(task),
        }
    }

    /// Nothing left to do in the background
    pub(crate) fn completed(instance: ServiceInstance) -> Self {
        Self {
            instance,
            task: None,
        }
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    pub fn into_instance(self) -> ServiceInstance {
        self.instance
    }

    pub fn is_background(&self) -> bool {
        self.task.is_some()
    }

    /// Wait for the background part to finish
    pub async fn wait(self) {
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                warn!(service_id = %self.instance.id, error = %e, "Background operation panicked");
            }
        }
    }
}

/// Runs build, start, stop, restart, scale and delete against the runtime
pub struct DeploymentExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    lifecycle: Arc<LifecycleManager>,
    config: ExecutorConfig,
    metrics: ControllerMetrics,
}

impl DeploymentExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        lifecycle: Arc<LifecycleManager>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            runtime,
            lifecycle,
            config,
            metrics: ControllerMetrics::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Resolved on-disk folder of an instance
    pub fn folder_of(&self, instance: &ServiceInstance) -> PathBuf {
        match &self.config.workspace_root {
            Some(root) => root.join(&instance.workspace_id).join(&instance.folder_path),
            None => PathBuf::from(&instance.folder_path),
        }
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Build and start an instance that is pending, stopped or in error
    pub fn deploy(self: &Arc<Self>, id: ServiceId, kind: OperationKind) -> Result<OperationHandle> {
        let guard = self.lifecycle.begin(id, kind)?;
        self.deploy_with(guard)
    }

    fn deploy_with(self: &Arc<Self>, guard: OperationGuard) -> Result<OperationHandle> {
        let id = guard.id();
        let kind = guard.kind();
        let instance = self.lifecycle.get(&id)?;
        if !matches!(
            instance.status,
            ServiceStatus::Pending | ServiceStatus::Stopped | ServiceStatus::Error
        ) {
            return Err(ControlError::InvalidTransition {
                from: instance.status,
                to: ServiceStatus::Building,
            });
        }

        // Bind-time check: the loser of a race for a host port stays put
        if let Err(e) = self.lifecycle.reserve_ports(&instance) {
            self.lifecycle
                .record_event(&id, NewEvent::failure(DeploymentEventType::DeploymentFailed, e.to_string()))?;
            self.metrics.record_operation(kind.as_str(), "rejected");
            return Err(e);
        }

        let instance = if instance.status == ServiceStatus::Pending {
            instance
        } else {
            match self.lifecycle.transition(&id, ServiceStatus::Pending) {
                Ok(instance) => instance,
                Err(e) => {
                    self.lifecycle.release_ports(&instance);
                    return Err(e);
                }
            }
        };

        self.metrics.record_operation(kind.as_str(), "accepted");
        info!(service_id = %id, operation = %kind, "Deployment accepted");

        let executor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = until_cancelled(&guard, executor.run_deploy(&guard)).await;
            executor.finish(&guard, outcome);
        });
        Ok(OperationHandle::spawned(instance, task))
    }

    async fn run_deploy(&self, guard: &OperationGuard) -> Result<ServiceInstance> {
        let id = guard.id();
        let started = Instant::now();

        let (instance, _) = self.lifecycle.transition_with_event(
            &id,
            ServiceStatus::Building,
            NewEvent::info(DeploymentEventType::DeploymentStarted),
            |_| {},
        )?;
        let service = ServiceRef::new(instance.id, instance.name.clone());
        let folder = self.folder_of(&instance);

        let build_started = Instant::now();
        let built = timeout(
            self.config.build_timeout,
            self.build_with_retries(&id, &service, &folder, &instance.config.build_file),
        )
        .await;
        let image = match built {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => return Err(self.fail(&id, DeploymentEventType::DeploymentFailed, e, started)),
            Err(_) => {
                self.cancel_quietly(&service).await;
                let e = RuntimeError::permanent(format!(
                    "build timed out after {}s",
                    self.config.build_timeout.as_secs()
                ));
                return Err(self.fail(&id, DeploymentEventType::DeploymentFailed, e, started));
            }
        };
        let build_time = build_started.elapsed();
        self.metrics.observe_build_duration(build_time.as_secs_f64());
        self.lifecycle.record_event(
            &id,
            NewEvent::info(DeploymentEventType::BuildCompleted)
                .with_duration(build_time)
                .with_detail(image.clone()),
        )?;

        let instance = self.lifecycle.transition_with(&id, ServiceStatus::Deploying, |i| {
            i.image_id = Some(image.clone());
        })?;

        let container = match timeout(
            self.config.deploy_timeout,
            self.runtime.start(&service, &image, &instance.config),
        )
        .await
        {
            Ok(Ok(container)) => container,
            Ok(Err(e)) => return Err(self.fail(&id, DeploymentEventType::DeploymentFailed, e, started)),
            Err(_) => {
                self.cancel_quietly(&service).await;
                let e = RuntimeError::permanent(format!(
                    "start timed out after {}s",
                    self.config.deploy_timeout.as_secs()
                ));
                return Err(self.fail(&id, DeploymentEventType::DeploymentFailed, e, started));
            }
        };

        let (instance, _) = self.lifecycle.transition_with_event(
            &id,
            ServiceStatus::Running,
            NewEvent::info(DeploymentEventType::DeploymentCompleted)
                .with_duration(started.elapsed())
                .with_detail(container.clone()),
            |i| {
                i.container_id = Some(container);
                i.config.scaling.current_replicas = 1;
            },
        )?;

        let target = instance.config.scaling.target_replicas;
        if target > 1 {
            self.lifecycle.transition(&id, ServiceStatus::Scaling)?;
            return self.run_converge(&id, &service, target).await;
        }
        Ok(instance)
    }

    async fn build_with_retries(
        &self,
        id: &ServiceId,
        service: &ServiceRef,
        folder: &std::path::Path,
        build_file: &str,
    ) -> std::result::Result<String, RuntimeError> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.runtime.build(service, folder, build_file).await {
                Ok(image) => return Ok(image),
                Err(e) if e.is_transient() && attempt <= self.config.max_build_retries => {
                    self.metrics.record_runtime_error("transient");
                    let detail = format!(
                        "attempt {} failed: {}; retrying in {}ms",
                        attempt,
                        e.message,
                        backoff.as_millis()
                    );
                    self.lifecycle
                        .record_event(id, NewEvent::warning(DeploymentEventType::BuildRetried, detail))
                        .map_err(|le| RuntimeError::permanent(le.to_string()))?;
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Restart ────────────────────────────────────────────────────

    /// Restart a running instance; from stopped or error this is a redeploy
    pub fn restart(self: &Arc<Self>, id: ServiceId) -> Result<OperationHandle> {
        let guard = self.lifecycle.begin(id, OperationKind::Restart)?;
        let instance = self.lifecycle.get(&id)?;

        let container = match (instance.status, instance.container_id.clone()) {
            (ServiceStatus::Stopped | ServiceStatus::Error, _) => return self.deploy_with(guard),
            (ServiceStatus::Running, Some(container)) => container,
            (from, _) => {
                return Err(ControlError::InvalidTransition {
                    from,
                    to: ServiceStatus::Restarting,
                })
            }
        };

        let instance = self.lifecycle.transition(&id, ServiceStatus::Restarting)?;
        self.metrics.record_operation(OperationKind::Restart.as_str(), "accepted");

        let executor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = until_cancelled(&guard, executor.run_restart(&guard, &container)).await;
            executor.finish(&guard, outcome);
        });
        Ok(OperationHandle::spawned(instance, task))
    }

    async fn run_restart(&self, guard: &OperationGuard, container: &str) -> Result<ServiceInstance> {
        let id = guard.id();
        let started = Instant::now();
        let result = match timeout(self.config.deploy_timeout, self.runtime.restart(container)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::permanent(format!(
                "restart timed out after {}s",
                self.config.deploy_timeout.as_secs()
            ))),
        };

        if let Err(e) = result {
            return Err(self.fail(&id, DeploymentEventType::RestartFailed, e, started));
        }

        let instance = self.lifecycle.get(&id)?;
        let replicas = instance.config.scaling.current_replicas;
        if replicas > 1 {
            let service = ServiceRef::new(instance.id, instance.name.clone());
            if let Some(detail) = self.recycle_replicas(&id, &service, replicas).await? {
                self.lifecycle
                    .record_event(&id, NewEvent::failure(DeploymentEventType::ScalePartial, detail))?;
            }
        }

        let (instance, _) = self.lifecycle.transition_with_event(
            &id,
            ServiceStatus::Running,
            NewEvent::info(DeploymentEventType::RestartCompleted).with_duration(started.elapsed()),
            |_| {},
        )?;
        Ok(instance)
    }

    /// Replace every replica besides the primary with a fresh one.
    ///
    /// Returns a description of the shortfall when fewer than `replicas`
    /// are running afterwards.
    async fn recycle_replicas(
        &self,
        id: &ServiceId,
        service: &ServiceRef,
        replicas: u32,
    ) -> Result<Option<String>> {
        let mut current = replicas;
        let mut failure = None;
        for target in [1, replicas] {
            match timeout(self.config.deploy_timeout, self.runtime.scale(service, target)).await {
                Ok(Ok(ScaleOutcome::Complete)) => current = target,
                Ok(Ok(ScaleOutcome::Partial(reached))) => {
                    current = reached;
                    failure = Some(format!("runtime reached {} of {} replicas", reached, replicas));
                }
                Ok(Err(e)) => {
                    self.metrics.record_runtime_error(&e.kind.to_string());
                    failure = Some(format!("replacing replicas failed: {}", e.message));
                }
                Err(_) => failure = Some("replacing replicas timed out".to_string()),
            }
            if failure.is_some() {
                break;
            }
        }
        self.lifecycle
            .update(id, |i| i.config.scaling.current_replicas = current)?;
        Ok(failure)
    }

    // ── Stop ───────────────────────────────────────────────────────

    /// Stop an instance. The instance always ends `stopped`; a runtime
    /// failure is recorded as a `stop_failed` event.
    ///
    /// An in-flight detect, deploy, restart, scale or update is cancelled
    /// first. A stop or delete already in flight is left to finish.
    pub fn stop(self: &Arc<Self>, id: ServiceId) -> Result<OperationHandle> {
        let instance = self.lifecycle.get(&id)?;
        if matches!(instance.status, ServiceStatus::Stopped | ServiceStatus::Deleted) {
            debug!(service_id = %id, status = %instance.status, "Stop is a no-op");
            return Ok(OperationHandle::completed(instance));
        }

        let spared = [OperationKind::Stop, OperationKind::Delete];
        let (guard, preempted) = match self.lifecycle.preempt_unless(id, OperationKind::Stop, &spared) {
            Ok(claimed) => claimed,
            Err(holder) => {
                debug!(service_id = %id, holder = %holder, "Stop already covered by in-flight operation");
                return Ok(OperationHandle::completed(self.lifecycle.get(&id)?));
            }
        };
        let instance = self.lifecycle.get(&id)?;
        self.metrics.record_operation(OperationKind::Stop.as_str(), "accepted");

        let executor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = until_cancelled(&guard, executor.run_stop(&guard, preempted)).await;
            executor.finish(&guard, outcome);
        });
        Ok(OperationHandle::spawned(instance, task))
    }

    async fn run_stop(&self, guard: &OperationGuard, preempted: bool) -> Result<ServiceInstance> {
        let id = guard.id();
        let instance = self.lifecycle.get(&id)?;
        let started = Instant::now();

        let mut failures = Vec::new();
        if let Err(e) = self.stop_containers(&instance).await {
            self.metrics.record_runtime_error(&e.kind.to_string());
            failures.push(e.to_string());
        }
        // A cancelled build or start may still be running inside the engine
        if preempted {
            let service = ServiceRef::new(instance.id, instance.name.clone());
            if let Err(e) = self.runtime.cancel(&service).await {
                failures.push(e.to_string());
            }
        }
        if !failures.is_empty() {
            self.lifecycle.record_event(
                &id,
                NewEvent::failure(DeploymentEventType::StopFailed, failures.join("; ")),
            )?;
        }

        let (instance, _) = self.lifecycle.transition_with_event(
            &id,
            ServiceStatus::Stopped,
            NewEvent::info(DeploymentEventType::ServiceStopped).with_duration(started.elapsed()),
            |i| i.config.scaling.current_replicas = 0,
        )?;
        Ok(instance)
    }

    /// Scale extra replicas away, then stop the primary container
    async fn stop_containers(&self, instance: &ServiceInstance) -> std::result::Result<(), RuntimeError> {
        let Some(container) = instance.container_id.as_deref() else {
            return Ok(());
        };
        if instance.config.scaling.current_replicas > 1 {
            let service = ServiceRef::new(instance.id, instance.name.clone());
            if let Err(e) = self.runtime.scale(&service, 1).await {
                warn!(service_id = %instance.id, error = %e, "Failed to remove extra replicas");
            }
        }
        match timeout(self.config.stop_timeout, self.runtime.stop(container)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::transient(format!(
                "stop timed out after {}s",
                self.config.stop_timeout.as_secs()
            ))),
        }
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Cancel whatever is in flight, stop best-effort, then mark `deleted`
    pub fn delete(self: &Arc<Self>, id: ServiceId) -> Result<OperationHandle> {
        let instance = self.lifecycle.get(&id)?;
        if instance.is_deleted() {
            return Ok(OperationHandle::completed(instance));
        }

        let guard = self.lifecycle.preempt(id, OperationKind::Delete);
        self.metrics.record_operation(OperationKind::Delete.as_str(), "accepted");

        let executor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = executor.run_delete(&guard).await;
            executor.finish(&guard, Some(outcome));
        });
        Ok(OperationHandle::spawned(instance, task))
    }

    async fn run_delete(&self, guard: &OperationGuard) -> Result<ServiceInstance> {
        let id = guard.id();
        let instance = self.lifecycle.get(&id)?;
        let service = ServiceRef::new(instance.id, instance.name.clone());

        let mut failures = Vec::new();
        if let Err(e) = self.stop_containers(&instance).await {
            failures.push(e.to_string());
        }
        if let Err(e) = self.runtime.cancel(&service).await {
            failures.push(e.to_string());
        }
        if !failures.is_empty() {
            self.lifecycle.record_event(
                &id,
                NewEvent::failure(DeploymentEventType::StopFailed, failures.join("; ")),
            )?;
        }

        let (instance, _) = self.lifecycle.transition_with_event(
            &id,
            ServiceStatus::Deleted,
            NewEvent::info(DeploymentEventType::ServiceDeleted),
            |i| i.config.scaling.current_replicas = 0,
        )?;
        Ok(instance)
    }

    // ── Scale ──────────────────────────────────────────────────────

    /// Converge an instance already in `scaling` to `target` replicas
    pub(crate) fn converge(self: &Arc<Self>, guard: OperationGuard, target: u32) -> Result<OperationHandle> {
        let id = guard.id();
        let instance = self.lifecycle.get(&id)?;
        if instance.status != ServiceStatus::Scaling {
            return Err(ControlError::Internal(format!(
                "converge requires a scaling instance, found {}",
                instance.status
            )));
        }
        let service = ServiceRef::new(instance.id, instance.name.clone());

        let executor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = until_cancelled(&guard, executor.run_converge(&id, &service, target)).await;
            executor.finish(&guard, outcome);
        });
        Ok(OperationHandle::spawned(instance, task))
    }

    /// One replica at a time, recording the count after every step
    async fn run_converge(&self, id: &ServiceId, service: &ServiceRef, target: u32) -> Result<ServiceInstance> {
        let started = Instant::now();
        let mut current = self.lifecycle.get(id)?.config.scaling.current_replicas;
        let mut failure = None;

        while current != target {
            let next = if current < target { current + 1 } else { current - 1 };
            match timeout(self.config.deploy_timeout, self.runtime.scale(service, next)).await {
                Ok(Ok(ScaleOutcome::Complete)) => current = next,
                Ok(Ok(ScaleOutcome::Partial(reached))) => {
                    current = reached;
                    failure = Some(format!("runtime reached {} of {} replicas", reached, target));
                }
                Ok(Err(e)) => {
                    self.metrics.record_runtime_error(&e.kind.to_string());
                    failure = Some(format!("scaling to {} failed: {}", next, e.message));
                }
                Err(_) => failure = Some(format!("scaling to {} timed out", next)),
            }
            self.lifecycle
                .update(id, |i| i.config.scaling.current_replicas = current)?;
            if failure.is_some() {
                break;
            }
        }

        let event = match failure {
            None => NewEvent::info(DeploymentEventType::ScaleCompleted)
                .with_detail(format!("{} replicas", current)),
            Some(detail) => NewEvent::failure(DeploymentEventType::ScalePartial, detail),
        };
        let (instance, _) = self.lifecycle.transition_with_event(
            id,
            ServiceStatus::Running,
            event.with_duration(started.elapsed()),
            |i| i.config.scaling.target_replicas = target,
        )?;
        Ok(instance)
    }

    // ── Diagnostics ────────────────────────────────────────────────

    pub async fn logs(&self, id: &ServiceId, lines: usize) -> Result<String> {
        let container = self.container_of(id)?;
        Ok(self.runtime.logs(&container, lines).await?)
    }

    pub async fn stats(&self, id: &ServiceId) -> Result<ResourceSample> {
        let container = self.container_of(id)?;
        Ok(self.runtime.stats(&container).await?)
    }

    fn container_of(&self, id: &ServiceId) -> Result<String> {
        let instance = self.lifecycle.get(id)?;
        instance.container_id.ok_or_else(|| {
            ControlError::Validation(format!("service {} has no container", instance.name))
        })
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Move the instance to `error` with a failure event
    fn fail(
        &self,
        id: &ServiceId,
        event_type: DeploymentEventType,
        error: RuntimeError,
        started: Instant,
    ) -> ControlError {
        self.metrics.record_runtime_error(&error.kind.to_string());
        let event = NewEvent::failure(event_type, error.message.clone()).with_duration(started.elapsed());
        if let Err(e) = self
            .lifecycle
            .transition_with_event(id, ServiceStatus::Error, event, |_| {})
        {
            warn!(service_id = %id, error = %e, "Failed to record operation failure");
        }
        ControlError::Runtime(error)
    }

    async fn cancel_quietly(&self, service: &ServiceRef) {
        if let Err(e) = self.runtime.cancel(service).await {
            warn!(service_id = %service.id, error = %e, "Runtime cancel failed");
        }
    }

    fn finish(&self, guard: &OperationGuard, outcome: Option<Result<ServiceInstance>>) {
        let kind = guard.kind();
        match outcome {
            None => {
                self.metrics.record_operation(kind.as_str(), "cancelled");
                info!(service_id = %guard.id(), operation = %kind, "Operation cancelled");
            }
            Some(Ok(instance)) => {
                self.metrics.record_operation(kind.as_str(), "succeeded");
                debug!(service_id = %instance.id, operation = %kind, status = %instance.status, "Operation finished");
            }
            Some(Err(ControlError::Runtime(_))) => {
                self.metrics.record_operation(kind.as_str(), "failed");
            }
            Some(Err(e)) => {
                self.metrics.record_operation(kind.as_str(), "failed");
                warn!(service_id = %guard.id(), operation = %kind, error = %e, "Operation aborted");
            }
        }
    }
}

/// Run `fut` unless the guard is cancelled first
pub(crate) async fn until_cancelled<T>(guard: &OperationGuard, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = guard.cancelled() => None,
        out = fut => Some(out),
    }
}
