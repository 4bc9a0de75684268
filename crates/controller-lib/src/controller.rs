//! Control plane facade
//!
//! Wires analysis, configuration building, the lifecycle manager, the executor, the
//! scaling controller and the monitor together. Every call that names an
//! instance checks team ownership first.

use crate::analyzer::TopologyAnalyzer;
use crate::error::{ControlError, Result};
use crate::events::{BroadcasterConfig, EventBroadcaster, ServiceEvent};
use crate::executor::{
    until_cancelled, ContainerRuntime, DeploymentExecutor, ExecutorConfig, OperationHandle,
};
use crate::health::{components, HealthRegistry};
use crate::lifecycle::{LifecycleManager, OperationKind, ServiceStore, StateFile};
use crate::models::{
    CreateServiceRequest, DeploymentConfig, DeploymentEvent, DeploymentEventType,
    DeploymentOverrides, HealthCheckConfig, NewEvent, ResourceLimits, ResourceUtilization,
    ScalingConfig, ServiceId, ServiceInstance, ServiceRecommendation, ServiceStatus,
    ServiceStatusReport, TopologyAnalysis, UpdateServiceRequest,
};
use crate::monitor::{HealthProbe, HealthReport, MonitorConfig, MonitorLoop, NetworkProbe};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::scaling::ScalingController;
use crate::spec_builder::{SpecBuilder, DEFAULT_METRIC_RETENTION};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_NAME_LEN: usize = 63;
const MAX_LOG_LINES: usize = 10_000;

/// Configuration for the service controller
#[derive(Debug, Clone)]
pub struct ServiceControllerConfig {
    /// Name this controller logs under
    pub instance_name: String,
    pub executor: ExecutorConfig,
    pub monitor: MonitorConfig,
    pub broadcaster: BroadcasterConfig,
    pub default_metric_retention: usize,
    /// Host the health probe connects to for published ports
    pub probe_host: String,
    /// Instances and events are flushed here when set
    pub state_file: Option<PathBuf>,
    pub flush_interval: Duration,
}

impl Default for ServiceControllerConfig {
    fn default() -> Self {
        Self {
            instance_name: "fas-controller".to_string(),
            executor: ExecutorConfig::default(),
            monitor: MonitorConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            default_metric_retention: DEFAULT_METRIC_RETENTION,
            probe_host: "127.0.0.1".to_string(),
            state_file: None,
            flush_interval: Duration::from_secs(5),
        }
    }
}

pub struct ServiceController {
    analyzer: TopologyAnalyzer,
    specs: SpecBuilder,
    lifecycle: Arc<LifecycleManager>,
    executor: Arc<DeploymentExecutor>,
    scaling: ScalingController,
    monitor: Arc<MonitorLoop>,
    state_file: Option<StateFile>,
    flush_interval: Duration,
    metrics: ControllerMetrics,
}

impl ServiceController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ServiceControllerConfig) -> Self {
        let probe = Arc::new(NetworkProbe::new(config.probe_host.clone(), Arc::clone(&runtime)));
        Self::with_probe(runtime, probe, config)
    }

    pub fn with_probe(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
        config: ServiceControllerConfig,
    ) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new(config.broadcaster));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(ServiceStore::new()),
            broadcaster,
            StructuredLogger::new(config.instance_name),
        ));
        let executor = Arc::new(DeploymentExecutor::new(
            Arc::clone(&runtime),
            Arc::clone(&lifecycle),
            config.executor.clone(),
        ));
        let monitor = Arc::new(MonitorLoop::new(
            Arc::clone(&lifecycle),
            runtime,
            probe,
            config.monitor,
        ));

        Self {
            analyzer: TopologyAnalyzer::new(config.executor.workspace_root),
            specs: SpecBuilder::new(config.default_metric_retention),
            scaling: ScalingController::new(Arc::clone(&executor)),
            lifecycle,
            executor,
            monitor,
            state_file: config.state_file.map(StateFile::new),
            flush_interval: config.flush_interval,
            metrics: ControllerMetrics::new(),
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn monitor(&self) -> &Arc<MonitorLoop> {
        &self.monitor
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.executor.runtime()
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        self.lifecycle.broadcaster()
    }

    // ── Analysis ───────────────────────────────────────────────────

    pub async fn analyze(&self, workspace_id: &str, folder_path: &str) -> Result<Arc<TopologyAnalysis>> {
        let analysis = self.analyzer.analyze(workspace_id, folder_path).await?;
        self.metrics.inc_analyses();
        self.lifecycle.logger().log_analysis(&analysis);
        Ok(analysis)
    }

    /// Recorded analyses of a folder, oldest first
    pub fn analyses(&self, workspace_id: &str, folder_path: &str) -> Vec<Arc<TopologyAnalysis>> {
        self.analyzer.history(workspace_id, folder_path)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Create an instance. With a recommendation it starts `pending`;
    /// without one it starts `detecting` and the folder is analyzed in the
    /// background.
    pub fn create(self: &Arc<Self>, team_id: &str, request: CreateServiceRequest) -> Result<OperationHandle> {
        if team_id.trim().is_empty() {
            return Err(ControlError::Validation("team id must not be empty".into()));
        }
        self.analyzer
            .resolve_folder(&request.workspace_id, &request.folder_path)?;

        let CreateServiceRequest {
            workspace_id,
            folder_path,
            name,
            recommendation,
            overrides,
        } = request;

        let now = Utc::now();
        let mut instance = ServiceInstance {
            id: Uuid::new_v4(),
            team_id: team_id.to_string(),
            name: String::new(),
            folder_path,
            service_type: Default::default(),
            confidence: 0.0,
            status: ServiceStatus::Detecting,
            container_id: None,
            image_id: None,
            analysis_id: None,
            config: self.placeholder_config(),
            created_at: now,
            updated_at: now,
            deployed_at: None,
            stopped_at: None,
            last_health_check_at: None,
            deleted_at: None,
            workspace_id,
        };

        match &recommendation {
            Some(rec) => {
                let others = self.lifecycle.store().list_workspace(&instance.workspace_id);
                instance.config = self.specs.build(rec, &overrides, &others)?;
                instance.name = name.unwrap_or_else(|| rec.name.clone());
                instance.service_type = rec.service_type;
                instance.confidence = rec.confidence;
                instance.analysis_id = self
                    .analyzer
                    .latest(&instance.workspace_id, &instance.folder_path)
                    .filter(|a| a.recommendations.contains(rec))
                    .map(|a| a.id);
                instance.status = ServiceStatus::Pending;
            }
            None => {
                instance.name = name.unwrap_or_else(|| default_name(&instance.folder_path));
            }
        }
        validate_name(&instance.name)?;

        let instance = self.lifecycle.create(instance)?;
        info!(
            service_id = %instance.id,
            name = %instance.name,
            workspace_id = %instance.workspace_id,
            status = %instance.status,
            "Service created"
        );

        if recommendation.is_some() {
            return Ok(OperationHandle::completed(instance));
        }
        let guard = self.lifecycle.begin(instance.id, OperationKind::Detect)?;
        let controller = Arc::clone(self);
        let accepted = instance.clone();
        let task = tokio::spawn(async move {
            let outcome = until_cancelled(&guard, controller.run_detection(&instance, &overrides)).await;
            let result = match outcome {
                None => "cancelled",
                Some(Ok(_)) => "succeeded",
                Some(Err(_)) => "failed",
            };
            controller.metrics.record_operation(OperationKind::Detect.as_str(), result);
            drop(guard);
        });
        Ok(OperationHandle::spawned(accepted, task))
    }

    async fn run_detection(
        &self,
        instance: &ServiceInstance,
        overrides: &DeploymentOverrides,
    ) -> Result<ServiceInstance> {
        let started = Instant::now();
        match self.detect(instance, overrides).await {
            Ok((rec, analysis_id, config)) => {
                let event = NewEvent::info(DeploymentEventType::DetectionCompleted)
                    .with_duration(started.elapsed())
                    .with_detail(format!(
                        "{} service in '{}', confidence {:.2}",
                        rec.service_type, rec.folder_path, rec.confidence
                    ));
                let (instance, _) = self.lifecycle.transition_with_event(
                    &instance.id,
                    ServiceStatus::Pending,
                    event,
                    |i| {
                        i.folder_path = rec.folder_path.clone();
                        i.service_type = rec.service_type;
                        i.confidence = rec.confidence;
                        i.analysis_id = Some(analysis_id);
                        i.config = config;
                    },
                )?;
                Ok(instance)
            }
            Err(e) => {
                warn!(service_id = %instance.id, error = %e, "Service detection failed");
                let event = NewEvent::failure(DeploymentEventType::DetectionFailed, e.to_string())
                    .with_duration(started.elapsed());
                self.lifecycle
                    .transition_with_event(&instance.id, ServiceStatus::Error, event, |_| {})?;
                Err(e)
            }
        }
    }

    /// The recommendation for the instance's own folder, or the top-ranked one
    async fn detect(
        &self,
        instance: &ServiceInstance,
        overrides: &DeploymentOverrides,
    ) -> Result<(ServiceRecommendation, Uuid, DeploymentConfig)> {
        let analysis = self
            .analyze(&instance.workspace_id, &instance.folder_path)
            .await?;
        let rec = analysis
            .recommendations
            .iter()
            .find(|r| r.folder_path == instance.folder_path)
            .or_else(|| analysis.recommendations.first())
            .ok_or_else(|| {
                ControlError::Validation(format!(
                    "no deployable service detected in '{}'",
                    instance.folder_path
                ))
            })?;

        let others: Vec<ServiceInstance> = self
            .lifecycle
            .store()
            .list_workspace(&instance.workspace_id)
            .into_iter()
            .filter(|o| o.id != instance.id)
            .collect();
        if let Some(other) = others.iter().find(|o| o.folder_path == rec.folder_path) {
            return Err(ControlError::Validation(format!(
                "folder '{}' is already served by {}",
                rec.folder_path, other.id
            )));
        }
        let config = self.specs.build(rec, overrides, &others)?;
        Ok((rec.clone(), analysis.id, config))
    }

    pub fn get(&self, team_id: &str, id: &ServiceId) -> Result<ServiceInstance> {
        self.lifecycle.store().authorize(team_id, id)
    }

    /// Non-deleted instances of the team, oldest first
    pub fn list(&self, team_id: &str) -> Vec<ServiceInstance> {
        self.lifecycle.store().list_team(team_id)
    }

    /// Merge overrides into the current configuration and optionally rename
    pub fn update(
        &self,
        team_id: &str,
        id: ServiceId,
        request: UpdateServiceRequest,
    ) -> Result<ServiceInstance> {
        self.authorize(team_id, &id)?;
        let _guard = self.lifecycle.begin(id, OperationKind::Update)?;

        let current = self.lifecycle.get(&id)?;
        if current.is_deleted() {
            return Err(ControlError::Validation(format!("service {} is deleted", id)));
        }

        let others = self.lifecycle.store().list_workspace(&current.workspace_id);
        let config = self
            .specs
            .apply(&current.config, &request.overrides, &others, Some(id))?;
        if current.status == ServiceStatus::Running
            && !config.host_ports().eq(current.config.host_ports())
        {
            return Err(ControlError::Validation(
                "host ports of a running service cannot change; stop it first".into(),
            ));
        }

        let mut changed = changed_sections(&current.config, &config);
        if let Some(name) = request.name.as_deref().filter(|n| *n != current.name) {
            validate_name(name)?;
            self.lifecycle.rename(&id, name)?;
            changed.push("name");
        }
        if changed.is_empty() {
            return Ok(current);
        }

        self.lifecycle.update(&id, |i| i.config = config)?;
        self.lifecycle.record_event(
            &id,
            NewEvent::info(DeploymentEventType::ConfigUpdated).with_detail(changed.join(", ")),
        )?;
        self.lifecycle.get(&id)
    }

    pub fn delete(&self, team_id: &str, id: ServiceId) -> Result<OperationHandle> {
        self.authorize(team_id, &id)?;
        let handle = self.executor.delete(id)?;
        self.monitor.forget(&id);
        Ok(handle)
    }

    pub fn start(&self, team_id: &str, id: ServiceId) -> Result<OperationHandle> {
        self.authorize(team_id, &id)?;
        self.executor.deploy(id, OperationKind::Start)
    }

    pub fn stop(&self, team_id: &str, id: ServiceId) -> Result<OperationHandle> {
        self.authorize(team_id, &id)?;
        let handle = self.executor.stop(id)?;
        self.monitor.tracker().reset(&id);
        Ok(handle)
    }

    pub fn restart(&self, team_id: &str, id: ServiceId) -> Result<OperationHandle> {
        self.authorize(team_id, &id)?;
        self.executor.restart(id)
    }

    pub fn scale(&self, team_id: &str, id: ServiceId, replicas: u32) -> Result<OperationHandle> {
        self.authorize(team_id, &id)?;
        self.scaling.scale(id, replicas)
    }

    pub fn status(&self, team_id: &str, id: &ServiceId) -> Result<ServiceStatusReport> {
        let instance = self.authorize(team_id, id)?;
        let health = self.monitor.tracker().report(id);
        Ok(ServiceStatusReport {
            service_id: instance.id,
            name: instance.name,
            status: instance.status,
            health: health.status,
            degraded: health.degraded,
            operation: self.lifecycle.in_flight(id).map(|k| k.as_str().to_string()),
            current_replicas: instance.config.scaling.current_replicas,
            target_replicas: instance.config.scaling.target_replicas,
            deployed_at: instance.deployed_at,
            last_health_check_at: instance.last_health_check_at,
            updated_at: instance.updated_at,
        })
    }

    pub async fn logs(&self, team_id: &str, id: &ServiceId, lines: usize) -> Result<String> {
        self.authorize(team_id, id)?;
        self.executor.logs(id, lines.clamp(1, MAX_LOG_LINES)).await
    }

    pub fn metrics(&self, team_id: &str, id: &ServiceId) -> Result<ResourceUtilization> {
        self.authorize(team_id, id)?;
        Ok(self.monitor.samples().utilization(id))
    }

    pub fn health(&self, team_id: &str, id: &ServiceId) -> Result<HealthReport> {
        self.authorize(team_id, id)?;
        Ok(self.monitor.tracker().report(id))
    }

    pub fn events(&self, team_id: &str, id: &ServiceId) -> Result<Vec<DeploymentEvent>> {
        self.authorize(team_id, id)?;
        self.lifecycle.events(id)
    }

    pub fn subscribe(&self, team_id: &str) -> broadcast::Receiver<ServiceEvent> {
        self.lifecycle.broadcaster().subscribe(team_id)
    }

    fn authorize(&self, team_id: &str, id: &ServiceId) -> Result<ServiceInstance> {
        self.lifecycle.store().authorize(team_id, id)
    }

    /// Stand-in configuration for an instance whose folder is still being analyzed
    fn placeholder_config(&self) -> DeploymentConfig {
        DeploymentConfig {
            ports: Vec::new(),
            env: Default::default(),
            volumes: Vec::new(),
            resources: ResourceLimits::default(),
            health_check: HealthCheckConfig::disabled(),
            scaling: ScalingConfig::default(),
            build_file: String::new(),
            metric_retention: self.specs.default_retention(),
        }
    }

    // ── Background work and persistence ───────────────────────────

    pub async fn ping_runtime(&self) -> Result<()> {
        self.executor.runtime().ping().await.map_err(Into::into)
    }

    /// Load the state file, if one is configured; returns the records restored
    pub fn restore(&self) -> anyhow::Result<usize> {
        let Some(file) = &self.state_file else {
            return Ok(0);
        };
        let state = file.load()?;
        Ok(self.lifecycle.restore(state))
    }

    /// Write the state file if anything changed since the last flush
    pub fn flush(&self) -> anyhow::Result<bool> {
        let Some(file) = &self.state_file else {
            return Ok(false);
        };
        let store = self.lifecycle.store();
        if !store.take_dirty() {
            return Ok(false);
        }
        if let Err(e) = file.save(&self.lifecycle.snapshot()) {
            store.mark_dirty();
            return Err(e);
        }
        Ok(true)
    }

    /// Start the monitor loop and, with a state file, the flush loop
    pub fn spawn_background(
        self: &Arc<Self>,
        health: HealthRegistry,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![tokio::spawn(
            Arc::clone(&self.monitor).run(health.clone(), shutdown.subscribe()),
        )];
        if self.state_file.is_some() {
            tasks.push(tokio::spawn(
                Arc::clone(self).run_persistence(health, shutdown.subscribe()),
            ));
        }
        tasks
    }

    async fn run_persistence(self: Arc<Self>, health: HealthRegistry, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.flush_interval.as_secs(),
            "Starting state flush loop"
        );
        let mut ticker = interval(self.flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_and_report(&health).await;
                }
                _ = shutdown.recv() => {
                    self.flush_and_report(&health).await;
                    info!("Shutting down state flush loop");
                    break;
                }
            }
        }
    }

    async fn flush_and_report(&self, health: &HealthRegistry) {
        match self.flush() {
            Ok(written) => {
                if written {
                    debug!(records = self.lifecycle.store().len(), "State flushed");
                }
                health.set_healthy(components::STORE).await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to flush state");
                health
                    .set_degraded(components::STORE, format!("state flush failed: {e}"))
                    .await;
            }
        }
    }
}

/// Service name derived from the last folder component
fn default_name(folder_path: &str) -> String {
    let last = folder_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(folder_path);
    let name: String = last
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let name = name.trim_matches('-');
    if name.is_empty() {
        "service".to_string()
    } else {
        name.chars().take(MAX_NAME_LEN).collect()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ControlError::Validation(format!(
            "service name '{}' must be 1-{} letters, digits, '-' or '_', starting with a letter or digit",
            name, MAX_NAME_LEN
        )))
    }
}

fn changed_sections(before: &DeploymentConfig, after: &DeploymentConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if before.ports != after.ports {
        changed.push("ports");
    }
    if before.env != after.env {
        changed.push("env");
    }
    if before.volumes != after.volumes {
        changed.push("volumes");
    }
    if before.resources != after.resources {
        changed.push("resources");
    }
    if before.health_check != after.health_check {
        changed.push("health_check");
    }
    if before.scaling != after.scaling {
        changed.push("scaling");
    }
    if before.build_file != after.build_file {
        changed.push("build_file");
    }
    if before.metric_retention != after.metric_retention {
        changed.push("metric_retention");
    }
    changed
}
