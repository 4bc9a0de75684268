//! Core data models for the service control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier of a service instance
pub type ServiceId = Uuid;

/// Lifecycle status of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Detecting,
    Pending,
    Building,
    Deploying,
    Running,
    Restarting,
    Scaling,
    Stopped,
    Error,
    Deleted,
}

impl ServiceStatus {
    pub const ALL: [ServiceStatus; 10] = [
        ServiceStatus::Detecting,
        ServiceStatus::Pending,
        ServiceStatus::Building,
        ServiceStatus::Deploying,
        ServiceStatus::Running,
        ServiceStatus::Restarting,
        ServiceStatus::Scaling,
        ServiceStatus::Stopped,
        ServiceStatus::Error,
        ServiceStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Detecting => "detecting",
            ServiceStatus::Pending => "pending",
            ServiceStatus::Building => "building",
            ServiceStatus::Deploying => "deploying",
            ServiceStatus::Running => "running",
            ServiceStatus::Restarting => "restarting",
            ServiceStatus::Scaling => "scaling",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Error => "error",
            ServiceStatus::Deleted => "deleted",
        }
    }

    /// States owned by a background operation that has not finished yet
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Detecting
                | ServiceStatus::Building
                | ServiceStatus::Deploying
                | ServiceStatus::Restarting
                | ServiceStatus::Scaling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Deleted)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of deployable service detected in a folder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Nodejs,
    Python,
    Go,
    Rust,
    Ruby,
    Php,
    Java,
    Elixir,
    Static,
    Docker,
    #[default]
    Unknown,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceType::Nodejs => "nodejs",
            ServiceType::Python => "python",
            ServiceType::Go => "go",
            ServiceType::Rust => "rust",
            ServiceType::Ruby => "ruby",
            ServiceType::Php => "php",
            ServiceType::Java => "java",
            ServiceType::Elixir => "elixir",
            ServiceType::Static => "static",
            ServiceType::Docker => "docker",
            ServiceType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Container port published on a host port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub cpu_cores: f32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_cores: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Http,
    Tcp,
    Command,
}

impl std::fmt::Display for HealthCheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthCheckType::Http => write!(f, "http"),
            HealthCheckType::Tcp => write!(f, "tcp"),
            HealthCheckType::Command => write!(f, "command"),
        }
    }
}

/// Health check configuration of a service
///
/// `endpoint` is a request path for http checks and a shell command for
/// command checks; tcp checks ignore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub check_type: HealthCheckType,
    pub endpoint: String,
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub retries: u32,
    pub start_period_seconds: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_type: HealthCheckType::Http,
            endpoint: "/health".to_string(),
            interval_seconds: 30,
            timeout_seconds: 5,
            retries: 3,
            start_period_seconds: 10,
        }
    }
}

impl HealthCheckConfig {
    /// Disabled tcp check, used when no HTTP framework was detected
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            check_type: HealthCheckType::Tcp,
            endpoint: String::new(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_replicas: u32,
    pub current_replicas: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 10,
            target_replicas: 1,
            current_replicas: 0,
        }
    }
}

/// Fully resolved deployment configuration of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMapping>,
    pub resources: ResourceLimits,
    pub health_check: HealthCheckConfig,
    pub scaling: ScalingConfig,
    pub build_file: String,
    pub metric_retention: usize,
}

impl DeploymentConfig {
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().map(|p| p.host_port)
    }
}

/// The durable record of one deployed (or deployable) service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: ServiceId,
    pub team_id: String,
    pub workspace_id: String,
    pub name: String,
    pub folder_path: String,
    pub service_type: ServiceType,
    pub confidence: f32,
    pub status: ServiceStatus,
    pub container_id: Option<String>,
    pub image_id: Option<String>,
    pub analysis_id: Option<Uuid>,
    pub config: DeploymentConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    pub fn is_deleted(&self) -> bool {
        self.status == ServiceStatus::Deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentEventType {
    DetectionCompleted,
    DetectionFailed,
    DeploymentStarted,
    BuildRetried,
    BuildCompleted,
    DeploymentCompleted,
    DeploymentFailed,
    RestartCompleted,
    RestartFailed,
    ScaleCompleted,
    ScalePartial,
    ServiceStopped,
    StopFailed,
    ConfigUpdated,
    ServiceDeleted,
    Interrupted,
}

impl DeploymentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentEventType::DetectionCompleted => "detection_completed",
            DeploymentEventType::DetectionFailed => "detection_failed",
            DeploymentEventType::DeploymentStarted => "deployment_started",
            DeploymentEventType::BuildRetried => "build_retried",
            DeploymentEventType::BuildCompleted => "build_completed",
            DeploymentEventType::DeploymentCompleted => "deployment_completed",
            DeploymentEventType::DeploymentFailed => "deployment_failed",
            DeploymentEventType::RestartCompleted => "restart_completed",
            DeploymentEventType::RestartFailed => "restart_failed",
            DeploymentEventType::ScaleCompleted => "scale_completed",
            DeploymentEventType::ScalePartial => "scale_partial",
            DeploymentEventType::ServiceStopped => "service_stopped",
            DeploymentEventType::StopFailed => "stop_failed",
            DeploymentEventType::ConfigUpdated => "config_updated",
            DeploymentEventType::ServiceDeleted => "service_deleted",
            DeploymentEventType::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for DeploymentEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// Append-only audit entry attached to a service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub id: Uuid,
    pub service_id: ServiceId,
    /// Position in the instance's event log, starting at 1
    pub sequence: u64,
    pub event_type: DeploymentEventType,
    pub severity: EventSeverity,
    pub occurred_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub detail: Option<String>,
}

/// Event contents before the lifecycle manager stamps it into the log
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: DeploymentEventType,
    pub severity: EventSeverity,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub detail: Option<String>,
}

impl NewEvent {
    pub fn info(event_type: DeploymentEventType) -> Self {
        Self {
            event_type,
            severity: EventSeverity::Info,
            duration_ms: None,
            success: true,
            detail: None,
        }
    }

    pub fn failure(event_type: DeploymentEventType, detail: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: EventSeverity::Error,
            duration_ms: None,
            success: false,
            detail: Some(detail.into()),
        }
    }

    pub fn warning(event_type: DeploymentEventType, detail: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: EventSeverity::Warning,
            duration_ms: None,
            success: true,
            detail: Some(detail.into()),
        }
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
    Starting,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Starting => "starting",
        }
    }
}

/// Point-in-time health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub service_id: ServiceId,
    pub check_type: HealthCheckType,
    pub endpoint: String,
    pub status: HealthStatus,
    pub response_time_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    CpuPercent,
    MemoryPercent,
    MemoryUsageBytes,
    NetworkRxBytes,
    NetworkTxBytes,
    DiskReadBytes,
    DiskWriteBytes,
    ResponseTimeMs,
}

impl MetricType {
    pub const ALL: [MetricType; 8] = [
        MetricType::CpuPercent,
        MetricType::MemoryPercent,
        MetricType::MemoryUsageBytes,
        MetricType::NetworkRxBytes,
        MetricType::NetworkTxBytes,
        MetricType::DiskReadBytes,
        MetricType::DiskWriteBytes,
        MetricType::ResponseTimeMs,
    ];

    pub fn unit(&self) -> &'static str {
        match self {
            MetricType::CpuPercent | MetricType::MemoryPercent => "percent",
            MetricType::ResponseTimeMs => "ms",
            _ => "bytes",
        }
    }
}

/// One sample of one metric type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetric {
    pub service_id: ServiceId,
    pub metric_type: MetricType,
    pub value: f64,
    pub unit: String,
    pub collected_at: DateTime<Utc>,
}

/// Resource sample returned by the container runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

impl ResourceSample {
    pub fn values(&self) -> [(MetricType, f64); 7] {
        [
            (MetricType::CpuPercent, self.cpu_percent),
            (MetricType::MemoryPercent, self.memory_percent),
            (MetricType::MemoryUsageBytes, self.memory_usage_bytes as f64),
            (MetricType::NetworkRxBytes, self.network_rx_bytes as f64),
            (MetricType::NetworkTxBytes, self.network_tx_bytes as f64),
            (MetricType::DiskReadBytes, self.disk_read_bytes as f64),
            (MetricType::DiskWriteBytes, self.disk_write_bytes as f64),
        ]
    }
}

/// Utilization computed on read from the latest sample of each metric type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub memory_usage_bytes: Option<f64>,
    pub network_rx_bytes: Option<f64>,
    pub network_tx_bytes: Option<f64>,
    pub disk_read_bytes: Option<f64>,
    pub disk_write_bytes: Option<f64>,
    pub response_time_ms: Option<f64>,
    pub sampled_at: Option<DateTime<Utc>>,
}

// ── Topology ────────────────────────────────────────────────────

/// Languages, frameworks and databases seen across an analyzed folder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    /// Folder of the candidate relative to the analyzed root ("." for the root)
    pub id: String,
    pub name: String,
    pub service_type: ServiceType,
    pub port: u16,
    pub file_path: String,
    pub confidence: f32,
    pub has_manifest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ConnectsTo,
    SharesDatabase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEdge {
    pub from: String,
    pub to: String,
    pub relation: RelationKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceGraph {
    pub nodes: Vec<ServiceNode>,
    pub edges: Vec<ServiceEdge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    SingleContainer,
    MultiService,
    /// Nothing deployable was found
    Undetermined,
}

/// One candidate service and the defaults to deploy it with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecommendation {
    pub node_id: String,
    pub name: String,
    /// Folder of the candidate relative to the analyzed root
    pub folder_path: String,
    pub service_type: ServiceType,
    pub confidence: f32,
    pub frameworks: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceLimits,
    pub health_check: HealthCheckConfig,
    pub build_file: String,
}

/// Result of one analysis run; never mutated once recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyAnalysis {
    pub id: Uuid,
    pub workspace_id: String,
    pub folder_path: String,
    pub created_at: DateTime<Utc>,
    pub snapshot_digest: String,
    pub patterns: PatternSummary,
    pub graph: ServiceGraph,
    pub recommendations: Vec<ServiceRecommendation>,
    pub deployment_strategy: DeploymentStrategy,
}

// ── Operator input ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceOverrides {
    pub memory_mb: Option<u32>,
    pub cpu_cores: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckOverrides {
    pub enabled: Option<bool>,
    pub check_type: Option<HealthCheckType>,
    pub endpoint: Option<String>,
    pub interval_seconds: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub retries: Option<u32>,
    pub start_period_seconds: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingOverrides {
    pub min_replicas: Option<u32>,
    pub max_replicas: Option<u32>,
    pub target_replicas: Option<u32>,
}

/// Operator-supplied overrides merged over recommendation defaults
///
/// Ports merge by container port, volumes by container path, env by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentOverrides {
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMapping>,
    pub resources: ResourceOverrides,
    pub health_check: HealthCheckOverrides,
    pub scaling: ScalingOverrides,
    pub build_file: Option<String>,
    pub metric_retention: Option<usize>,
}

/// Request to create a service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub workspace_id: String,
    pub folder_path: String,
    #[serde(default)]
    pub name: Option<String>,
    /// When absent the folder is analyzed first and the top recommendation is used
    #[serde(default)]
    pub recommendation: Option<ServiceRecommendation>,
    #[serde(default)]
    pub overrides: DeploymentOverrides,
}

/// Request to update a service instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateServiceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub overrides: DeploymentOverrides,
}

/// Status view served by `GET .../status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusReport {
    pub service_id: ServiceId,
    pub name: String,
    pub status: ServiceStatus,
    pub health: HealthStatus,
    pub degraded: bool,
    /// Lifecycle operation currently holding the instance, if any
    pub operation: Option<String>,
    pub current_replicas: u32,
    pub target_replicas: u32,
    pub deployed_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
