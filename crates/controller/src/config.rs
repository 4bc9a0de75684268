//! Controller configuration

use anyhow::{Context, Result};
use controller_lib::events::BroadcasterConfig;
use controller_lib::executor::{ExecutorConfig, RuntimeKind};
use controller_lib::monitor::MonitorConfig;
use controller_lib::ServiceControllerConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Controller configuration
///
/// Read from an optional `fas-controller.{toml,yaml,json}` in the working
/// directory, then from `FAS_`-prefixed environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Name used in logs, defaults to the host name
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Port of the REST, health and metrics server
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Workspace folders resolve under `<workspace_root>/<workspace_id>/`
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    #[serde(default)]
    pub runtime: RuntimeKind,

    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Retries of transient build failures
    #[serde(default = "default_max_build_retries")]
    pub max_build_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_monitor_tick")]
    pub monitor_tick_ms: u64,

    /// Resource sampling interval, independent of health check intervals
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Health checks and samples running at once
    #[serde(default = "default_monitor_workers")]
    pub monitor_workers: usize,

    #[serde(default = "default_health_history")]
    pub health_history: usize,

    #[serde(default = "default_metric_retention")]
    pub default_metric_retention: usize,

    /// Push channel buffer per team
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub state_file: Option<PathBuf>,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Host the health probe reaches published ports on
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "fas-controller".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_build_timeout() -> u64 {
    600
}

fn default_deploy_timeout() -> u64 {
    120
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_max_build_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    2000
}

fn default_monitor_tick() -> u64 {
    1000
}

fn default_metrics_interval() -> u64 {
    15
}

fn default_monitor_workers() -> usize {
    16
}

fn default_health_history() -> usize {
    50
}

fn default_metric_retention() -> usize {
    50
}

fn default_event_capacity() -> usize {
    256
}

fn default_flush_interval() -> u64 {
    5
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

impl ControllerConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("fas-controller").required(false))
            .add_source(config::Environment::with_prefix("FAS").try_parsing(true));
        Self::from_builder(builder)
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("Failed to read controller configuration")?
            .try_deserialize()
            .context("Invalid controller configuration")
    }

    /// Library configuration for the service controller
    pub fn controller_config(&self) -> ServiceControllerConfig {
        ServiceControllerConfig {
            instance_name: self.instance_name.clone(),
            executor: ExecutorConfig {
                workspace_root: self.workspace_root.clone(),
                build_timeout: Duration::from_secs(self.build_timeout_secs),
                deploy_timeout: Duration::from_secs(self.deploy_timeout_secs),
                stop_timeout: Duration::from_secs(self.stop_timeout_secs),
                max_build_retries: self.max_build_retries,
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            },
            monitor: MonitorConfig {
                tick: Duration::from_millis(self.monitor_tick_ms.max(10)),
                metrics_interval: Duration::from_secs(self.metrics_interval_secs.max(1)),
                workers: self.monitor_workers,
                history_limit: self.health_history,
            },
            broadcaster: BroadcasterConfig {
                capacity: self.event_capacity,
            },
            default_metric_retention: self.default_metric_retention,
            probe_host: self.probe_host.clone(),
            state_file: self.state_file.clone(),
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
        }
    }
}
