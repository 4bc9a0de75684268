//! Deployment configuration from recommendation defaults and operator overrides
//!
//! Overrides win field by field. Ports merge by container port, volumes by
//! container path and env by key, so an override replaces only what it
//! names. The result is validated, and every requested host port must be
//! free among the other live instances of the workspace.

use crate::error::{ControlError, Result};
use crate::models::{
    DeploymentConfig, DeploymentOverrides, HealthCheckConfig, HealthCheckType, ScalingConfig,
    ServiceId, ServiceInstance, ServiceRecommendation,
};
use std::collections::HashSet;

pub const MIN_HEALTH_INTERVAL_SECS: u32 = 5;
pub const MAX_HEALTH_INTERVAL_SECS: u32 = 3600;
pub const MAX_HEALTH_RETRIES: u32 = 10;
pub const MIN_METRIC_RETENTION: usize = 10;
pub const MAX_METRIC_RETENTION: usize = 1000;
pub const DEFAULT_METRIC_RETENTION: usize = 50;

const MIN_MEMORY_MB: u32 = 64;
const MAX_MEMORY_MB: u32 = 65536;
const MAX_CPU_CORES: f32 = 64.0;
const MAX_REPLICAS: u32 = 100;

#[derive(Debug, Clone)]
pub struct SpecBuilder {
    default_retention: usize,
}

impl Default for SpecBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_METRIC_RETENTION)
    }
}

impl SpecBuilder {
    pub fn new(default_retention: usize) -> Self {
        Self { default_retention }
    }

    pub fn default_retention(&self) -> usize {
        self.default_retention
    }

    /// Resolve a new instance's configuration.
    ///
    /// `others` are the workspace's existing instances; deleted ones are ignored.
    pub fn build(
        &self,
        recommendation: &ServiceRecommendation,
        overrides: &DeploymentOverrides,
        others: &[ServiceInstance],
    ) -> Result<DeploymentConfig> {
        let base = DeploymentConfig {
            ports: recommendation.ports.clone(),
            env: recommendation.env.clone(),
            volumes: Vec::new(),
            resources: recommendation.resources,
            health_check: recommendation.health_check.clone(),
            scaling: ScalingConfig::default(),
            build_file: recommendation.build_file.clone(),
            metric_retention: self.default_retention,
        };
        self.apply(&base, overrides, others, None)
    }

    /// Merge overrides over an existing configuration. `except` is the
    /// instance being updated, whose own ports never collide with it.
    pub fn apply(
        &self,
        base: &DeploymentConfig,
        overrides: &DeploymentOverrides,
        others: &[ServiceInstance],
        except: Option<ServiceId>,
    ) -> Result<DeploymentConfig> {
        let config = merge(base, overrides);
        validate(&config)?;
        check_host_ports(&config, others, except)?;
        Ok(config)
    }
}

fn merge(base: &DeploymentConfig, overrides: &DeploymentOverrides) -> DeploymentConfig {
    let mut config = base.clone();

    for port in &overrides.ports {
        match config
            .ports
            .iter_mut()
            .find(|p| p.container_port == port.container_port)
        {
            Some(existing) => *existing = *port,
            None => config.ports.push(*port),
        }
    }
    for (key, value) in &overrides.env {
        config.env.insert(key.clone(), value.clone());
    }
    for volume in &overrides.volumes {
        match config
            .volumes
            .iter_mut()
            .find(|v| v.container_path == volume.container_path)
        {
            Some(existing) => *existing = volume.clone(),
            None => config.volumes.push(volume.clone()),
        }
    }

    let resources = &overrides.resources;
    if let Some(memory_mb) = resources.memory_mb {
        config.resources.memory_mb = memory_mb;
    }
    if let Some(cpu_cores) = resources.cpu_cores {
        config.resources.cpu_cores = cpu_cores;
    }

    let health = &overrides.health_check;
    let check = &mut config.health_check;
    if let Some(enabled) = health.enabled {
        check.enabled = enabled;
    }
    if let Some(check_type) = health.check_type {
        check.check_type = check_type;
    }
    if let Some(endpoint) = &health.endpoint {
        check.endpoint = endpoint.clone();
    }
    if let Some(v) = health.interval_seconds {
        check.interval_seconds = v;
    }
    if let Some(v) = health.timeout_seconds {
        check.timeout_seconds = v;
    }
    if let Some(v) = health.retries {
        check.retries = v;
    }
    if let Some(v) = health.start_period_seconds {
        check.start_period_seconds = v;
    }

    let scaling = &overrides.scaling;
    if let Some(v) = scaling.min_replicas {
        config.scaling.min_replicas = v;
    }
    if let Some(v) = scaling.max_replicas {
        config.scaling.max_replicas = v;
    }
    if let Some(v) = scaling.target_replicas {
        config.scaling.target_replicas = v;
    }

    if let Some(build_file) = &overrides.build_file {
        config.build_file = build_file.clone();
    }
    if let Some(retention) = overrides.metric_retention {
        config.metric_retention = retention;
    }
    config
}

/// Every problem with the configuration, reported together
fn validate(config: &DeploymentConfig) -> Result<()> {
    let mut problems = Vec::new();

    let mut seen = HashSet::new();
    for port in &config.ports {
        if port.host_port == 0 || port.container_port == 0 {
            problems.push(format!(
                "port mapping {}:{} must use non-zero ports",
                port.host_port, port.container_port
            ));
        }
        if !seen.insert(port.host_port) {
            problems.push(format!("host port {} is mapped twice", port.host_port));
        }
    }

    for key in config.env.keys() {
        if !is_env_key(key) {
            problems.push(format!("'{}' is not a valid environment variable name", key));
        }
    }
    for volume in &config.volumes {
        if volume.host_path.is_empty() {
            problems.push(format!("volume {} has no host path", volume.container_path));
        }
        if !volume.container_path.starts_with('/') {
            problems.push(format!(
                "volume container path '{}' must be absolute",
                volume.container_path
            ));
        }
    }

    let resources = &config.resources;
    if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&resources.memory_mb) {
        problems.push(format!(
            "memory_mb must be between {} and {}",
            MIN_MEMORY_MB, MAX_MEMORY_MB
        ));
    }
    if !(resources.cpu_cores > 0.0 && resources.cpu_cores <= MAX_CPU_CORES) {
        problems.push(format!("cpu_cores must be above 0 and at most {}", MAX_CPU_CORES));
    }

    validate_health(&config.health_check, &mut problems);
    validate_scaling(&config.scaling, &mut problems);

    if !(MIN_METRIC_RETENTION..=MAX_METRIC_RETENTION).contains(&config.metric_retention) {
        problems.push(format!(
            "metric_retention must be between {} and {} samples",
            MIN_METRIC_RETENTION, MAX_METRIC_RETENTION
        ));
    }
    if config.build_file.trim().is_empty() {
        problems.push("build_file must not be empty".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ControlError::Validation(problems.join("; ")))
    }
}

fn validate_health(check: &HealthCheckConfig, problems: &mut Vec<String>) {
    if !(MIN_HEALTH_INTERVAL_SECS..=MAX_HEALTH_INTERVAL_SECS).contains(&check.interval_seconds) {
        problems.push(format!(
            "health check interval must be between {} and {} seconds",
            MIN_HEALTH_INTERVAL_SECS, MAX_HEALTH_INTERVAL_SECS
        ));
    }
    if check.timeout_seconds == 0 || check.timeout_seconds > check.interval_seconds {
        problems.push("health check timeout must be at least 1s and at most the interval".to_string());
    }
    if !(1..=MAX_HEALTH_RETRIES).contains(&check.retries) {
        problems.push(format!(
            "health check retries must be between 1 and {}",
            MAX_HEALTH_RETRIES
        ));
    }
    if check.start_period_seconds > MAX_HEALTH_INTERVAL_SECS {
        problems.push(format!(
            "health check start period must be at most {} seconds",
            MAX_HEALTH_INTERVAL_SECS
        ));
    }
    if check.enabled {
        match check.check_type {
            HealthCheckType::Http if !check.endpoint.starts_with('/') => {
                problems.push("http health check endpoint must start with '/'".to_string())
            }
            HealthCheckType::Command if check.endpoint.trim().is_empty() => {
                problems.push("command health check needs a command".to_string())
            }
            _ => {}
        }
    }
}

fn validate_scaling(scaling: &ScalingConfig, problems: &mut Vec<String>) {
    if scaling.min_replicas == 0 {
        problems.push("min_replicas must be at least 1".to_string());
    }
    if scaling.max_replicas < scaling.min_replicas || scaling.max_replicas > MAX_REPLICAS {
        problems.push(format!(
            "max_replicas must be between min_replicas and {}",
            MAX_REPLICAS
        ));
    }
    if scaling.target_replicas < scaling.min_replicas || scaling.target_replicas > scaling.max_replicas {
        problems.push("target_replicas must be between min_replicas and max_replicas".to_string());
    }
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_host_ports(
    config: &DeploymentConfig,
    others: &[ServiceInstance],
    except: Option<ServiceId>,
) -> Result<()> {
    for port in config.host_ports() {
        if let Some(holder) = others
            .iter()
            .filter(|o| !o.is_deleted() && Some(o.id) != except)
            .find(|o| o.config.host_ports().any(|p| p == port))
        {
            return Err(ControlError::PortConflict {
                port,
                holder: holder.id.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::new_instance;
    use crate::models::*;
    use std::collections::BTreeMap;

    fn recommendation() -> ServiceRecommendation {
        ServiceRecommendation {
            node_id: ".".into(),
            name: "billing-api".into(),
            folder_path: "billing-api".into(),
            service_type: ServiceType::Nodejs,
            confidence: 0.9,
            frameworks: vec!["express".into()],
            ports: vec![PortMapping {
                container_port: 3000,
                host_port: 8080,
                protocol: Protocol::Tcp,
            }],
            env: BTreeMap::from([
                ("NODE_ENV".to_string(), "production".to_string()),
                ("PORT".to_string(), "3000".to_string()),
            ]),
            resources: ResourceLimits::default(),
            health_check: HealthCheckConfig::default(),
            build_file: "FROM node:20-alpine\n".into(),
        }
    }

    #[test]
    fn test_defaults_pass_through() {
        let config = SpecBuilder::default()
            .build(&recommendation(), &DeploymentOverrides::default(), &[])
            .unwrap();

        assert_eq!(config.ports[0].host_port, 8080);
        assert_eq!(config.resources.memory_mb, 512);
        assert_eq!(config.health_check.endpoint, "/health");
        assert_eq!(config.scaling.target_replicas, 1);
        assert_eq!(config.metric_retention, 50);
    }

    #[test]
    fn test_overrides_merge_key_by_key() {
        let overrides = DeploymentOverrides {
            ports: vec![
                PortMapping {
                    container_port: 3000,
                    host_port: 9090,
                    protocol: Protocol::Tcp,
                },
                PortMapping {
                    container_port: 9229,
                    host_port: 9229,
                    protocol: Protocol::Tcp,
                },
            ],
            env: BTreeMap::from([("NODE_ENV".to_string(), "staging".to_string())]),
            resources: ResourceOverrides {
                memory_mb: Some(1024),
                cpu_cores: None,
            },
            health_check: HealthCheckOverrides {
                retries: Some(5),
                ..HealthCheckOverrides::default()
            },
            ..DeploymentOverrides::default()
        };

        let config = SpecBuilder::default()
            .build(&recommendation(), &overrides, &[])
            .unwrap();

        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.ports[0].host_port, 9090);
        assert_eq!(config.env["NODE_ENV"], "staging");
        assert_eq!(config.env["PORT"], "3000");
        assert_eq!(config.resources.memory_mb, 1024);
        assert_eq!(config.resources.cpu_cores, 1.0);
        assert_eq!(config.health_check.retries, 5);
        assert_eq!(config.health_check.interval_seconds, 30);
    }

    #[test]
    fn test_host_port_collision_is_rejected() {
        let others = vec![new_instance("ws-1", "other", 8080)];

        match SpecBuilder::default().build(&recommendation(), &DeploymentOverrides::default(), &others) {
            Err(ControlError::PortConflict { port, holder }) => {
                assert_eq!(port, 8080);
                assert_eq!(holder, others[0].id.to_string());
            }
            other => panic!("expected port conflict, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_deleted_and_own_instances_do_not_collide() {
        let mut deleted = new_instance("ws-1", "gone", 8080);
        deleted.status = ServiceStatus::Deleted;
        let builder = SpecBuilder::default();
        assert!(builder
            .build(&recommendation(), &DeploymentOverrides::default(), &[deleted])
            .is_ok());

        let own = new_instance("ws-1", "api", 8080);
        let updated = builder.apply(
            &own.config,
            &DeploymentOverrides::default(),
            std::slice::from_ref(&own),
            Some(own.id),
        );
        assert!(updated.is_ok());
    }

    #[test]
    fn test_health_bounds_are_enforced() {
        let builder = SpecBuilder::default();
        for health_check in [
            HealthCheckOverrides {
                interval_seconds: Some(1),
                ..HealthCheckOverrides::default()
            },
            HealthCheckOverrides {
                timeout_seconds: Some(60),
                ..HealthCheckOverrides::default()
            },
            HealthCheckOverrides {
                retries: Some(0),
                ..HealthCheckOverrides::default()
            },
            HealthCheckOverrides {
                retries: Some(11),
                ..HealthCheckOverrides::default()
            },
            HealthCheckOverrides {
                endpoint: Some("health".into()),
                ..HealthCheckOverrides::default()
            },
        ] {
            let overrides = DeploymentOverrides {
                health_check,
                ..DeploymentOverrides::default()
            };
            assert!(matches!(
                builder.build(&recommendation(), &overrides, &[]),
                Err(ControlError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_retention_and_replica_bounds() {
        let builder = SpecBuilder::default();
        let retention = DeploymentOverrides {
            metric_retention: Some(5),
            ..DeploymentOverrides::default()
        };
        assert!(builder.build(&recommendation(), &retention, &[]).is_err());

        let replicas = DeploymentOverrides {
            scaling: ScalingOverrides {
                target_replicas: Some(20),
                ..ScalingOverrides::default()
            },
            ..DeploymentOverrides::default()
        };
        assert!(builder.build(&recommendation(), &replicas, &[]).is_err());
    }

    #[test]
    fn test_problems_are_reported_together() {
        let overrides = DeploymentOverrides {
            env: BTreeMap::from([("1BAD".to_string(), "x".to_string())]),
            volumes: vec![VolumeMapping {
                host_path: "/data".into(),
                container_path: "data".into(),
                read_only: false,
            }],
            build_file: Some("   ".into()),
            ..DeploymentOverrides::default()
        };

        match SpecBuilder::default().build(&recommendation(), &overrides, &[]) {
            Err(ControlError::Validation(message)) => {
                assert!(message.contains("1BAD"));
                assert!(message.contains("must be absolute"));
                assert!(message.contains("build_file"));
            }
            other => panic!("expected validation error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_disabled_health_check_needs_no_endpoint() {
        let mut rec = recommendation();
        rec.health_check = HealthCheckConfig::disabled();

        assert!(SpecBuilder::default()
            .build(&rec, &DeploymentOverrides::default(), &[])
            .is_ok());
    }
}
