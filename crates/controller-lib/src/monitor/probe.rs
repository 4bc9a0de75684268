//! http, tcp and command health probes

use super::{async_trait, HealthProbe, ProbeResult};
use crate::executor::ContainerRuntime;
use crate::models::{HealthCheckType, ServiceInstance};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;

/// Probes services through their published host ports, or inside the
/// container for command checks
pub struct NetworkProbe {
    host: String,
    client: reqwest::Client,
    runtime: Arc<dyn ContainerRuntime>,
}

impl NetworkProbe {
    pub fn new(host: impl Into<String>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            host: host.into(),
            client: reqwest::Client::new(),
            runtime,
        }
    }

    async fn probe_http(&self, port: u16, endpoint: &str) -> ProbeResult {
        let path = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{}", endpoint)
        };
        let url = format!("http://{}:{}{}", self.host, port, path);

        let started = Instant::now();
        match self.client.get(&url).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                let elapsed = elapsed_ms(started);
                if response.status().is_success() {
                    ProbeResult::healthy(elapsed).with_status_code(code)
                } else {
                    let mut result = ProbeResult::unhealthy(format!("GET {} returned {}", path, code))
                        .with_status_code(code);
                    result.response_time_ms = Some(elapsed);
                    result
                }
            }
            Err(e) => ProbeResult::unhealthy(format!("GET {} failed: {}", url, e)),
        }
    }

    async fn probe_tcp(&self, port: u16) -> ProbeResult {
        let started = Instant::now();
        match TcpStream::connect((self.host.as_str(), port)).await {
            Ok(_) => ProbeResult::healthy(elapsed_ms(started)),
            Err(e) => ProbeResult::unhealthy(format!("connect to {}:{} failed: {}", self.host, port, e)),
        }
    }

    async fn probe_command(&self, instance: &ServiceInstance, command: &str) -> ProbeResult {
        let Some(container) = instance.container_id.as_deref() else {
            return ProbeResult::unhealthy("no container to run the check in");
        };
        let started = Instant::now();
        match self.runtime.exec(container, command).await {
            Ok(0) => ProbeResult::healthy(elapsed_ms(started)),
            Ok(code) => ProbeResult::unhealthy(format!("command exited with {}", code)),
            Err(e) => ProbeResult::unhealthy(format!("command failed: {}", e)),
        }
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    async fn probe(&self, instance: &ServiceInstance) -> ProbeResult {
        let check = &instance.config.health_check;
        if check.check_type == HealthCheckType::Command {
            return self.probe_command(instance, &check.endpoint).await;
        }

        let Some(port) = instance.config.host_ports().next() else {
            return ProbeResult::unhealthy("no published port to probe");
        };
        match check.check_type {
            HealthCheckType::Http => self.probe_http(port, &check.endpoint).await,
            _ => self.probe_tcp(port).await,
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
