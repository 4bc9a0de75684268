//! Container runtime driven through the `docker` CLI

use super::{async_trait, ContainerRuntime, ScaleOutcome, ServiceRef};
use crate::error::RuntimeError;
use crate::models::{DeploymentConfig, ResourceSample};
use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const SERVICE_LABEL: &str = "fas.service";

/// Failure markers worth retrying
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "too many requests",
    "429",
    "tls handshake",
    "temporary failure",
    "i/o timeout",
    "service unavailable",
];

/// What a started service needs to spawn extra replicas
#[derive(Debug, Clone)]
struct Launch {
    image: String,
    config: DeploymentConfig,
}

pub struct DockerCliRuntime {
    binary: String,
    launches: DashMap<String, Launch>,
}

impl DockerCliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            launches: DashMap::new(),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<String, RuntimeError> {
        self.docker_with_stdin(args, None).await
    }

    async fn docker_with_stdin(&self, args: &[String], stdin: Option<&str>) -> Result<String, RuntimeError> {
        debug!(binary = %self.binary, args = ?args, "Running docker command");

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| RuntimeError::permanent(format!("failed to spawn {}: {}", self.binary, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| RuntimeError::transient(format!("failed to write to docker stdin: {}", e)))?;
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RuntimeError::transient(format!("docker did not complete: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify(&stderr))
        }
    }

    /// Ids of the service's running containers, oldest first
    async fn replicas(&self, service: &ServiceRef) -> Result<Vec<String>, RuntimeError> {
        let out = self
            .docker(&strings(&[
                "ps",
                "-q",
                "--filter",
                &format!("label={}={}", SERVICE_LABEL, service.label()),
            ]))
            .await?;
        // `docker ps` lists newest first
        let mut ids: Vec<String> = out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect();
        ids.reverse();
        Ok(ids)
    }

    fn run_args(service: &ServiceRef, image: &str, config: &DeploymentConfig, publish: bool) -> Vec<String> {
        let mut args = strings(&[
            "run",
            "-d",
            "--label",
            &format!("{}={}", SERVICE_LABEL, service.label()),
            "--memory",
            &format!("{}m", config.resources.memory_mb),
            "--cpus",
            &format!("{}", config.resources.cpu_cores),
        ]);
        if publish {
            for port in &config.ports {
                args.push("-p".into());
                args.push(format!(
                    "{}:{}/{}",
                    port.host_port,
                    port.container_port,
                    match port.protocol {
                        crate::models::Protocol::Tcp => "tcp",
                        crate::models::Protocol::Udp => "udp",
                    }
                ));
            }
        }
        for (key, value) in &config.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for volume in &config.volumes {
            args.push("-v".into());
            let mode = if volume.read_only { ":ro" } else { "" };
            args.push(format!("{}:{}{}", volume.host_path, volume.container_path, mode));
        }
        args.push(image.to_string());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(&self, service: &ServiceRef, folder: &Path, build_file: &str) -> Result<String, RuntimeError> {
        let tag = format!("fas-{}:latest", service.id.simple());
        let args = strings(&[
            "build",
            "-q",
            "-t",
            &tag,
            "--label",
            &format!("{}={}", SERVICE_LABEL, service.label()),
            "-f",
            "-",
            &folder.to_string_lossy(),
        ]);
        self.docker_with_stdin(&args, Some(build_file)).await?;
        Ok(tag)
    }

    async fn start(
        &self,
        service: &ServiceRef,
        image: &str,
        config: &DeploymentConfig,
    ) -> Result<String, RuntimeError> {
        let container = self.docker(&Self::run_args(service, image, config, true)).await?;
        self.launches.insert(
            service.label(),
            Launch {
                image: image.to_string(),
                config: config.clone(),
            },
        );
        Ok(container)
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        self.docker(&strings(&["stop", container])).await.map(|_| ())
    }

    async fn restart(&self, container: &str) -> Result<(), RuntimeError> {
        self.docker(&strings(&["restart", container])).await.map(|_| ())
    }

    /// Extra replicas run without published host ports
    async fn scale(&self, service: &ServiceRef, replicas: u32) -> Result<ScaleOutcome, RuntimeError> {
        let running = self.replicas(service).await?;
        let current = running.len() as u32;

        if replicas < current {
            // Newest first, never the primary
            for container in running.iter().skip(replicas.max(1) as usize).rev() {
                self.docker(&strings(&["rm", "-f", container])).await?;
            }
            return Ok(ScaleOutcome::Complete);
        }

        let launch = self
            .launches
            .get(&service.label())
            .map(|l| l.value().clone())
            .ok_or_else(|| RuntimeError::permanent(format!("service {} was not started", service.name)))?;

        let mut reached = current;
        for _ in current..replicas {
            match self.docker(&Self::run_args(service, &launch.image, &launch.config, false)).await {
                Ok(_) => reached += 1,
                Err(e) if reached > current => {
                    warn!(service_id = %service.id, error = %e, "Replica failed to start");
                    return Ok(ScaleOutcome::Partial(reached));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ScaleOutcome::Complete)
    }

    async fn stats(&self, container: &str) -> Result<ResourceSample, RuntimeError> {
        let out = self
            .docker(&strings(&["stats", "--no-stream", "--format", "{{json .}}", container]))
            .await?;
        let line = out.lines().next().unwrap_or_default();
        let raw: DockerStats = serde_json::from_str(line)
            .map_err(|e| RuntimeError::permanent(format!("unparseable docker stats: {}", e)))?;
        Ok(raw.into_sample())
    }

    async fn logs(&self, container: &str, lines: usize) -> Result<String, RuntimeError> {
        self.docker(&strings(&["logs", "--tail", &lines.to_string(), container]))
            .await
    }

    async fn exec(&self, container: &str, command: &str) -> Result<i32, RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["exec", container, "sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let status = cmd
            .status()
            .await
            .map_err(|e| RuntimeError::transient(format!("docker exec failed: {}", e)))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn cancel(&self, service: &ServiceRef) -> Result<(), RuntimeError> {
        let ids = self
            .docker(&strings(&[
                "ps",
                "-aq",
                "--filter",
                &format!("label={}={}", SERVICE_LABEL, service.label()),
            ]))
            .await?;
        let mut args = strings(&["rm", "-f"]);
        args.extend(ids.lines().filter(|l| !l.is_empty()).map(str::to_string));
        if args.len() > 2 {
            self.docker(&args).await?;
        }
        self.launches.remove(&service.label());
        Ok(())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker(&strings(&["version", "--format", "{{.Server.Version}}"]))
            .await
            .map(|_| ())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Transient or permanent, from the CLI's error output
fn classify(stderr: &str) -> RuntimeError {
    let lower = stderr.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        RuntimeError::transient(stderr)
    } else {
        RuntimeError::permanent(stderr)
    }
}

/// One line of `docker stats --format '{{json .}}'`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerStats {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    mem_perc: String,
    mem_usage: String,
    #[serde(rename = "NetIO")]
    net_io: String,
    #[serde(rename = "BlockIO")]
    block_io: String,
}

impl DockerStats {
    fn into_sample(self) -> ResourceSample {
        let (rx, tx) = split_pair(&self.net_io);
        let (read, write) = split_pair(&self.block_io);
        let (usage, _) = split_pair(&self.mem_usage);
        ResourceSample {
            cpu_percent: parse_percent(&self.cpu_perc),
            memory_percent: parse_percent(&self.mem_perc),
            memory_usage_bytes: parse_bytes(usage),
            network_rx_bytes: parse_bytes(rx),
            network_tx_bytes: parse_bytes(tx),
            disk_read_bytes: parse_bytes(read),
            disk_write_bytes: parse_bytes(write),
        }
    }
}

fn split_pair(value: &str) -> (&str, &str) {
    match value.split_once('/') {
        Some((a, b)) => (a.trim(), b.trim()),
        None => (value.trim(), ""),
    }
}

fn parse_percent(value: &str) -> f64 {
    value.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Parse docker's human sizes such as `12.5MiB`, `3kB` or `0B`
fn parse_bytes(value: &str) -> u64 {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let Ok(number) = number.parse::<f64>() else {
        return 0;
    };
    let multiplier = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return 0,
    };
    (number * multiplier) as u64
}
