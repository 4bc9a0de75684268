//! Status, logs, metrics, health and event commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use super::services::{resolve_service, service_path};
use crate::client::{ApiClient, DeploymentEvent, HealthReport, Logs, ServiceStatus, Utilization};
use crate::output::{
    color_severity, color_status, format_optional, format_optional_bytes, format_timestamp,
    print_json, print_rows, print_warning, OutputFormat,
};

#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "#")]
    sequence: u64,
    #[tabled(rename = "Time")]
    occurred_at: String,
    #[tabled(rename = "Event")]
    event_type: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "Time")]
    checked_at: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Response")]
    response: String,
    #[tabled(rename = "Code")]
    code: String,
    #[tabled(rename = "Message")]
    message: String,
}

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

async fn fetch<T: serde::de::DeserializeOwned>(
    client: &ApiClient,
    team: &str,
    service: &str,
    view: &str,
) -> Result<T> {
    let id = resolve_service(client, team, service).await?;
    client.get(&format!("{}/{}", service_path(team, &id), view)).await
}

/// Show lifecycle status and health summary
pub async fn show_status(client: &ApiClient, team: &str, service: &str, format: OutputFormat) -> Result<()> {
    let status: ServiceStatus = fetch(client, team, service, "status").await?;

    match format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("{}", status.name.bold());
            println!("{}", "=".repeat(60));
            println!("Status:       {}", color_status(&status.status));
            let health = if status.degraded {
                format!("{} (degraded)", color_status(&status.health))
            } else {
                color_status(&status.health)
            };
            println!("Health:       {}", health);
            if let Some(op) = &status.operation {
                println!("In progress:  {}", op.cyan());
            }
            println!("Replicas:     {}/{}", status.current_replicas, status.target_replicas);
            println!("Deployed:     {}", format_timestamp(status.deployed_at.as_deref()));
            println!("Last check:   {}", format_timestamp(status.last_health_check_at.as_deref()));
            println!("Updated:      {}", format_timestamp(Some(&status.updated_at)));
        }
    }
    Ok(())
}

/// Print the tail of the service's container logs
pub async fn show_logs(
    client: &ApiClient,
    team: &str,
    service: &str,
    lines: usize,
    format: OutputFormat,
) -> Result<()> {
    let id = resolve_service(client, team, service).await?;
    let logs: Logs = client
        .get(&format!("{}/logs?lines={}", service_path(team, &id), lines))
        .await?;

    match format {
        OutputFormat::Json => print_json(&logs)?,
        OutputFormat::Table => {
            if logs.logs.is_empty() {
                print_warning("No log output");
            } else {
                print!("{}", logs.logs);
                if !logs.logs.ends_with('\n') {
                    println!();
                }
            }
        }
    }
    Ok(())
}

/// Show the latest resource utilization
pub async fn show_metrics(client: &ApiClient, team: &str, service: &str, format: OutputFormat) -> Result<()> {
    let utilization: Utilization = fetch(client, team, service, "metrics").await?;

    match format {
        OutputFormat::Json => print_json(&utilization)?,
        OutputFormat::Table => {
            if utilization.sampled_at.is_none() {
                print_warning("No samples collected yet");
                return Ok(());
            }
            let rows = vec![
                MetricRow { metric: "CPU", value: format_optional(utilization.cpu_percent, "%") },
                MetricRow { metric: "Memory", value: format_optional(utilization.memory_percent, "%") },
                MetricRow { metric: "Memory used", value: format_optional_bytes(utilization.memory_usage_bytes) },
                MetricRow { metric: "Network rx", value: format_optional_bytes(utilization.network_rx_bytes) },
                MetricRow { metric: "Network tx", value: format_optional_bytes(utilization.network_tx_bytes) },
                MetricRow { metric: "Disk read", value: format_optional_bytes(utilization.disk_read_bytes) },
                MetricRow { metric: "Disk write", value: format_optional_bytes(utilization.disk_write_bytes) },
                MetricRow { metric: "Response time", value: format_optional(utilization.response_time_ms, " ms") },
            ];
            print_rows(rows, "No samples collected yet");
            println!("\nSampled at {}", format_timestamp(utilization.sampled_at.as_deref()));
        }
    }
    Ok(())
}

/// Show health state and recent checks
pub async fn show_health(client: &ApiClient, team: &str, service: &str, format: OutputFormat) -> Result<()> {
    let report: HealthReport = fetch(client, team, service, "health").await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("Health: {}", color_status(&report.status));
            if report.degraded {
                println!(
                    "{} after {} consecutive failures",
                    "Degraded".red().bold(),
                    report.consecutive_failures
                );
            }
            println!();
            let rows = report
                .history
                .iter()
                .rev()
                .map(|c| CheckRow {
                    checked_at: format_timestamp(Some(&c.checked_at)),
                    status: color_status(&c.status),
                    response: format_optional(c.response_time_ms, " ms"),
                    code: c.status_code.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    message: c.message.clone().unwrap_or_default(),
                })
                .collect();
            print_rows(rows, "No health checks recorded");
        }
    }
    Ok(())
}

/// Show the deployment event log
pub async fn show_events(client: &ApiClient, team: &str, service: &str, format: OutputFormat) -> Result<()> {
    let events: Vec<DeploymentEvent> = fetch(client, team, service, "events").await?;

    match format {
        OutputFormat::Json => print_json(&events)?,
        OutputFormat::Table => {
            let rows = events
                .iter()
                .map(|e| EventRow {
                    sequence: e.sequence,
                    occurred_at: format_timestamp(Some(&e.occurred_at)),
                    event_type: e.event_type.clone(),
                    severity: color_severity(&e.severity),
                    duration: e.duration_ms.map(|d| format!("{} ms", d)).unwrap_or_else(|| "-".into()),
                    detail: e.detail.clone().unwrap_or_default(),
                })
                .collect();
            print_rows(rows, "No events recorded");
        }
    }
    Ok(())
}
