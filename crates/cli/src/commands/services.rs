//! Service management CLI commands

use anyhow::{bail, Result};
use colored::Colorize;
use serde_json::{json, Map, Value};
use tabled::Tabled;

use crate::client::{ApiClient, ScaleRequest, Service};
use crate::output::{
    color_confidence, color_status, format_timestamp, print_info, print_json, print_rows,
    print_success, OutputFormat,
};

/// Row for services table
#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    service_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Ports")]
    ports: String,
    #[tabled(rename = "Replicas")]
    replicas: String,
    #[tabled(rename = "Folder")]
    folder: String,
}

impl From<&Service> for ServiceRow {
    fn from(s: &Service) -> Self {
        let (current, target) = s.replicas();
        Self {
            id: truncate_id(&s.id),
            name: s.name.clone(),
            service_type: s.service_type.clone(),
            status: color_status(&s.status),
            ports: join_ports(&s.host_ports()),
            replicas: format!("{}/{}", current, target),
            folder: format!("{}/{}", s.workspace_id, s.folder_path),
        }
    }
}

/// Lifecycle actions that take only a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Restart,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
        }
    }
}

/// Flags of `services create`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    pub workspace: String,
    pub folder: String,
    pub name: Option<String>,
    pub env: Vec<(String, String)>,
    /// (container port, host port)
    pub ports: Vec<(u16, u16)>,
    pub memory_mb: Option<u32>,
    pub cpu_cores: Option<f32>,
}

impl CreateOptions {
    /// Request body; without a recommendation the controller analyzes the folder itself
    pub fn body(&self) -> Value {
        let mut overrides = Map::new();
        if !self.env.is_empty() {
            let env: Map<String, Value> = self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            overrides.insert("env".into(), Value::Object(env));
        }
        if !self.ports.is_empty() {
            let ports: Vec<Value> = self
                .ports
                .iter()
                .map(|(container, host)| json!({ "container_port": container, "host_port": host }))
                .collect();
            overrides.insert("ports".into(), Value::Array(ports));
        }
        if self.memory_mb.is_some() || self.cpu_cores.is_some() {
            overrides.insert(
                "resources".into(),
                json!({ "memory_mb": self.memory_mb, "cpu_cores": self.cpu_cores }),
            );
        }

        let mut body = json!({
            "workspace_id": self.workspace,
            "folder_path": self.folder,
            "overrides": overrides,
        });
        if let Some(name) = &self.name {
            body["name"] = Value::String(name.clone());
        }
        body
    }
}

pub fn services_path(team: &str) -> String {
    format!("teams/{}/services", team)
}

pub fn service_path(team: &str, id: &str) -> String {
    format!("teams/{}/services/{}", team, id)
}

/// Accept either a service id or a unique service name
pub async fn resolve_service(client: &ApiClient, team: &str, service: &str) -> Result<String> {
    if looks_like_id(service) {
        return Ok(service.to_string());
    }

    let services: Vec<Service> = client.get(&services_path(team)).await?;
    let matches: Vec<&Service> = services.iter().filter(|s| s.name == service).collect();
    match matches.as_slice() {
        [one] => Ok(one.id.clone()),
        [] => bail!("No service named '{}' in team {}", service, team),
        _ => bail!("Several services are named '{}'; use the service id", service),
    }
}

/// List the team's services
pub async fn list_services(client: &ApiClient, team: &str, format: OutputFormat) -> Result<()> {
    let services: Vec<Service> = client.get(&services_path(team)).await?;

    match format {
        OutputFormat::Json => print_json(&services)?,
        OutputFormat::Table => {
            let count = services.len();
            print_rows(services.iter().map(ServiceRow::from).collect(), "No services found");
            if count > 0 {
                println!("\nTotal: {} services", count);
            }
        }
    }
    Ok(())
}

/// Show one service
pub async fn get_service(client: &ApiClient, team: &str, service: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_service(client, team, service).await?;
    let service: Service = client.get(&service_path(team, &id)).await?;

    match format {
        OutputFormat::Json => print_json(&service)?,
        OutputFormat::Table => print_service(&service),
    }
    Ok(())
}

fn print_service(s: &Service) {
    let (current, target) = s.replicas();
    let resources = &s.config["resources"];

    println!("{}", s.name.bold());
    println!("{}", "=".repeat(60));
    println!("ID:         {}", s.id);
    println!("Status:     {}", color_status(&s.status));
    println!("Type:       {} ({})", s.service_type, color_confidence(s.confidence));
    println!("Folder:     {}/{}", s.workspace_id, s.folder_path);
    println!("Ports:      {}", join_ports(&s.host_ports()));
    println!("Replicas:   {}/{}", current, target);
    println!(
        "Resources:  {} MB, {} CPU",
        resources["memory_mb"], resources["cpu_cores"]
    );
    println!("Created:    {}", format_timestamp(Some(&s.created_at)));
    println!("Deployed:   {}", format_timestamp(s.deployed_at.as_deref()));
}

/// Register a folder as a service
pub async fn create_service(
    client: &ApiClient,
    team: &str,
    options: &CreateOptions,
    format: OutputFormat,
) -> Result<()> {
    let service: Service = client.post(&services_path(team), &options.body()).await?;

    match format {
        OutputFormat::Json => print_json(&service)?,
        OutputFormat::Table => {
            print_success(&format!("Created service {} ({})", service.name.cyan(), service.id));
            if service.status == "detecting" {
                print_info("Folder analysis is running; check progress with `fas status`");
            }
        }
    }
    Ok(())
}

/// Delete a service, cancelling anything in flight
pub async fn delete_service(client: &ApiClient, team: &str, service: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_service(client, team, service).await?;
    client.delete(&service_path(team, &id)).await?;

    match format {
        OutputFormat::Json => print_json(&json!({ "id": id, "deleted": true }))?,
        OutputFormat::Table => print_success(&format!("Deleted service {}", id)),
    }
    Ok(())
}

/// Start, stop or restart a service
pub async fn run_action(
    client: &ApiClient,
    team: &str,
    service: &str,
    action: Action,
    format: OutputFormat,
) -> Result<()> {
    let id = resolve_service(client, team, service).await?;
    let path = format!("{}/{}", service_path(team, &id), action.as_str());
    let service: Service = client.post_empty(&path).await?;

    match format {
        OutputFormat::Json => print_json(&service)?,
        OutputFormat::Table => print_success(&format!(
            "{} accepted for {}; status is {}",
            action.as_str(),
            service.name.cyan(),
            color_status(&service.status)
        )),
    }
    Ok(())
}

/// Change the replica count of a running service
pub async fn scale_service(
    client: &ApiClient,
    team: &str,
    service: &str,
    replicas: u32,
    format: OutputFormat,
) -> Result<()> {
    let id = resolve_service(client, team, service).await?;
    let path = format!("{}/scale", service_path(team, &id));
    let service: Service = client
        .post(&path, &ScaleRequest { replica_count: replicas })
        .await?;

    match format {
        OutputFormat::Json => print_json(&service)?,
        OutputFormat::Table => print_success(&format!(
            "Scaling {} to {} replicas",
            service.name.cyan(),
            replicas
        )),
    }
    Ok(())
}

fn looks_like_id(s: &str) -> bool {
    s.len() == 36
        && s.chars().filter(|c| *c == '-').count() == 4
        && s.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

fn join_ports(ports: &[u64]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",")
}

/// Truncate ID for display
fn truncate_id(id: &str) -> String {
    if id.len() > 8 {
        format!("{}...", &id[..8])
    } else {
        id.to_string()
    }
}
