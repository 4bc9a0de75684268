//! API client for the controller REST surface

use anyhow::{Context, Result};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Error reported by the controller
#[derive(Debug, Error)]
#[error("{message} ({code}, HTTP {status})")]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

/// API client for the controller
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let mut base_url = Url::parse(base_url).context("Invalid API URL")?;
        // Url::join replaces the last segment unless the base ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(Method::GET, path, None::<&()>).await?;
        response.json().await.context("Failed to parse response")
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        response.json().await.context("Failed to parse response")
    }

    /// Make a POST request without a body
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(Method::POST, path, None::<&()>).await?;
        response.json().await.context("Failed to parse response")
    }

    /// Make a PUT request with JSON body
    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.send(Method::PUT, path, Some(body)).await?;
        response.json().await.context("Failed to parse response")
    }

    /// Make a DELETE request; the controller answers 204 without a body
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(Method::DELETE, path, None::<&()>).await?;
        Ok(())
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body).into());
        }
        Ok(response)
    }
}

fn api_error(status: StatusCode, body: &str) -> ApiError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => ApiError {
            status: status.as_u16(),
            code: parsed.code,
            message: parsed.error,
            details: parsed.details,
        },
        Err(_) => ApiError {
            status: status.as_u16(),
            code: "unknown".to_string(),
            message: if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body.to_string()
            },
            details: None,
        },
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub team_id: String,
    pub workspace_id: String,
    pub name: String,
    pub folder_path: String,
    pub service_type: String,
    pub confidence: f32,
    pub status: String,
    #[serde(default)]
    pub container_id: Option<String>,
    /// Kept verbatim so `--format json` shows everything the controller sent
    pub config: Value,
    pub created_at: String,
    #[serde(default)]
    pub deployed_at: Option<String>,
}

impl Service {
    pub fn host_ports(&self) -> Vec<u64> {
        self.config["ports"]
            .as_array()
            .map(|ports| ports.iter().filter_map(|p| p["host_port"].as_u64()).collect())
            .unwrap_or_default()
    }

    pub fn replicas(&self) -> (u64, u64) {
        let scaling = &self.config["scaling"];
        (
            scaling["current_replicas"].as_u64().unwrap_or(0),
            scaling["target_replicas"].as_u64().unwrap_or(0),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_id: String,
    pub name: String,
    pub status: String,
    pub health: String,
    pub degraded: bool,
    #[serde(default)]
    pub operation: Option<String>,
    pub current_replicas: u32,
    pub target_replicas: u32,
    #[serde(default)]
    pub deployed_at: Option<String>,
    #[serde(default)]
    pub last_health_check_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub workspace_id: String,
    pub folder_path: String,
    pub created_at: String,
    pub patterns: Patterns,
    pub recommendations: Vec<Recommendation>,
    pub deployment_strategy: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patterns {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub name: String,
    pub folder_path: String,
    pub service_type: String,
    pub confidence: f32,
    pub frameworks: Vec<String>,
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Utilization {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub memory_usage_bytes: Option<f64>,
    pub network_rx_bytes: Option<f64>,
    pub network_tx_bytes: Option<f64>,
    pub disk_read_bytes: Option<f64>,
    pub disk_write_bytes: Option<f64>,
    pub response_time_ms: Option<f64>,
    pub sampled_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub service_id: String,
    pub status: String,
    pub degraded: bool,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub history: Vec<HealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub check_type: String,
    pub endpoint: String,
    pub status: String,
    pub response_time_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub message: Option<String>,
    pub checked_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub sequence: u64,
    pub event_type: String,
    pub severity: String,
    pub occurred_at: String,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logs {
    pub service_id: String,
    pub lines: usize,
    pub logs: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeRequest<'a> {
    pub folder_path: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleRequest {
    pub replica_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_keeps_path_prefix() {
        let client = ApiClient::new("http://controller:8080/fas").unwrap();
        assert_eq!(
            client.base_url().join("teams/a/services").unwrap().as_str(),
            "http://controller:8080/fas/teams/a/services"
        );
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(ApiClient::new("not a url").is_err());
    }

    #[test]
    fn test_non_json_error_body_is_kept() {
        let err = api_error(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(err.status, 502);
        assert_eq!(err.code, "unknown");
        assert_eq!(err.message, "upstream down");

        let err = api_error(StatusCode::NOT_FOUND, "");
        assert_eq!(err.message, "Not Found");
    }

    #[test]
    fn test_service_helpers_read_config() {
        let service: Service = serde_json::from_value(serde_json::json!({
            "id": "1", "team_id": "t", "workspace_id": "w", "name": "api",
            "folder_path": "api", "service_type": "nodejs", "confidence": 0.9,
            "status": "running", "created_at": "2026-01-01T00:00:00Z",
            "config": {
                "ports": [{ "container_port": 3000, "host_port": 8080 }],
                "scaling": { "current_replicas": 2, "target_replicas": 3 }
            }
        }))
        .unwrap();

        assert_eq!(service.host_ports(), vec![8080]);
        assert_eq!(service.replicas(), (2, 3));
    }
}
