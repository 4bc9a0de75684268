//! REST surface, push channel, health checks and Prometheus metrics

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use controller_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::ControllerMetrics,
    ControlError, CreateServiceRequest, ServiceController, ServiceId, TopologyAnalysis,
    UpdateServiceRequest,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info};
use uuid::Uuid;

const DEFAULT_LOG_LINES: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ServiceController>,
    pub health_registry: HealthRegistry,
    pub metrics: ControllerMetrics,
}

impl AppState {
    pub fn new(
        controller: Arc<ServiceController>,
        health_registry: HealthRegistry,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            controller,
            health_registry,
            metrics,
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

/// Error body: `{error, code, details?}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Control(ControlError),
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError::Control(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Control(e) => match e {
                ControlError::Validation(_)
                | ControlError::PortConflict { .. }
                | ControlError::Scan { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                ControlError::Conflict { .. } | ControlError::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                ControlError::NotFound(_) => StatusCode::NOT_FOUND,
                ControlError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                ControlError::Runtime(_) | ControlError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            ApiError::Control(ControlError::PortConflict { port, holder }) => {
                Some(json!({ "port": port, "holder": holder }))
            }
            ApiError::Control(ControlError::Conflict { operation, .. }) => {
                Some(json!({ "operation": operation }))
            }
            ApiError::Control(ControlError::InvalidTransition { from, to }) => {
                Some(json!({ "from": from, "to": to }))
            }
            ApiError::Control(ControlError::Scan { path, .. }) => {
                Some(json!({ "path": path.display().to_string() }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, code) = match &self {
            ApiError::BadRequest(message) => (message.clone(), "bad_request"),
            ApiError::Control(e) => (e.to_string(), e.code()),
        };
        if status.is_server_error() {
            error!(code = code, error = %message, "Request failed");
        } else {
            debug!(code = code, error = %message, "Request rejected");
        }

        let mut body = json!({ "error": message, "code": code });
        if let Some(details) = self.details() {
            body["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(raw: &str) -> ApiResult<ServiceId> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid service id '{}'", raw)))
}

// ── Self-health and metrics ────────────────────────────────────────

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => ApiError::Control(ControlError::Internal(format!("metrics encoding: {e}")))
            .into_response(),
    }
}

// ── Analysis ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub folder_path: String,
}

#[derive(Debug, Deserialize)]
pub struct FolderQuery {
    pub folder_path: String,
}

async fn analyze(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> ApiResult<Json<TopologyAnalysis>> {
    let Json(request) = body?;
    let analysis = state
        .controller
        .analyze(&workspace_id, &request.folder_path)
        .await?;
    Ok(Json(analysis.as_ref().clone()))
}

async fn analyses(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    Query(query): Query<FolderQuery>,
) -> Json<Vec<TopologyAnalysis>> {
    Json(
        state
            .controller
            .analyses(&workspace_id, &query.folder_path)
            .iter()
            .map(|a| a.as_ref().clone())
            .collect(),
    )
}

// ── Services ───────────────────────────────────────────────────────

async fn create_service(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<String>,
    body: Result<Json<CreateServiceRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body?;
    let handle = state.controller.create(&team_id, request)?;
    Ok((StatusCode::CREATED, Json(handle.into_instance())).into_response())
}

async fn list_services(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<String>,
) -> impl IntoResponse {
    Json(state.controller.list(&team_id))
}

async fn get_service(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    Ok(Json(state.controller.get(&team_id, &id)?).into_response())
}

async fn update_service(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
    body: Result<Json<UpdateServiceRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    let Json(request) = body?;
    Ok(Json(state.controller.update(&team_id, id, request)?).into_response())
}

async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&service_id)?;
    state.controller.delete(&team_id, id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_service(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    let handle = state.controller.start(&team_id, id)?;
    Ok(Json(handle.into_instance()).into_response())
}

async fn stop_service(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    let handle = state.controller.stop(&team_id, id)?;
    Ok(Json(handle.into_instance()).into_response())
}

async fn restart_service(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    let handle = state.controller.restart(&team_id, id)?;
    Ok(Json(handle.into_instance()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replica_count: u32,
}

async fn scale_service(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
    body: Result<Json<ScaleRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    let Json(request) = body?;
    let handle = state
        .controller
        .scale(&team_id, id, request.replica_count)?;
    Ok(Json(handle.into_instance()).into_response())
}

async fn service_status(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    Ok(Json(state.controller.status(&team_id, &id)?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

async fn service_logs(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let logs = state.controller.logs(&team_id, &id, lines).await?;
    Ok(Json(json!({ "service_id": id, "lines": lines, "logs": logs })).into_response())
}

async fn service_metrics(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    Ok(Json(state.controller.metrics(&team_id, &id)?).into_response())
}

async fn service_health(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    Ok(Json(state.controller.health(&team_id, &id)?).into_response())
}

async fn service_events(
    State(state): State<Arc<AppState>>,
    Path((team_id, service_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_id(&service_id)?;
    Ok(Json(state.controller.events(&team_id, &id)?).into_response())
}

// ── Push channel ───────────────────────────────────────────────────

/// Server-sent events for one team; the event name is the event kind
async fn team_events(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.controller.subscribe(&team_id);
    info!(team_id = %team_id, "Push channel subscriber connected");

    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => Event::default()
            .event(event.kind())
            .json_data(&event)
            .ok()
            .map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Ok(Event::default()
            .event("lagged")
            .data(skipped.to_string()))),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let service = "/teams/:team_id/services/:service_id";
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/workspaces/:workspace_id/analyze", post(analyze))
        .route("/workspaces/:workspace_id/analyses", get(analyses))
        .route("/teams/:team_id/services", post(create_service).get(list_services))
        .route(
            service,
            get(get_service).put(update_service).delete(delete_service),
        )
        .route(&format!("{service}/start"), post(start_service))
        .route(&format!("{service}/stop"), post(stop_service))
        .route(&format!("{service}/restart"), post(restart_service))
        .route(&format!("{service}/scale"), post(scale_service))
        .route(&format!("{service}/status"), get(service_status))
        .route(&format!("{service}/logs"), get(service_logs))
        .route(&format!("{service}/metrics"), get(service_metrics))
        .route(&format!("{service}/health"), get(service_health))
        .route(&format!("{service}/events"), get(service_events))
        .route("/teams/:team_id/events", get(team_events))
        .with_state(state)
}

/// Start the API server, stopping when `shutdown` fires
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
