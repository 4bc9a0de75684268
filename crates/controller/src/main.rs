//! Folder-as-a-service controller
//!
//! Serves the REST surface and push channel, runs deployments against the
//! configured container runtime and monitors running services.

use anyhow::Result;
use controller_lib::{
    executor::create_runtime,
    health::{components, HealthRegistry},
    observability::{ControllerMetrics, StructuredLogger},
    ServiceController,
};
use fas_controller::{api, config};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fas-controller");

    // Load configuration
    let config = config::ControllerConfig::load()?;
    info!(
        instance = %config.instance_name,
        api_port = config.api_port,
        runtime = ?config.runtime,
        "Controller configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let metrics = ControllerMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);

    let runtime = create_runtime(config.runtime, &config.docker_binary);
    let runtime_name = runtime.name();
    let controller = Arc::new(ServiceController::new(runtime, config.controller_config()));

    match controller.ping_runtime().await {
        Ok(()) => health_registry.set_healthy(components::RUNTIME).await,
        Err(e) => {
            warn!(error = %e, "Container runtime unreachable");
            health_registry
                .set_degraded(components::RUNTIME, e.to_string())
                .await;
        }
    }

    let restored = match controller.restore() {
        Ok(restored) => restored,
        Err(e) => {
            warn!(error = %e, "Failed to restore state; starting empty");
            health_registry
                .set_degraded(components::STORE, e.to_string())
                .await;
            0
        }
    };
    logger.log_startup(CONTROLLER_VERSION, runtime_name, restored);

    let (shutdown_tx, _) = broadcast::channel(4);
    let background = controller.spawn_background(health_registry.clone(), &shutdown_tx);

    let app_state = Arc::new(api::AppState::new(
        Arc::clone(&controller),
        health_registry.clone(),
        metrics,
    ));

    // Mark controller as ready after initialization
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    for task in background {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server stopped with an error"),
        Err(e) => warn!(error = %e, "API server task ended abnormally"),
        Ok(Ok(())) => {}
    }
    info!("Shutdown complete");

    Ok(())
}
