//! Deployment execution against a container runtime
//!
//! The [`ContainerRuntime`] trait is the narrow contract with the container
//! engine. [`DeploymentExecutor`] drives it off the request path and reports
//! every outcome back through the lifecycle manager.

mod deploy;
mod docker;
mod in_memory;

#[cfg(test)]
pub(crate) mod tests;

pub use deploy::{DeploymentExecutor, ExecutorConfig, OperationHandle};
pub(crate) use deploy::until_cancelled;
pub use docker::DockerCliRuntime;
pub use in_memory::InMemoryRuntime;

use crate::error::RuntimeError;
use crate::models::{DeploymentConfig, ResourceSample, ServiceId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use async_trait::async_trait;

/// Runtime-side identity of a service, shared by all of its replicas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub id: ServiceId,
    pub name: String,
}

impl ServiceRef {
    pub fn new(id: ServiceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Label value attached to every container of the service
    pub fn label(&self) -> String {
        self.id.to_string()
    }
}

/// Result of a replica count change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOutcome {
    Complete,
    /// Only this many replicas are running
    Partial(u32),
}

/// Contract with the container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short name used in logs and configuration
    fn name(&self) -> &'static str;

    /// Build an image from `folder` and the build file, returning the image reference
    async fn build(&self, service: &ServiceRef, folder: &Path, build_file: &str) -> Result<String, RuntimeError>;

    /// Start the first replica, returning the container reference
    async fn start(
        &self,
        service: &ServiceRef,
        image: &str,
        config: &DeploymentConfig,
    ) -> Result<String, RuntimeError>;

    async fn stop(&self, container: &str) -> Result<(), RuntimeError>;

    async fn restart(&self, container: &str) -> Result<(), RuntimeError>;

    /// Converge the service to `replicas` running replicas
    async fn scale(&self, service: &ServiceRef, replicas: u32) -> Result<ScaleOutcome, RuntimeError>;

    async fn stats(&self, container: &str) -> Result<ResourceSample, RuntimeError>;

    async fn logs(&self, container: &str, lines: usize) -> Result<String, RuntimeError>;

    /// Run a command inside the container, returning its exit code
    async fn exec(&self, container: &str, command: &str) -> Result<i32, RuntimeError>;

    /// Best-effort kill of everything belonging to the service
    async fn cancel(&self, service: &ServiceRef) -> Result<(), RuntimeError>;

    /// Whether the engine is reachable
    async fn ping(&self) -> Result<(), RuntimeError>;
}

/// Runtime selected in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    #[default]
    Docker,
    InMemory,
}

/// Create the configured runtime adapter
pub fn create_runtime(kind: RuntimeKind, docker_binary: &str) -> Arc<dyn ContainerRuntime> {
    match kind {
        RuntimeKind::Docker => {
            tracing::info!(binary = %docker_binary, "Using docker CLI runtime");
            Arc::new(DockerCliRuntime::new(docker_binary))
        }
        RuntimeKind::InMemory => {
            tracing::warn!("Using in-memory runtime; no containers will be started");
            Arc::new(InMemoryRuntime::new())
        }
    }
}
