//! Control plane library for folder-as-a-service
//!
//! This crate provides the core functionality for:
//! - Folder analysis and service detection
//! - Deployment configuration from recommendations and overrides
//! - The service lifecycle state machine and its single-writer rule
//! - Background deployment against a pluggable container runtime
//! - Health checks, metric sampling and replica scaling
//! - The per-team push channel and self-observability

pub mod analyzer;
pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod scaling;
pub mod spec_builder;

pub use controller::{ServiceController, ServiceControllerConfig};
pub use error::{ControlError, Result, RuntimeError, RuntimeErrorKind};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
