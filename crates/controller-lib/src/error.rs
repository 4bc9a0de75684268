//! Error types for the service control plane

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::models::ServiceStatus;

/// Classification of a container runtime failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeErrorKind {
    /// Worth retrying (registry timeout, connection reset, throttling)
    Transient,
    /// Retrying will not help (malformed build file, missing image)
    Permanent,
}

impl std::fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeErrorKind::Transient => write!(f, "transient"),
            RuntimeErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure reported by a container runtime adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} runtime failure: {message}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: RuntimeErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: RuntimeErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RuntimeErrorKind::Transient
    }
}

/// Errors surfaced by the control plane
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Failed to scan {path}: {message}")]
    Scan { path: PathBuf, message: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Host port {port} is already bound by service {holder}")]
    PortConflict { port: u16, holder: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ServiceStatus,
        to: ServiceStatus,
    },

    #[error("Conflicting operation in progress for service {service_id}: {operation}")]
    Conflict {
        service_id: String,
        operation: String,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn scan(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::Scan {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Stable machine-readable code for API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Scan { .. } => "scan_error",
            ControlError::Validation(_) => "validation_error",
            ControlError::PortConflict { .. } => "port_conflict",
            ControlError::InvalidTransition { .. } => "invalid_transition",
            ControlError::Conflict { .. } => "conflict",
            ControlError::Runtime(e) => match e.kind {
                RuntimeErrorKind::Transient => "runtime_transient",
                RuntimeErrorKind::Permanent => "runtime_permanent",
            },
            ControlError::NotFound(_) => "not_found",
            ControlError::PermissionDenied(_) => "permission_denied",
            ControlError::Internal(_) => "internal_error",
        }
    }

    /// Validation-class errors never change instance state
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ControlError::Validation(_)
                | ControlError::PortConflict { .. }
                | ControlError::InvalidTransition { .. }
        )
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Internal(format!("serialization: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
