//! Layered error definitions
//!
//! Categorized by source: config / audio collaborators / registry.
//! Per-measurement rejections are not errors, see [`crate::RejectReason`].

use thiserror::Error;

use crate::DeviceId;

/// Unified error type for contract-level failures
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Audio Collaborator Errors =====
    /// The audio-window source could not supply the requested range
    #[error("audio window unavailable for {source_name} [{start:.3}, {end:.3}]")]
    WindowUnavailable {
        source_name: String,
        start: f64,
        end: f64,
    },

    // ===== Registry Errors =====
    /// Device id is not registered
    #[error("unknown device: {device_id}")]
    UnknownDevice { device_id: DeviceId },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create window unavailable error
    pub fn window_unavailable(source_name: impl Into<String>, start: f64, end: f64) -> Self {
        Self::WindowUnavailable {
            source_name: source_name.into(),
            start,
            end,
        }
    }
}
