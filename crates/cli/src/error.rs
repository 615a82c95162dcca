//! Error types for CLI operations.

use std::path::Path;

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Flag combination that cannot be simulated
    #[error("Invalid simulation setup: {message}")]
    InvalidSimulation { message: String },

    /// Engine refused to start or stopped early
    #[error("Sync engine failed: {message}")]
    Engine { message: String },
}

impl CliError {
    pub fn config_not_found(path: &Path) -> Self {
        Self::ConfigNotFound {
            path: path.display().to_string(),
        }
    }

    pub fn invalid_simulation(message: impl Into<String>) -> Self {
        Self::InvalidSimulation {
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }
}
