// packages/proclaunch/src/utils/errors.rs
//! Crate-wide error type
//!
//! Failures of an individual child process are *not* errors in this sense:
//! they travel as [`crate::runtime::BackendEvent::Error`] notifications to
//! the backend's owner. `LaunchError` covers everything the caller gets back
//! synchronously.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, LaunchError>;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("No factory can create a backend for program '{0}'")]
    NoMatchingFactory(String),

    #[error("Invalid process configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Schema validation failed: {0}")]
    SchemaViolation(String),

    #[error("Launcher connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl LaunchError {
    /// Protocol errors are recoverable per frame; everything else on a
    /// connection is fatal to it.
    pub fn is_protocol(&self) -> bool {
        matches!(self, LaunchError::Protocol(_) | LaunchError::Json(_))
    }
}
