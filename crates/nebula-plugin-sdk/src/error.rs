//! Worker runtime error types.

use nebula_core::RemoteError;
use thiserror::Error;

/// Errors that end a worker process.
#[derive(Debug, Error)]
pub enum SdkError {
    /// The worker was started as root without the explicit override.
    #[error("refusing to run as root; set NEBULA_PLUGIN_ALLOW_ROOT=1 to override")]
    RunningAsRoot,

    /// A required environment variable is missing or malformed.
    #[error("invalid worker environment: {0}")]
    Environment(String),

    /// The plugin's `initialize` hook failed.
    #[error("plugin initialization failed: {0}")]
    Initialize(RemoteError),

    /// Logging could not be installed.
    #[error(transparent)]
    Telemetry(#[from] nebula_telemetry::TelemetryError),

    /// Stdio failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for worker runtime operations.
pub type SdkResult<T> = Result<T, SdkError>;
