//! Telemetry error types.

use thiserror::Error;

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The level, a directive or the target is invalid.
    #[error("logging configuration error: {0}")]
    ConfigError(String),

    /// A global subscriber is already installed.
    #[error("logging initialization error: {0}")]
    InitError(String),

    /// The log directory could not be prepared.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
