//! Core error types.

/// Errors raised while validating shared vocabulary types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// The plugin name does not match the naming rules.
    #[error("invalid plugin name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A scope token outside the fixed universe.
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
