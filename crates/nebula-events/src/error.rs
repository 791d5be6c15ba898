//! Event errors.

use thiserror::Error;

/// Errors raised when emitting events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    /// The event name is empty or malformed.
    #[error("invalid event name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The sink cannot accept events.
    #[error("event sink unavailable: {0}")]
    Unavailable(String),
}

/// Result type for event operations.
pub type EventResult<T> = Result<T, EventError>;
