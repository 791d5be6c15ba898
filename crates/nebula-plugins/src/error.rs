//! Plugin runtime error types.

use std::path::PathBuf;
use std::time::Duration;

use nebula_core::{CoreError, PluginName, RemoteError};

/// Errors from plugin runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// A manifest or entry point is invalid. Localized to one plugin.
    #[error("failed to load plugin {plugin}: {reason}")]
    Load {
        /// Plugin key, as far as it could be determined.
        plugin: String,
        /// Why loading failed.
        reason: String,
    },

    /// The channel to the worker broke. Treated like a crash.
    #[error("transport to plugin {plugin} failed: {message}")]
    Transport {
        /// Affected plugin.
        plugin: PluginName,
        /// What broke.
        message: String,
    },

    /// A call exceeded its timeout. The worker stays alive.
    #[error("call {method} to plugin {plugin} timed out after {timeout:?}")]
    Timeout {
        /// Affected plugin.
        plugin: PluginName,
        /// The method that timed out.
        method: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// The worker was stopped or replaced while the call was in flight.
    #[error("call {method} to plugin {plugin} was cancelled: worker stopped")]
    Cancelled {
        /// Affected plugin.
        plugin: PluginName,
        /// The method that was cut short.
        method: String,
    },

    /// The plugin lacks a scope for the operation.
    #[error("plugin {plugin} lacks scope: {message}")]
    ScopeDenied {
        /// Affected plugin.
        plugin: PluginName,
        /// Which scope is missing.
        message: String,
    },

    /// Resource isolation is required but unavailable. Activation fails closed.
    #[error("resource isolation unavailable: {0}")]
    ResourceBackend(String),

    /// A restart or crash budget is exhausted.
    #[error("plugin {plugin} disabled: {message}")]
    BudgetExceeded {
        /// Affected plugin.
        plugin: PluginName,
        /// Which budget.
        message: String,
    },

    /// No plugin with this name is loaded.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// The plugin is in a state that does not accept calls.
    #[error("plugin {plugin} is not callable while {status}")]
    NotCallable {
        /// Affected plugin.
        plugin: PluginName,
        /// Current lifecycle state.
        status: String,
    },

    /// The worker answered with an application error.
    #[error("plugin {plugin} returned an error: {error}")]
    Remote {
        /// Affected plugin.
        plugin: PluginName,
        /// The error as reported.
        error: RemoteError,
    },

    /// A plugin name failed validation.
    #[error(transparent)]
    InvalidName(#[from] CoreError),

    /// The caller's request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The manager is shut down or not started.
    #[error("plugin manager is not running")]
    NotRunning,

    /// Reading a log or status file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl PluginError {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load_error",
            Self::Transport { .. } => "transport_error",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::ScopeDenied { .. } => "scope_denied",
            Self::ResourceBackend(_) => "resource_backend_error",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::NotFound(_) => "not_found",
            Self::NotCallable { .. } => "not_callable",
            Self::Remote { .. } => "remote_error",
            Self::InvalidName(_) => "invalid_name",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotRunning => "not_running",
            Self::Io { .. } => "io_error",
        }
    }

    /// Build from a worker's error reply, keeping scope denials distinct.
    #[must_use]
    pub fn from_remote(plugin: &PluginName, error: RemoteError) -> Self {
        if error.is_scope_denied() {
            Self::ScopeDenied {
                plugin: plugin.clone(),
                message: error.message,
            }
        } else {
            Self::Remote {
                plugin: plugin.clone(),
                error,
            }
        }
    }

    /// Structured form for host-facing `invoke` replies.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }

    pub(crate) fn load(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(plugin: &PluginName, message: impl Into<String>) -> Self {
        Self::Transport {
            plugin: plugin.clone(),
            message: message.into(),
        }
    }

    pub(crate) fn cancelled(plugin: &PluginName, method: &str) -> Self {
        Self::Cancelled {
            plugin: plugin.clone(),
            method: method.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for plugin runtime operations.
pub type PluginResult<T> = Result<T, PluginError>;
