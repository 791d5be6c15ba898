//! Worker wire protocol.
//!
//! Frames are JSON objects, one per line, exchanged over the worker's
//! stdin (host to worker) and stdout (worker to host). Either side may issue
//! a [`Frame::Request`]; the peer answers with a [`Frame::Response`] carrying
//! the same `id`. Request ids are scoped to the direction they travel in.
//!
//! A [`Frame::Cancel`] tells the worker that the host stopped waiting for a
//! request. The worker aborts that handler and keeps serving.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Largest accepted frame, in bytes, excluding the newline.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Method names understood by every worker and by the host bridge.
pub mod methods {
    /// Lightweight liveness probe.
    pub const HEALTH: &str = "health";
    /// Request an orderly worker shutdown.
    pub const SHUTDOWN: &str = "shutdown";
    /// Reconcile users from an external directory.
    pub const SYNC_USERS: &str = "sync_users";

    /// Upsert one user and its identity tag.
    pub const HOST_SYNC_USER: &str = "host.sync_user";
    /// List users with their identity tags.
    pub const HOST_LIST_USERS: &str = "host.list_users";
    /// List identity roles.
    pub const HOST_LIST_IDENTITY_ROLES: &str = "host.list_identity_roles";
    /// Create or update an identity role.
    pub const HOST_UPSERT_IDENTITY_ROLE: &str = "host.upsert_identity_role";
    /// Assign an identity tag to a user.
    pub const HOST_SET_IDENTITY_TAG: &str = "host.set_identity_tag";
    /// Emit a namespaced event.
    pub const HOST_EMIT_EVENT: &str = "host.emit_event";
    /// Write a line into the host log.
    pub const HOST_LOG: &str = "host.log";
}

/// Stable error codes carried in [`RemoteError::code`].
pub mod codes {
    /// The caller lacks a required scope.
    pub const SCOPE_DENIED: &str = "scope_denied";
    /// The request payload was malformed or incomplete.
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// No handler exists for the method.
    pub const METHOD_NOT_FOUND: &str = "method_not_found";
    /// The handler failed.
    pub const INTERNAL: &str = "internal";
    /// The request was cancelled before completion.
    pub const CANCELLED: &str = "cancelled";
    /// A host collaborator (event sink, directory) is unavailable.
    pub const UNAVAILABLE: &str = "unavailable";
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A call expecting exactly one response.
    Request {
        /// Correlation id, unique per direction.
        id: u64,
        /// Method name.
        method: String,
        /// Method parameters.
        #[serde(default)]
        params: Value,
    },
    /// The answer to a request.
    Response {
        /// Id of the request being answered.
        id: u64,
        /// Successful result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Failure, mutually exclusive with `result`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
    /// The sender no longer waits for the request with this id.
    Cancel {
        /// Id of the abandoned request.
        id: u64,
    },
}

impl Frame {
    /// Build a response frame from a handler outcome.
    #[must_use]
    pub fn response(id: u64, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(result) => Frame::Response {
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => Frame::Response {
                id,
                result: None,
                error: Some(error),
            },
        }
    }

    /// Serialize to a single newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Protocol`] if the frame cannot be serialized or
    /// exceeds [`MAX_FRAME_BYTES`].
    pub fn encode(&self) -> CoreResult<String> {
        let mut line =
            serde_json::to_string(self).map_err(|e| CoreError::Protocol(e.to_string()))?;
        if line.len() > MAX_FRAME_BYTES {
            return Err(CoreError::Protocol(format!(
                "frame is {} bytes, exceeding the {MAX_FRAME_BYTES} byte limit",
                line.len()
            )));
        }
        line.push('\n');
        Ok(line)
    }

    /// Parse one line (with or without its trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Protocol`] for oversized or malformed frames.
    pub fn decode(line: &str) -> CoreResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() > MAX_FRAME_BYTES {
            return Err(CoreError::Protocol(format!(
                "frame is {} bytes, exceeding the {MAX_FRAME_BYTES} byte limit",
                line.len()
            )));
        }
        serde_json::from_str(line).map_err(|e| CoreError::Protocol(e.to_string()))
    }
}

/// An error reported across the worker boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    /// Machine-readable code, see [`codes`].
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl RemoteError {
    /// Create an error with an explicit code.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// A missing-scope error.
    #[must_use]
    pub fn scope_denied(message: impl Into<String>) -> Self {
        Self::new(codes::SCOPE_DENIED, message)
    }

    /// A malformed-request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    /// An unknown-method error.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("method {method} is not implemented"),
        )
    }

    /// A handler failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, message)
    }

    /// Whether this error is a scope denial.
    #[must_use]
    pub fn is_scope_denied(&self) -> bool {
        self.code == codes::SCOPE_DENIED
    }
}
