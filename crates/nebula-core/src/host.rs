//! Typed host calls.
//!
//! The request structs are the `params` of the `host.*` methods. Plugins use
//! [`HostApi`] to issue them; the host bridge deserializes the same structs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{RemoteError, methods};
use crate::worker::HostCalls;

/// Database that holds host-level users.
pub const SYSTEM_DB: &str = "system.db";

/// Role tag used when none is given or the given one normalises to nothing.
pub const DEFAULT_ROLE: &str = "user";

fn default_db() -> String {
    SYSTEM_DB.to_string()
}

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_list_limit() -> i64 {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Params for `host.sync_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUserRequest {
    /// Username, required.
    pub username: String,
    /// Target database.
    #[serde(default = "default_db")]
    pub db_name: String,
    /// Identity tag to assign.
    #[serde(default = "default_role")]
    pub role_tag: String,
    /// Optional email address; empty means none.
    #[serde(default)]
    pub email: String,
    /// Whether the account is active.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Params for `host.list_users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListUsersRequest {
    /// Database to list.
    #[serde(default = "default_db")]
    pub db_name: String,
    /// Page size, clamped by the host.
    #[serde(default = "default_list_limit")]
    pub limit: i64,
    /// Page offset, clamped to zero by the host.
    #[serde(default)]
    pub offset: i64,
}

impl Default for ListUsersRequest {
    fn default() -> Self {
        Self {
            db_name: default_db(),
            limit: default_list_limit(),
            offset: 0,
        }
    }
}

/// Params for `host.upsert_identity_role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertRoleRequest {
    /// Role name; normalised into a role token.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Whether members are staff.
    #[serde(default)]
    pub is_staff: bool,
}

/// Params for `host.set_identity_tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetIdentityTagRequest {
    /// Username, required.
    pub username: String,
    /// Database the user lives in.
    #[serde(default = "default_db")]
    pub db_name: String,
    /// Identity tag to assign.
    #[serde(default = "default_role")]
    pub role_tag: String,
}

/// Params for `host.emit_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitEventRequest {
    /// Event name local to the plugin, e.g. `sync.started`.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
}

/// Params for `host.log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    /// `trace`, `debug`, `info`, `warn` or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// The line to log.
    pub message: String,
}

/// Normalise a role name into a role token.
///
/// Lowercases, replaces anything other than ASCII alphanumerics, `-` and `_`
/// with `-`, trims leading and trailing `-`/`_`, and falls back to
/// [`DEFAULT_ROLE`].
#[must_use]
pub fn normalize_role_token(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let token = mapped.trim_matches(|c| c == '-' || c == '_');
    if token.is_empty() {
        DEFAULT_ROLE.to_string()
    } else {
        token.to_string()
    }
}

/// Typed wrapper over [`HostCalls`].
#[derive(Clone, Copy)]
pub struct HostApi<'a> {
    calls: &'a dyn HostCalls,
}

impl<'a> HostApi<'a> {
    /// Wrap a raw host-call implementation.
    #[must_use]
    pub fn new(calls: &'a dyn HostCalls) -> Self {
        Self { calls }
    }

    async fn call<T: Serialize>(&self, method: &str, params: &T) -> Result<Value, RemoteError> {
        let params = serde_json::to_value(params)
            .map_err(|e| RemoteError::invalid_request(e.to_string()))?;
        self.calls.host_call(method, params).await
    }

    /// Upsert a user and assign its identity tag.
    ///
    /// # Errors
    ///
    /// Returns the host's error, e.g. a scope denial.
    pub async fn sync_user(&self, req: &SyncUserRequest) -> Result<Value, RemoteError> {
        self.call(methods::HOST_SYNC_USER, req).await
    }

    /// List users with their identity tags.
    ///
    /// # Errors
    ///
    /// Returns the host's error, e.g. a scope denial.
    pub async fn list_users(&self, req: &ListUsersRequest) -> Result<Value, RemoteError> {
        self.call(methods::HOST_LIST_USERS, req).await
    }

    /// List identity roles.
    ///
    /// # Errors
    ///
    /// Returns the host's error, e.g. a scope denial.
    pub async fn list_identity_roles(&self) -> Result<Value, RemoteError> {
        self.calls
            .host_call(methods::HOST_LIST_IDENTITY_ROLES, Value::Null)
            .await
    }

    /// Create or update an identity role.
    ///
    /// # Errors
    ///
    /// Returns the host's error, e.g. a scope denial.
    pub async fn upsert_identity_role(&self, req: &UpsertRoleRequest) -> Result<Value, RemoteError> {
        self.call(methods::HOST_UPSERT_IDENTITY_ROLE, req).await
    }

    /// Assign an identity tag.
    ///
    /// # Errors
    ///
    /// Returns the host's error, e.g. a scope denial.
    pub async fn set_identity_tag(
        &self,
        req: &SetIdentityTagRequest,
    ) -> Result<Value, RemoteError> {
        self.call(methods::HOST_SET_IDENTITY_TAG, req).await
    }

    /// Emit an event; the host prefixes it with the plugin namespace.
    ///
    /// # Errors
    ///
    /// Returns the host's error, e.g. a scope denial.
    pub async fn emit_event(&self, event: &str, payload: Value) -> Result<Value, RemoteError> {
        let req = EmitEventRequest {
            event: event.to_string(),
            payload,
        };
        self.call(methods::HOST_EMIT_EVENT, &req).await
    }

    /// Write a line into the host log.
    ///
    /// # Errors
    ///
    /// Returns the host's error.
    pub async fn log(&self, level: &str, message: &str) -> Result<Value, RemoteError> {
        let req = LogRequest {
            level: level.to_string(),
            message: message.to_string(),
        };
        self.call(methods::HOST_LOG, &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_normalize_role_token() {
        assert_eq!(normalize_role_token("Developer"), "developer");
        assert_eq!(normalize_role_token("  QA Team! "), "qa-team");
        assert_eq!(normalize_role_token("__ops__"), "ops");
        assert_eq!(normalize_role_token("***"), "user");
        assert_eq!(normalize_role_token(""), "user");
    }

    #[test]
    fn test_sync_user_defaults() {
        let req: SyncUserRequest = serde_json::from_value(json!({"username": "alice"})).unwrap();
        assert_eq!(req.db_name, SYSTEM_DB);
        assert_eq!(req.role_tag, DEFAULT_ROLE);
        assert!(req.is_active);
        assert!(req.email.is_empty());
    }

    #[test]
    fn test_list_users_defaults() {
        let req: ListUsersRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req, ListUsersRequest::default());
        assert_eq!(req.limit, 200);
    }

    struct Recorder(Mutex<Vec<(String, Value)>>);

    #[async_trait]
    impl HostCalls for Recorder {
        async fn host_call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
            self.0.lock().unwrap().push((method.to_string(), params));
            Ok(json!({"status": "ok"}))
        }
    }

    #[tokio::test]
    async fn test_host_api_routes_methods() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let api = HostApi::new(&recorder);

        api.emit_event("sync.started", json!({"n": 1})).await.unwrap();
        api.list_identity_roles().await.unwrap();

        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls[0].0, methods::HOST_EMIT_EVENT);
        assert_eq!(calls[0].1["event"], "sync.started");
        assert_eq!(calls[1].0, methods::HOST_LIST_IDENTITY_ROLES);
    }
}
