//! `sample_sync`: reconciles a fixed or supplied user list into the host.
//!
//! Payload: `{"users": [{username, db_name, role_tag, email, is_active}],
//! "dry_run": bool, "limit": n}`. Without `users` two demo accounts are
//! synced. Events are best-effort: a plugin without `events.emit` still
//! syncs.

use async_trait::async_trait;
use nebula_core::host::{
    DEFAULT_ROLE, HostApi, ListUsersRequest, SYSTEM_DB, SyncUserRequest, UpsertRoleRequest,
};
use nebula_core::protocol::methods;
use nebula_core::{HostCalls, RemoteError, WorkerPlugin};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

/// Plugin name, also used as the in-process factory name.
pub const NAME: &str = "sample_sync";

/// Role the sync ensures before touching users.
pub const CONTRACTOR_ROLE: &str = "contractor";

#[derive(Debug, Clone, Deserialize)]
struct UserEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    db_name: String,
    #[serde(default)]
    role_tag: String,
    #[serde(default)]
    email: String,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

impl UserEntry {
    fn demo(username: &str, role_tag: &str, email: &str) -> Self {
        Self {
            username: username.to_string(),
            db_name: SYSTEM_DB.to_string(),
            role_tag: role_tag.to_string(),
            email: email.to_string(),
            is_active: true,
        }
    }

    fn db_name(&self) -> &str {
        match self.db_name.trim() {
            "" => SYSTEM_DB,
            name => name,
        }
    }

    fn role_tag(&self) -> String {
        match self.role_tag.trim() {
            "" => DEFAULT_ROLE.to_string(),
            tag => tag.to_lowercase(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncPayload {
    #[serde(default)]
    users: Vec<UserEntry>,
    #[serde(default)]
    dry_run: bool,
    limit: Option<u64>,
}

impl SyncPayload {
    fn users(&self) -> Vec<UserEntry> {
        let users = if self.users.is_empty() {
            vec![
                UserEntry::demo("demo.alice", "developer", "alice@example.local"),
                UserEntry::demo("demo.bob", "tester", "bob@example.local"),
            ]
        } else {
            self.users.clone()
        };
        let limit = self
            .limit
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(usize::MAX);
        users.into_iter().take(limit).collect()
    }
}

/// The bundled user-sync plugin.
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleSync;

impl SampleSync {
    /// New instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn emit(host: HostApi<'_>, event: &str, payload: Value) {
        if let Err(e) = host.emit_event(event, payload).await {
            debug!(event, error = %e, "event not emitted");
        }
    }

    async fn sync_users(&self, params: Value, host: HostApi<'_>) -> Result<Value, RemoteError> {
        let payload: SyncPayload = if params.is_null() {
            SyncPayload::default()
        } else {
            serde_json::from_value(params)
                .map_err(|e| RemoteError::invalid_request(format!("invalid sync payload: {e}")))?
        };
        let users = payload.users();
        let dry_run = payload.dry_run;

        Self::emit(host, "sync.started", json!({ "plugin": NAME, "dry_run": dry_run })).await;

        if dry_run {
            let items: Vec<Value> = users
                .iter()
                .map(|u| {
                    json!({
                        "action": "would_sync",
                        "username": u.username.trim(),
                        "db_name": u.db_name(),
                        "role_tag": u.role_tag(),
                    })
                })
                .collect();
            let roles_available = match host.list_identity_roles().await {
                Ok(roles) => roles["count"].as_u64().unwrap_or(0),
                Err(e) => {
                    debug!(error = %e, "role listing unavailable");
                    0
                },
            };
            let preview = host
                .list_users(&ListUsersRequest {
                    db_name: SYSTEM_DB.to_string(),
                    limit: 10,
                    offset: 0,
                })
                .await;
            let users_preview_count = match preview {
                Ok(page) => page["count"].as_u64().unwrap_or(0),
                Err(e) => {
                    debug!(error = %e, "user preview unavailable");
                    0
                },
            };

            Self::emit(
                host,
                "sync.finished",
                json!({ "plugin": NAME, "dry_run": true, "count": items.len() }),
            )
            .await;
            return Ok(json!({
                "status": "dry_run",
                "count": items.len(),
                "items": items,
                "roles_available": roles_available,
                "users_preview_count": users_preview_count,
            }));
        }

        host.upsert_identity_role(&UpsertRoleRequest {
            name: CONTRACTOR_ROLE.to_string(),
            description: "External contractor role managed by sample plugin".to_string(),
            is_staff: false,
        })
        .await?;

        let mut items = Vec::with_capacity(users.len());
        for user in &users {
            let username = user.username.trim();
            if username.is_empty() {
                continue;
            }
            let synced = host
                .sync_user(&SyncUserRequest {
                    username: username.to_string(),
                    db_name: user.db_name().to_string(),
                    role_tag: user.role_tag(),
                    email: user.email.trim().to_string(),
                    is_active: user.is_active,
                })
                .await?;
            items.push(synced);
        }

        info!(count = items.len(), "users synced");
        Self::emit(
            host,
            "sync.finished",
            json!({ "plugin": NAME, "dry_run": false, "count": items.len() }),
        )
        .await;
        Ok(json!({ "status": "ok", "count": items.len(), "items": items }))
    }
}

#[async_trait]
impl WorkerPlugin for SampleSync {
    async fn initialize(&self, host: &dyn HostCalls) -> Result<(), RemoteError> {
        // Logging needs no scope, so a failure here means the host is gone.
        HostApi::new(host)
            .log("info", "sample_sync initialized")
            .await
            .map(|_| ())
    }

    async fn health(&self) -> Result<Value, RemoteError> {
        Ok(json!({ "status": "ok", "plugin": NAME }))
    }

    async fn handle(
        &self,
        method: &str,
        params: Value,
        host: &dyn HostCalls,
    ) -> Result<Value, RemoteError> {
        match method {
            methods::SYNC_USERS => self.sync_users(params, HostApi::new(host)).await,
            other => Err(RemoteError::method_not_found(other)),
        }
    }

    async fn shutdown(&self) {
        info!("sample_sync shutdown");
    }
}
