//! Capability bridge.
//!
//! Every `host.*` call a plugin makes lands in [`ScopedContext::dispatch`].
//! A call is allowed only if its scopes are in the plugin's effective set
//! (declared ∩ allowed, fixed at activation) *and* still in the host
//! allow-list, so revocations apply to the next call while grants never
//! widen a running worker.
//!
//! Writes are answered with a `would_*` report instead of touching the
//! directory when the request runs in dry-run mode. The mode is decided when
//! a request is admitted: [`PinnedHost`] carries it explicitly, and a bare
//! dispatch uses whatever [`DryRunGuard`]s are held at that moment.

mod directory;

pub use directory::{
    DirectoryError, HostDirectory, InMemoryDirectory, RoleRecord, UserRecord, UserUpsert, Upserted,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use nebula_core::host::{
    EmitEventRequest, ListUsersRequest, LogRequest, SYSTEM_DB, SetIdentityTagRequest,
    SyncUserRequest, UpsertRoleRequest, normalize_role_token,
};
use nebula_core::protocol::{RemoteError, codes, methods};
use nebula_core::{HostCalls, PluginName, Scope, ScopeSet};
use nebula_events::{EventSink, PluginEvent};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, error, info, trace, warn};

/// Largest `host.list_users` page.
pub const MAX_LIST_LIMIT: i64 = 2000;

/// Host-wide scope allow-list, shared by every plugin.
#[derive(Debug, Default)]
pub struct AllowList {
    scopes: RwLock<ScopeSet>,
}

impl AllowList {
    /// Allow-list with the given scopes.
    #[must_use]
    pub fn new(scopes: ScopeSet) -> Self {
        Self {
            scopes: RwLock::new(scopes),
        }
    }

    /// Whether `scope` is currently allowed.
    #[must_use]
    pub fn contains(&self, scope: Scope) -> bool {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(scope)
    }

    /// Current contents.
    #[must_use]
    pub fn snapshot(&self) -> ScopeSet {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove a scope. Running workers lose it on their next call.
    pub fn revoke(&self, scope: Scope) -> bool {
        self.scopes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope)
    }

    /// Add a scope. Only later activations see it.
    pub fn grant(&self, scope: Scope) -> bool {
        self.scopes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope)
    }
}

/// Keeps a plugin's host writes in dry-run mode while alive.
#[derive(Debug)]
pub struct DryRunGuard {
    holds: Arc<AtomicUsize>,
}

impl Drop for DryRunGuard {
    fn drop(&mut self) {
        self.holds.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Normalise a database name.
///
/// Empty and `system.db` address the host database. Anything else is a
/// client database: no path separators or `..`, `.db` appended if missing,
/// `[A-Za-z0-9][A-Za-z0-9_.-]{0,63}.db`, and not the reserved system name.
///
/// # Errors
///
/// Returns an `invalid_request` error for names that break those rules.
pub fn normalize_db_name(raw: &str) -> Result<String, RemoteError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == SYSTEM_DB {
        return Ok(SYSTEM_DB.to_string());
    }
    let invalid = |reason: &str| {
        RemoteError::invalid_request(format!("invalid database name '{raw}': {reason}"))
    };
    if raw.contains('/') || raw.contains('\\') || raw.contains("..") || raw.contains('\0') {
        return Err(invalid("path components are not allowed"));
    }
    let name = if raw.ends_with(".db") {
        raw.to_string()
    } else {
        format!("{raw}.db")
    };
    if name == SYSTEM_DB {
        return Err(invalid("system.db is reserved"));
    }
    let stem = name.strip_suffix(".db").unwrap_or(&name);
    let mut chars = stem.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok || stem.len() > 64 {
        return Err(invalid("unsupported characters"));
    }
    Ok(name)
}

/// The guarded API surface of one plugin.
pub struct ScopedContext {
    plugin: PluginName,
    effective: ScopeSet,
    allow_list: Arc<AllowList>,
    directory: Arc<dyn HostDirectory>,
    events: Arc<dyn EventSink>,
    dry_run_holds: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ScopedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedContext")
            .field("plugin", &self.plugin)
            .field("effective", &self.effective)
            .field("dry_run_holds", &self.dry_run_holds.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ScopedContext {
    /// Build the context for one activation.
    #[must_use]
    pub fn new(
        plugin: PluginName,
        declared: &ScopeSet,
        allow_list: Arc<AllowList>,
        directory: Arc<dyn HostDirectory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let effective = declared.intersection(&allow_list.snapshot());
        debug!(plugin = %plugin, effective = %effective, "scopes granted");
        Self {
            plugin,
            effective,
            allow_list,
            directory,
            events,
            dry_run_holds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Plugin this context serves.
    #[must_use]
    pub fn plugin(&self) -> &PluginName {
        &self.plugin
    }

    /// Scopes granted at activation.
    #[must_use]
    pub fn effective(&self) -> &ScopeSet {
        &self.effective
    }

    /// Whether `scope` may be exercised right now.
    #[must_use]
    pub fn allows(&self, scope: Scope) -> bool {
        self.effective.contains(scope) && self.allow_list.contains(scope)
    }

    /// Check every scope in `required`.
    ///
    /// # Errors
    ///
    /// Returns a `scope_denied` error naming the first missing scope.
    pub fn check(&self, required: &[Scope]) -> Result<(), RemoteError> {
        for &scope in required {
            if !self.effective.contains(scope) {
                return Err(RemoteError::scope_denied(format!(
                    "plugin {} lacks scope {scope}",
                    self.plugin
                )));
            }
            if !self.allow_list.contains(scope) {
                return Err(RemoteError::scope_denied(format!(
                    "scope {scope} has been revoked by the host"
                )));
            }
        }
        Ok(())
    }

    /// Route host writes to dry-run reports until the guard is dropped.
    /// Guards nest; the mode ends with the last one.
    #[must_use]
    pub fn enter_dry_run(&self) -> DryRunGuard {
        self.dry_run_holds.fetch_add(1, Ordering::SeqCst);
        DryRunGuard {
            holds: Arc::clone(&self.dry_run_holds),
        }
    }

    /// Whether any dry-run guard is held.
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run_holds.load(Ordering::SeqCst) > 0
    }

    /// A handle that serves requests with the write mode fixed to `dry_run`.
    #[must_use]
    pub fn pinned(self: &Arc<Self>, dry_run: bool) -> PinnedHost {
        PinnedHost {
            ctx: Arc::clone(self),
            dry_run,
        }
    }

    /// Pin the mode in force right now.
    #[must_use]
    pub fn pin_current(self: &Arc<Self>) -> PinnedHost {
        self.pinned(self.is_dry_run())
    }

    fn actor(&self) -> String {
        format!("plugin:{}", self.plugin)
    }

    /// Serve one `host.*` call in the mode currently in force.
    ///
    /// # Errors
    ///
    /// See [`dispatch_as`](Self::dispatch_as).
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        self.dispatch_as(method, params, self.is_dry_run()).await
    }

    /// Serve one `host.*` call, with writes reported instead of performed
    /// when `dry_run` is set.
    ///
    /// # Errors
    ///
    /// Returns `scope_denied`, `invalid_request`, `method_not_found` or
    /// `unavailable` errors as appropriate.
    pub async fn dispatch_as(
        &self,
        method: &str,
        params: Value,
        dry_run: bool,
    ) -> Result<Value, RemoteError> {
        trace!(plugin = %self.plugin, method, dry_run, "host call");
        let outcome = match method {
            methods::HOST_SYNC_USER => self.sync_user(parse(params)?, dry_run).await,
            methods::HOST_LIST_USERS => self.list_users(parse_or_default(params)?).await,
            methods::HOST_LIST_IDENTITY_ROLES => self.list_identity_roles().await,
            methods::HOST_UPSERT_IDENTITY_ROLE => {
                self.upsert_identity_role(parse(params)?, dry_run).await
            },
            methods::HOST_SET_IDENTITY_TAG => self.set_identity_tag(parse(params)?, dry_run).await,
            methods::HOST_EMIT_EVENT => self.emit_event(parse(params)?),
            methods::HOST_LOG => Ok(self.log(parse(params)?)),
            other => Err(RemoteError::method_not_found(other)),
        };
        if let Err(e) = &outcome
            && e.is_scope_denied()
        {
            warn!(plugin = %self.plugin, method, reason = %e.message, "host call denied");
        }
        outcome
    }

    async fn sync_user(&self, req: SyncUserRequest, dry_run: bool) -> Result<Value, RemoteError> {
        self.check(&[Scope::UsersWrite, Scope::IdentityTagsWrite])?;
        let username = required_username(&req.username)?;
        let db_name = normalize_db_name(&req.db_name)?;
        let role_tag = normalize_role_token(&req.role_tag);

        if dry_run {
            return Ok(json!({
                "action": "would_sync",
                "username": username,
                "db_name": db_name,
                "role_tag": role_tag,
                "dry_run": true,
            }));
        }

        let actor = self.actor();
        let (user, upserted) = self
            .directory
            .upsert_user(
                &db_name,
                UserUpsert {
                    username: username.clone(),
                    email: req.email.trim().to_string(),
                    is_active: req.is_active,
                    updated_by: actor.clone(),
                },
            )
            .await
            .map_err(unavailable)?;
        self.directory
            .set_identity_tag(&db_name, &username, &role_tag, &actor)
            .await
            .map_err(unavailable)?;

        Ok(json!({
            "action": upserted.as_str(),
            "username": username,
            "db_name": db_name,
            "role_tag": role_tag,
            "user_id": user.id,
        }))
    }

    async fn list_users(&self, req: ListUsersRequest) -> Result<Value, RemoteError> {
        self.check(&[Scope::UsersRead, Scope::IdentityTagsRead])?;
        let db_name = normalize_db_name(&req.db_name)?;
        let limit = usize::try_from(req.limit.clamp(1, MAX_LIST_LIMIT)).unwrap_or(1);
        let offset = usize::try_from(req.offset.max(0)).unwrap_or(0);

        let users = self
            .directory
            .list_users(&db_name, limit, offset)
            .await
            .map_err(unavailable)?;
        let items: Vec<Value> = users
            .iter()
            .map(|u| {
                let role_tag = u.role_tag.clone().unwrap_or_else(|| {
                    if u.is_staff { "admin" } else { "user" }.to_string()
                });
                json!({
                    "id": u.id,
                    "username": u.username,
                    "email": u.email,
                    "is_staff": u.is_staff,
                    "is_active": u.is_active,
                    "role_tag": role_tag,
                })
            })
            .collect();
        Ok(json!({ "db_name": db_name, "count": items.len(), "items": items }))
    }

    async fn list_identity_roles(&self) -> Result<Value, RemoteError> {
        self.check(&[Scope::RolesRead])?;
        let roles = self.directory.list_roles().await.map_err(unavailable)?;
        let items: Vec<Value> = roles
            .iter()
            .map(|r| json!({ "name": r.name, "description": r.description, "is_staff": r.is_staff }))
            .collect();
        Ok(json!({ "count": items.len(), "items": items }))
    }

    async fn upsert_identity_role(
        &self,
        req: UpsertRoleRequest,
        dry_run: bool,
    ) -> Result<Value, RemoteError> {
        self.check(&[Scope::RolesWrite])?;
        let name = normalize_role_token(&req.name);
        if dry_run {
            return Ok(json!({ "status": "would_upsert", "name": name, "is_staff": req.is_staff }));
        }
        let role = self
            .directory
            .upsert_role(RoleRecord {
                name,
                description: req.description.trim().to_string(),
                is_staff: req.is_staff,
                updated_by: Some(self.actor()),
            })
            .await
            .map_err(unavailable)?;
        Ok(json!({ "status": "upserted", "name": role.name, "is_staff": role.is_staff }))
    }

    async fn set_identity_tag(
        &self,
        req: SetIdentityTagRequest,
        dry_run: bool,
    ) -> Result<Value, RemoteError> {
        self.check(&[Scope::IdentityTagsWrite])?;
        let username = required_username(&req.username)?;
        let db_name = normalize_db_name(&req.db_name)?;
        let role_tag = normalize_role_token(&req.role_tag);
        let status = if dry_run {
            "would_update"
        } else {
            self.directory
                .set_identity_tag(&db_name, &username, &role_tag, &self.actor())
                .await
                .map_err(|e| match e {
                    DirectoryError::UserNotFound { .. } => RemoteError::invalid_request(e.to_string()),
                    DirectoryError::Backend(_) => unavailable(e),
                })?;
            "updated"
        };
        Ok(json!({
            "status": status,
            "username": username,
            "db_name": db_name,
            "role_tag": role_tag,
        }))
    }

    fn emit_event(&self, req: EmitEventRequest) -> Result<Value, RemoteError> {
        self.check(&[Scope::EventsEmit])?;
        let local = req.event.trim();
        PluginEvent::validate_local_name(local)
            .map_err(|e| RemoteError::invalid_request(e.to_string()))?;
        let event = PluginEvent::new(&self.plugin, local, req.payload);
        let name = event.name.clone();
        self.events
            .emit(event)
            .map_err(|e| RemoteError::new(codes::UNAVAILABLE, e.to_string()))?;
        debug!(plugin = %self.plugin, event = %name, "event emitted");
        Ok(json!({ "status": "emitted", "event": name }))
    }

    fn log(&self, req: LogRequest) -> Value {
        let message = req.message.trim();
        if message.is_empty() {
            return json!({ "status": "ignored" });
        }
        let plugin = self.plugin.as_str();
        match req.level.trim().to_ascii_lowercase().as_str() {
            "trace" => trace!(plugin, "{message}"),
            "debug" => debug!(plugin, "{message}"),
            "warn" | "warning" => warn!(plugin, "{message}"),
            "error" => error!(plugin, "{message}"),
            _ => info!(plugin, "{message}"),
        }
        json!({ "status": "logged" })
    }
}

#[async_trait]
impl HostCalls for ScopedContext {
    async fn host_call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        self.dispatch(method, params).await
    }
}

/// A [`ScopedContext`] with the write mode fixed for one call.
#[derive(Debug, Clone)]
pub struct PinnedHost {
    ctx: Arc<ScopedContext>,
    dry_run: bool,
}

impl PinnedHost {
    /// Whether writes through this handle are reported only.
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

#[async_trait]
impl HostCalls for PinnedHost {
    async fn host_call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        self.ctx.dispatch_as(method, params, self.dry_run).await
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RemoteError> {
    serde_json::from_value(params).map_err(|e| RemoteError::invalid_request(e.to_string()))
}

fn parse_or_default<T: DeserializeOwned + Default>(params: Value) -> Result<T, RemoteError> {
    if params.is_null() {
        return Ok(T::default());
    }
    parse(params)
}

fn required_username(raw: &str) -> Result<String, RemoteError> {
    let username = raw.trim();
    if username.is_empty() {
        return Err(RemoteError::invalid_request("username is required"));
    }
    Ok(username.to_string())
}

fn unavailable(e: DirectoryError) -> RemoteError {
    RemoteError::new(codes::UNAVAILABLE, e.to_string())
}
