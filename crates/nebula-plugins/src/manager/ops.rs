//! Host-facing operations.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use nebula_core::protocol::methods;
use nebula_core::{PluginName, Scope, ScopeSet};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{Inner, PluginManager};
use crate::descriptor::PluginDescriptor;
use crate::error::{PluginError, PluginResult};
use crate::monitor::observation_for;
use crate::record::{PluginStatus, RuntimeRecord};
use crate::slot::WorkerSlot;
use crate::state::RecordOp;

/// Lines returned by [`PluginManager::logs`] when no tail is given.
pub const DEFAULT_LOG_TAIL: usize = 200;
/// Upper bound for the `tail` of [`PluginManager::logs`].
pub const MAX_LOG_TAIL: usize = 5000;

/// Manual lifecycle override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginAction {
    /// Reset counters and activate a fresh worker.
    Start,
    /// Terminate gracefully and leave the plugin stopped.
    Stop,
    /// Same as start, for a plugin that is already running.
    Restart,
}

impl PluginAction {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for PluginAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginAction {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            other => Err(PluginError::InvalidRequest(format!(
                "unknown action '{other}', expected start, stop or restart"
            ))),
        }
    }
}

/// One row of [`PluginManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    /// Plugin key.
    pub name: String,
    /// `process` or `in_process`.
    pub source: &'static str,
    /// Plugin version.
    pub version: String,
    /// Worker API version.
    pub api_version: String,
    /// Manifest description.
    pub description: String,
    /// Declared scopes.
    pub scopes: Vec<String>,
    /// Lifecycle state.
    pub status: PluginStatus,
    /// Last status message.
    pub message: String,
    /// Load-time or runtime warning.
    pub warning: Option<String>,
    /// Last error.
    pub error: Option<String>,
    /// Calls or probes that timed out in a row.
    pub consecutive_timeouts: u32,
    /// Failed probes in a row.
    pub consecutive_health_failures: u32,
    /// Crashes since the last operator reset.
    pub consecutive_crashes: u32,
    /// Automatic restarts since the last operator reset.
    pub restart_count: u32,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// When the current worker came up.
    pub initialized_at: Option<DateTime<Utc>>,
}

impl PluginInfo {
    fn new(descriptor: &PluginDescriptor, record: RuntimeRecord) -> Self {
        Self {
            name: descriptor.name.to_string(),
            source: descriptor.source(),
            version: descriptor.version.to_string(),
            api_version: descriptor.api_version.clone(),
            description: descriptor.description.clone(),
            scopes: descriptor.scopes.to_strings(),
            status: record.status,
            message: record.message,
            warning: record.warning,
            error: record.error,
            consecutive_timeouts: record.consecutive_timeouts,
            consecutive_health_failures: record.consecutive_health_failures,
            consecutive_crashes: record.consecutive_crashes,
            restart_count: record.restart_count,
            updated_at: record.updated_at,
            initialized_at: record.initialized_at,
        }
    }
}

/// Process and resource usage of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStats {
    /// Plugin key.
    pub name: String,
    /// Lifecycle state.
    pub status: PluginStatus,
    /// `process` or `in_process`.
    pub source: &'static str,
    /// Current worker.
    pub worker_id: Option<u64>,
    /// OS process id, for process workers.
    pub pid: Option<u32>,
    /// Whether the worker is up.
    pub alive: bool,
    /// Resident set size from `/proc/<pid>/status`.
    pub memory_rss_kb: Option<u64>,
    /// Virtual memory size from `/proc/<pid>/status`.
    pub memory_virtual_kb: Option<u64>,
    /// Cgroup directory, when confined.
    pub cgroup_path: Option<PathBuf>,
    /// `memory.current` of the cgroup.
    pub cgroup_memory_current: Option<u64>,
    /// `memory.events` of the cgroup.
    pub cgroup_memory_events: BTreeMap<String, u64>,
    /// Whether the kernel OOM-killed this worker.
    pub oom_killed: bool,
    /// Worker log file.
    pub log_path: PathBuf,
    /// Seconds since the worker started.
    pub uptime_secs: Option<i64>,
    /// Automatic restarts since the last operator reset.
    pub restart_count: u32,
}

/// Options for [`PluginManager::invoke`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    /// Report intended writes instead of performing them.
    pub dry_run: bool,
    /// Item limit handed to the plugin; clamped.
    pub limit: Option<u64>,
    /// Call timeout; capped at the configured maximum.
    pub timeout: Option<Duration>,
}

/// Scopes the host checks before forwarding a known method.
fn required_scopes(method: &str, dry_run: bool) -> &'static [Scope] {
    match method {
        methods::SYNC_USERS if dry_run => &[Scope::UsersRead],
        methods::SYNC_USERS => &[Scope::UsersWrite],
        _ => &[],
    }
}

/// `(VmRSS, VmSize)` in KiB.
fn proc_memory(pid: u32) -> (Option<u64>, Option<u64>) {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return (None, None);
    };
    let field = |key: &str| {
        status.lines().find_map(|line| {
            line.strip_prefix(key)?
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .ok()
        })
    };
    (field("VmRSS:"), field("VmSize:"))
}

async fn tail_lines(path: &Path, tail: usize) -> PluginResult<Vec<String>> {
    let content = match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PluginError::io(path, e)),
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(tail);
    Ok(lines
        .get(start..)
        .unwrap_or_default()
        .iter()
        .map(|l| (*l).to_string())
        .collect())
}

impl PluginManager {
    /// Every loaded plugin, sorted by source then name.
    #[must_use]
    pub fn list(&self) -> Vec<PluginInfo> {
        let arena = self.inner.arena_snapshot();
        let mut rows: Vec<PluginInfo> = arena
            .iter()
            .filter_map(|(name, entry)| {
                let record = self.inner.state.snapshot(name.as_str())?;
                Some(PluginInfo::new(&entry.descriptor, record))
            })
            .collect();
        rows.sort_by(|a, b| a.source.cmp(b.source).then_with(|| a.name.cmp(&b.name)));
        rows
    }

    /// One row of [`list`](Self::list).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for unknown plugins.
    pub fn info(&self, name: &str) -> PluginResult<PluginInfo> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let record = self
            .record(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        Ok(PluginInfo::new(&descriptor, record))
    }

    /// Probe a plugin now, outside the periodic loop, and return what it
    /// reports.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotCallable`] if no worker runs, or the probe's
    /// own failure.
    pub async fn health(&self, name: &str) -> PluginResult<Value> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let (descriptor, slot) = inner.lookup(name)?;

        let Some(current) = slot.current() else {
            return Err(inner.not_callable(&descriptor.name));
        };
        let worker_id = current.worker.id();
        let result = current
            .worker
            .call(methods::HEALTH, Value::Null, inner.config.default_timeout)
            .await;

        if let Some(observation) = observation_for(&result, true, methods::HEALTH) {
            inner
                .state
                .observe(&descriptor.name, worker_id, observation)
                .await;
        }
        result
    }

    /// Start, stop or restart a plugin by hand.
    ///
    /// Start and restart are operator actions: every counter and budget is
    /// reset before a fresh worker is activated. Activation failures are
    /// recorded, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for unknown plugins.
    pub async fn action(&self, name: &str, action: PluginAction) -> PluginResult<PluginInfo> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let (descriptor, slot) = inner.lookup(name)?;
        info!(plugin = %descriptor.name, action = %action, "operator action");

        match action {
            PluginAction::Stop => {
                inner.tear_down(&slot, true).await;
                inner.state.apply(&descriptor.name, RecordOp::Stopped).await;
            },
            PluginAction::Start | PluginAction::Restart => {
                inner
                    .state
                    .apply(&descriptor.name, RecordOp::OperatorReset)
                    .await;
                if let Err(e) = inner.bring_up(&descriptor, &slot).await {
                    debug!(plugin = %descriptor.name, error = %e, "operator start failed");
                }
            },
        }
        self.info(name)
    }

    /// Process, memory and cgroup figures for a plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for unknown plugins.
    pub async fn stats(&self, name: &str) -> PluginResult<PluginStats> {
        let inner = &self.inner;
        let (descriptor, slot) = inner.lookup(name)?;
        let record = inner
            .state
            .snapshot(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let mut stats = PluginStats {
            name: descriptor.name.to_string(),
            status: record.status,
            source: descriptor.source(),
            worker_id: None,
            pid: None,
            alive: false,
            memory_rss_kb: None,
            memory_virtual_kb: None,
            cgroup_path: None,
            cgroup_memory_current: None,
            cgroup_memory_events: BTreeMap::new(),
            oom_killed: false,
            log_path: inner.supervisor.log_path(&descriptor.name),
            uptime_secs: None,
            restart_count: record.restart_count,
        };

        if let Some(current) = slot.current() {
            let worker = &current.worker;
            stats.worker_id = Some(worker.id());
            stats.pid = worker.pid();
            stats.alive = worker.is_alive();
            stats.oom_killed = worker.oom_killed();
            stats.uptime_secs = Some(
                Utc::now()
                    .signed_duration_since(worker.started_at())
                    .num_seconds()
                    .max(0),
            );
            if let Some(path) = worker.log_path() {
                stats.log_path = path.to_path_buf();
            }
            if let Some(pid) = stats.pid {
                (stats.memory_rss_kb, stats.memory_virtual_kb) = proc_memory(pid);
            }
            if let Some(cgroup) = worker.cgroup() {
                stats.cgroup_path = Some(cgroup.path().to_path_buf());
                stats.cgroup_memory_current = cgroup.memory_current();
                stats.cgroup_memory_events = cgroup.memory_events();
            }
        }
        Ok(stats)
    }

    /// The last `tail` lines of a plugin's log, 200 by default.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for unknown plugins and
    /// [`PluginError::Io`] if the log exists but cannot be read.
    pub async fn logs(&self, name: &str, tail: Option<usize>) -> PluginResult<Vec<String>> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let tail = tail.unwrap_or(DEFAULT_LOG_TAIL).clamp(1, MAX_LOG_TAIL);
        let path = self.inner.supervisor.log_path(&descriptor.name);
        tail_lines(&path, tail).await
    }

    /// Forward a call to a plugin under the host's scope rules.
    ///
    /// `dry_run` and the clamped `limit` are injected into the payload. While
    /// a dry-run invoke is in flight every host write from the plugin is
    /// answered with a report of what it would have done; a timed-out
    /// dry-run call stays in that mode until the worker answers it.
    /// No lock is held while the worker runs, so a restart or stop cancels
    /// the call and it fails with [`PluginError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ScopeDenied`] when the effective scopes do not
    /// cover the method, [`PluginError::NotCallable`] while the plugin is
    /// crashed, disabled or stopped, [`PluginError::InvalidRequest`] for a
    /// payload that is not an object, or the call's own failure.
    pub async fn invoke(
        &self,
        name: &str,
        method: &str,
        payload: Value,
        options: InvokeOptions,
    ) -> PluginResult<Value> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let (descriptor, slot) = inner.lookup(name)?;
        let plugin = &descriptor.name;

        let mut params = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(PluginError::InvalidRequest(format!(
                    "payload must be a JSON object, got {other}"
                )));
            },
        };
        let limit = inner.config.invoke_limit(options.limit);
        let timeout = inner.config.call_timeout(options.timeout);
        params.insert("dry_run".to_string(), Value::Bool(options.dry_run));
        params.insert("limit".to_string(), Value::from(limit));

        let _serial = slot.invoke_gate.lock().await;
        let Some(current) = slot.current() else {
            return Err(inner.not_callable(plugin));
        };
        if let Some(record) = inner.state.snapshot(name)
            && !record.status.is_callable()
        {
            return Err(PluginError::NotCallable {
                plugin: plugin.clone(),
                status: record.status.to_string(),
            });
        }

        for &scope in required_scopes(method, options.dry_run) {
            if !current.bridge.allows(scope) {
                warn!(plugin = %plugin, method, scope = %scope, "invoke denied");
                return Err(PluginError::ScopeDenied {
                    plugin: plugin.clone(),
                    message: format!("{method} requires {scope}"),
                });
            }
        }

        debug!(plugin = %plugin, method, dry_run = options.dry_run, limit, "invoke");
        let worker_id = current.worker.id();
        let params = Value::Object(params);
        let result = if options.dry_run {
            let hold = current.bridge.enter_dry_run();
            current
                .worker
                .call_dry_run(method, params, timeout, hold)
                .await
        } else {
            current.worker.call(method, params, timeout).await
        };

        if let Some(observation) = observation_for(&result, false, method) {
            inner.state.observe(plugin, worker_id, observation).await;
        }
        result
    }

    /// Remove a scope from the host allow-list. Takes effect on the next
    /// call of every running worker. Returns whether it was granted before.
    pub fn revoke_scope(&self, scope: Scope) -> bool {
        let revoked = self.inner.allow_list.revoke(scope);
        if revoked {
            warn!(scope = %scope, "scope revoked");
        }
        revoked
    }

    /// Return a scope to the host allow-list. Running workers keep the
    /// effective set they were activated with.
    pub fn grant_scope(&self, scope: Scope) -> bool {
        let granted = self.inner.allow_list.grant(scope);
        if granted {
            info!(scope = %scope, "scope granted");
        }
        granted
    }

    /// Current host allow-list.
    #[must_use]
    pub fn allowed_scopes(&self) -> ScopeSet {
        self.inner.allow_list.snapshot()
    }

    /// Stop the monitors and the state actor, then terminate every worker
    /// gracefully. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(plugins = inner.slots.len(), "plugin manager shutting down");

        let slots: Vec<Arc<WorkerSlot>> = inner
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for slot in &slots {
            slot.stop_monitor();
        }
        inner.shutdown.cancel();

        join_all(slots.iter().map(|slot| inner.tear_down(slot, true))).await;

        let tasks = std::mem::take(
            &mut *inner
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        info!("plugin manager stopped");
    }
}

impl Inner {
    fn not_callable(&self, plugin: &PluginName) -> PluginError {
        let status = self
            .state
            .snapshot(plugin.as_str())
            .map_or(PluginStatus::Stopped, |r| r.status);
        PluginError::NotCallable {
            plugin: plugin.clone(),
            status: status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use nebula_core::{HostCalls, RemoteError, WorkerPlugin};
    use nebula_events::EventBus;
    use serde_json::json;

    use super::*;
    use crate::bridge::InMemoryDirectory;
    use crate::manager::{HostServices, ManagerConfig};
    use crate::supervisor::InProcessRegistry;

    struct Syncer;

    #[async_trait]
    impl WorkerPlugin for Syncer {
        async fn health(&self) -> Result<Value, RemoteError> {
            Ok(json!({ "status": "ok", "plugin": "syncer" }))
        }

        async fn handle(
            &self,
            method: &str,
            params: Value,
            host: &dyn HostCalls,
        ) -> Result<Value, RemoteError> {
            match method {
                "sync_users" => {
                    let reply = host
                        .host_call(
                            methods::HOST_SYNC_USER,
                            json!({ "username": "demo.alice", "role_tag": "Developer" }),
                        )
                        .await?;
                    Ok(json!({
                        "dry_run": params["dry_run"],
                        "limit": params["limit"],
                        "item": reply,
                    }))
                },
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                },
                "boom" => panic!("syncer lost its connection pool"),
                other => Err(RemoteError::method_not_found(other)),
            }
        }
    }

    fn write_manifest(scan: &Path, name: &str, scopes: &[&str]) {
        let dir = scan.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let scopes = scopes
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<_>>()
            .join(", ");
        std::fs::write(
            dir.join("plugin.toml"),
            format!(
                "version = \"1.0.0\"\ndescription = \"test plugin\"\nscopes = [{scopes}]\n\n[entry]\ntype = \"in_process\"\nfactory = \"syncer\"\n"
            ),
        )
        .unwrap();
    }

    async fn start(root: &Path) -> (PluginManager, Arc<InMemoryDirectory>) {
        start_with(root, |_| {}).await
    }

    async fn start_with(
        root: &Path,
        tune: impl FnOnce(&mut ManagerConfig),
    ) -> (PluginManager, Arc<InMemoryDirectory>) {
        let mut config = ManagerConfig::new(root.join("plugins"));
        config.log_dir = root.join("logs");
        config.health_interval = Duration::from_secs(3600);
        config.default_timeout = Duration::from_secs(1);
        config.shutdown_grace = Duration::from_millis(200);
        tune(&mut config);

        let mut registry = InProcessRegistry::new();
        registry.register("syncer", Arc::new(|| Arc::new(Syncer) as Arc<dyn WorkerPlugin>));
        let directory = Arc::new(InMemoryDirectory::new());
        let services = HostServices {
            directory: directory.clone(),
            events: Arc::new(EventBus::new()),
            registry,
        };
        let manager = PluginManager::start(config, services).await.unwrap();
        (manager, directory)
    }

    fn full_scopes() -> Vec<&'static str> {
        vec!["users.read", "users.write", "identity_tags.write"]
    }

    async fn wait_for_status(manager: &PluginManager, name: &str, status: PluginStatus) {
        for _ in 0..100 {
            if manager.record(name).is_some_and(|r| r.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{name} never reached {status}");
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("plugins");
        write_manifest(&scan, "zeta", &full_scopes());
        write_manifest(&scan, "alpha", &["users.read"]);
        let (manager, _) = start(dir.path()).await;

        let rows = manager.list();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        let alpha = &rows[0];
        assert_eq!(alpha.source, "in_process");
        assert_eq!(alpha.version, "1.0.0");
        assert_eq!(alpha.description, "test plugin");
        assert!(alpha.status.is_callable());
        assert!(alpha.warning.as_deref().unwrap().starts_with("DEV ONLY"));
        assert!(alpha.initialized_at.is_some());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_returns_plugin_payload() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, _) = start(dir.path()).await;

        let reply = manager.health("syncer").await.unwrap();
        assert_eq!(reply["plugin"], "syncer");
        wait_for_status(&manager, "syncer", PluginStatus::Healthy).await;

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dry_run_does_not_touch_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, directory) = start(dir.path()).await;

        let reply = manager
            .invoke("syncer", "sync_users", Value::Null, InvokeOptions {
                dry_run: true,
                limit: Some(5),
                timeout: None,
            })
            .await
            .unwrap();
        assert_eq!(reply["dry_run"], true);
        assert_eq!(reply["limit"], 5);
        assert_eq!(reply["item"]["action"], "would_sync");
        assert_eq!(reply["item"]["role_tag"], "developer");
        assert!(directory.users("system.db").is_empty());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invoke_writes_through_the_bridge() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, directory) = start(dir.path()).await;

        let reply = manager
            .invoke("syncer", "sync_users", json!({}), InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(reply["dry_run"], false);
        assert_eq!(reply["limit"], 10_000);
        assert_eq!(reply["item"]["action"], "created");

        let users = directory.users("system.db");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, "demo.alice");
        assert_eq!(users[0].updated_by.as_deref(), Some("plugin:syncer"));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_revoked_scope_denies_invoke() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, directory) = start(dir.path()).await;

        assert!(manager.revoke_scope(Scope::UsersWrite));
        let err = manager
            .invoke("syncer", "sync_users", Value::Null, InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "scope_denied");
        assert!(directory.users("system.db").is_empty());

        assert!(manager.grant_scope(Scope::UsersWrite));
        assert!(manager.allowed_scopes().contains(Scope::UsersWrite));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_undeclared_scope_is_denied_by_the_bridge() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "reader", &["users.read"]);
        let (manager, _) = start(dir.path()).await;

        // The host pre-check passes for a dry run; the bridge refuses the write.
        let err = manager
            .invoke("reader", "sync_users", Value::Null, InvokeOptions {
                dry_run: true,
                ..InvokeOptions::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "scope_denied");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invoke_rejects_non_object_payload() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, _) = start(dir.path()).await;

        let err = manager
            .invoke("syncer", "sync_users", json!([1, 2]), InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        let err = manager
            .invoke("ghost", "sync_users", Value::Null, InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_degrades_but_keeps_worker() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, _) = start(dir.path()).await;

        let err = manager
            .invoke("syncer", "slow", Value::Null, InvokeOptions {
                timeout: Some(Duration::from_millis(100)),
                ..InvokeOptions::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
        wait_for_status(&manager, "syncer", PluginStatus::Degraded).await;
        assert_eq!(manager.record("syncer").unwrap().consecutive_timeouts, 1);

        manager
            .invoke("syncer", "sync_users", Value::Null, InvokeOptions {
                dry_run: true,
                ..InvokeOptions::default()
            })
            .await
            .unwrap();
        for _ in 0..100 {
            if manager.record("syncer").unwrap().consecutive_timeouts == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.record("syncer").unwrap().consecutive_timeouts, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_then_start() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, _) = start(dir.path()).await;

        let info = manager.action("syncer", PluginAction::Stop).await.unwrap();
        assert_eq!(info.status, PluginStatus::Stopped);
        let err = manager
            .invoke("syncer", "sync_users", Value::Null, InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_callable");
        let stats = manager.stats("syncer").await.unwrap();
        assert!(!stats.alive);
        assert!(stats.worker_id.is_none());

        let info = manager.action("syncer", PluginAction::Start).await.unwrap();
        assert!(info.status.is_callable());
        assert_eq!(info.restart_count, 0);
        let stats = manager.stats("syncer").await.unwrap();
        assert!(stats.alive);
        assert!(stats.pid.is_none());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_cancels_in_flight_invoke() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, _) = start(dir.path()).await;
        let before = manager.stats("syncer").await.unwrap().worker_id.unwrap();

        let invoke = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .invoke("syncer", "slow", Value::Null, InvokeOptions {
                        timeout: Some(Duration::from_secs(10)),
                        ..InvokeOptions::default()
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let restart = tokio::spawn({
            let manager = manager.clone();
            async move { manager.action("syncer", PluginAction::Restart).await }
        });
        let stats = tokio::time::timeout(Duration::from_secs(1), manager.stats("syncer"))
            .await
            .expect("stats waited on the in-flight call")
            .unwrap();
        assert_eq!(stats.name, "syncer");

        let err = tokio::time::timeout(Duration::from_secs(2), invoke)
            .await
            .expect("invoke outlived the restart")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code(), "cancelled");

        let info = tokio::time::timeout(Duration::from_secs(2), restart)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(info.status.is_callable());
        assert_eq!(info.consecutive_crashes, 0);
        let after = manager.stats("syncer").await.unwrap().worker_id.unwrap();
        assert_ne!(after, before);
        assert_eq!(manager.record("syncer").unwrap().consecutive_crashes, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_budget_disables_until_operator_start() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, _) = start_with(dir.path(), |config| {
            config.health_interval = Duration::from_millis(50);
        })
        .await;

        for restarts in 1..=2 {
            let err = manager
                .invoke("syncer", "boom", Value::Null, InvokeOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "transport_error");
            for _ in 0..100 {
                let record = manager.record("syncer").unwrap();
                let installed = manager.stats("syncer").await.unwrap().worker_id;
                if record.restart_count == restarts
                    && record.worker_id.is_some()
                    && record.worker_id == installed
                    && record.status.is_callable()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let record = manager.record("syncer").unwrap();
            assert_eq!(record.restart_count, restarts);
            assert!(record.worker_id.is_some());
        }

        manager
            .invoke("syncer", "boom", Value::Null, InvokeOptions::default())
            .await
            .unwrap_err();
        wait_for_status(&manager, "syncer", PluginStatus::Disabled).await;

        // Health ticks leave a disabled plugin alone.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let record = manager.record("syncer").unwrap();
        assert_eq!(record.status, PluginStatus::Disabled);
        assert_eq!(record.restart_count, 2);
        assert_eq!(record.consecutive_crashes, 3);
        assert!(record.worker_id.is_none());
        assert!(manager.stats("syncer").await.unwrap().worker_id.is_none());
        let err = manager
            .invoke("syncer", "sync_users", Value::Null, InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_callable");

        let info = manager.action("syncer", PluginAction::Start).await.unwrap();
        assert!(info.status.is_callable());
        assert_eq!(info.restart_count, 0);
        assert_eq!(info.consecutive_crashes, 0);
        let reply = manager
            .invoke("syncer", "sync_users", Value::Null, InvokeOptions {
                dry_run: true,
                ..InvokeOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(reply["item"]["action"], "would_sync");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_logs_tail_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, _) = start(dir.path()).await;

        assert!(manager.logs("syncer", None).await.unwrap().is_empty());

        let lines: Vec<String> = (0..300).map(|i| format!("line {i}")).collect();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/syncer.log"), lines.join("\n")).unwrap();

        let tail = manager.logs("syncer", None).await.unwrap();
        assert_eq!(tail.len(), DEFAULT_LOG_TAIL);
        assert_eq!(tail.last().map(String::as_str), Some("line 299"));
        assert_eq!(manager.logs("syncer", Some(0)).await.unwrap(), vec!["line 299"]);
        assert_eq!(manager.logs("syncer", Some(10_000)).await.unwrap().len(), 300);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "syncer", &full_scopes());
        let (manager, _) = start(dir.path()).await;

        manager.shutdown().await;
        manager.shutdown().await;
        assert!(!manager.is_running());
        let err = manager
            .invoke("syncer", "sync_users", Value::Null, InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_running");
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("Restart".parse::<PluginAction>().unwrap(), PluginAction::Restart);
        assert!("reload".parse::<PluginAction>().is_err());
    }

    #[test]
    fn test_sync_users_scope_depends_on_dry_run() {
        assert_eq!(required_scopes("sync_users", true), &[Scope::UsersRead]);
        assert_eq!(required_scopes("sync_users", false), &[Scope::UsersWrite]);
        assert!(required_scopes("custom", false).is_empty());
    }
}
