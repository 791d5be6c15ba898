//! Legacy in-process workers. Development only.
//!
//! The plugin runs on the host runtime. Every call is its own task so a
//! timeout can abort it and a panic is contained; a panic counts as a crash.
//! Terminating the worker aborts the tasks still running. A dry-run call's
//! task sees the bridge pinned to dry-run for its whole life.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nebula_core::protocol::{RemoteError, methods};
use nebula_core::{HostCalls, PluginName, WorkerPlugin};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ExitListener, Worker, WorkerExit, next_worker_id};
use crate::bridge::{DryRunGuard, ScopedContext};
use crate::cgroup::CgroupHandle;
use crate::error::{PluginError, PluginResult};
use crate::policy::CrashCause;

/// Builds a fresh plugin instance per activation.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn WorkerPlugin> + Send + Sync>;

/// Factories compiled into the host, by name.
#[derive(Clone, Default)]
pub struct InProcessRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl fmt::Debug for InProcessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl InProcessRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Look up a factory.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<PluginFactory> {
        self.factories.get(name).cloned()
    }

    /// Registered names.
    #[must_use]
    pub fn names(&self) -> std::collections::BTreeSet<String> {
        self.factories.keys().cloned().collect()
    }
}

/// A plugin instance running on the host runtime.
pub struct InProcessWorker {
    id: u64,
    plugin: PluginName,
    instance: Arc<dyn WorkerPlugin>,
    host: Arc<ScopedContext>,
    listener: Arc<dyn ExitListener>,
    alive: AtomicBool,
    started_at: DateTime<Utc>,
    /// Cancelled when termination starts; in-flight calls end with it.
    halted: CancellationToken,
    exited: CancellationToken,
}

impl fmt::Debug for InProcessWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessWorker")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl InProcessWorker {
    /// Instantiate and initialise a plugin.
    ///
    /// # Errors
    ///
    /// Returns the plugin's initialisation error, or
    /// [`PluginError::Timeout`] if it takes longer than `init_timeout`.
    pub async fn start(
        plugin: PluginName,
        factory: &PluginFactory,
        host: Arc<ScopedContext>,
        listener: Arc<dyn ExitListener>,
        init_timeout: Duration,
    ) -> PluginResult<Arc<Self>> {
        let instance = factory();
        match tokio::time::timeout(init_timeout, instance.initialize(host.as_ref())).await {
            Ok(Ok(())) => {},
            Ok(Err(remote)) => return Err(PluginError::from_remote(&plugin, remote)),
            Err(_elapsed) => {
                return Err(PluginError::Timeout {
                    plugin,
                    method: "initialize".to_string(),
                    timeout: init_timeout,
                });
            },
        }

        let id = next_worker_id();
        warn!(plugin = %plugin, worker_id = id, "running in-process plugin (development only)");
        Ok(Arc::new(Self {
            id,
            plugin,
            instance,
            host,
            listener,
            alive: AtomicBool::new(true),
            started_at: Utc::now(),
            halted: CancellationToken::new(),
            exited: CancellationToken::new(),
        }))
    }

    async fn crashed(&self, message: String) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        self.exited.cancel();
        warn!(plugin = %self.plugin, worker_id = self.id, message = %message, "in-process plugin crashed");
        self.listener
            .worker_exited(WorkerExit {
                plugin: self.plugin.clone(),
                worker_id: self.id,
                cause: CrashCause::Transport(message),
            })
            .await;
    }

    async fn run(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        host: Arc<dyn HostCalls>,
    ) -> PluginResult<Value> {
        if self.halted.is_cancelled() {
            return Err(PluginError::cancelled(&self.plugin, method));
        }
        if !self.is_alive() {
            return Err(PluginError::transport(&self.plugin, "worker is not running"));
        }

        let instance = Arc::clone(&self.instance);
        let owned_method = method.to_string();
        let task = tokio::spawn(async move {
            match owned_method.as_str() {
                methods::HEALTH => instance.health().await,
                methods::SHUTDOWN => {
                    instance.shutdown().await;
                    Ok::<_, RemoteError>(json!({ "status": "stopping" }))
                },
                other => instance.handle(other, params, host.as_ref()).await,
            }
        });
        let abort = task.abort_handle();

        let finished = tokio::select! {
            finished = tokio::time::timeout(timeout, task) => finished,
            () = self.halted.cancelled() => {
                abort.abort();
                debug!(plugin = %self.plugin, method, "in-process call cancelled by teardown");
                return Err(PluginError::cancelled(&self.plugin, method));
            },
        };

        match finished {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(remote))) => Err(PluginError::from_remote(&self.plugin, remote)),
            Ok(Err(join)) if join.is_panic() => {
                self.crashed(format!("{method} panicked")).await;
                Err(PluginError::transport(&self.plugin, format!("{method} panicked")))
            },
            Ok(Err(_cancelled)) => Err(PluginError::transport(&self.plugin, "call aborted")),
            Err(_elapsed) => {
                abort.abort();
                debug!(plugin = %self.plugin, method, ?timeout, "in-process call timed out");
                Err(PluginError::Timeout {
                    plugin: self.plugin.clone(),
                    method: method.to_string(),
                    timeout,
                })
            },
        }
    }
}

#[async_trait]
impl Worker for InProcessWorker {
    fn id(&self) -> u64 {
        self.id
    }

    fn plugin(&self) -> &PluginName {
        &self.plugin
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> PluginResult<Value> {
        let host = Arc::clone(&self.host) as Arc<dyn HostCalls>;
        self.run(method, params, timeout, host).await
    }

    async fn call_dry_run(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        hold: DryRunGuard,
    ) -> PluginResult<Value> {
        let host = Arc::new(self.host.pinned(true)) as Arc<dyn HostCalls>;
        let outcome = self.run(method, params, timeout, host).await;
        drop(hold);
        outcome
    }

    async fn terminate(&self, graceful: bool, grace: Duration) {
        self.halted.cancel();
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        if graceful && tokio::time::timeout(grace, self.instance.shutdown()).await.is_err() {
            warn!(plugin = %self.plugin, "in-process shutdown exceeded grace period");
        }
        self.exited.cancel();
    }

    async fn exited(&self) {
        self.exited.cancelled().await;
    }

    fn cgroup(&self) -> Option<&CgroupHandle> {
        None
    }

    fn log_path(&self) -> Option<&Path> {
        None
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn oom_killed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{AllowList, InMemoryDirectory};
    use nebula_core::ScopeSet;
    use nebula_events::EventBus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Exits(Mutex<Vec<WorkerExit>>);

    #[async_trait]
    impl ExitListener for Exits {
        async fn worker_exited(&self, exit: WorkerExit) {
            self.0.lock().unwrap().push(exit);
        }
    }

    struct Moody;

    #[async_trait]
    impl WorkerPlugin for Moody {
        async fn health(&self) -> Result<Value, RemoteError> {
            Ok(json!({ "status": "ok" }))
        }

        async fn handle(
            &self,
            method: &str,
            _params: Value,
            host: &dyn HostCalls,
        ) -> Result<Value, RemoteError> {
            match method {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                },
                "panic" => panic!("boom"),
                "mode" => {
                    let synced = host
                        .host_call(methods::HOST_SYNC_USER, json!({ "username": "mallory" }))
                        .await?;
                    Ok(json!({ "users": synced["action"] }))
                },
                "emit" => {
                    host.host_call(methods::HOST_EMIT_EVENT, json!({ "event": "x" }))
                        .await
                },
                other => Err(RemoteError::method_not_found(other)),
            }
        }
    }

    async fn start(exits: Arc<Exits>) -> Arc<InProcessWorker> {
        let plugin = PluginName::new("moody").unwrap();
        let host = Arc::new(ScopedContext::new(
            plugin.clone(),
            &ScopeSet::parse(["users.write", "identity_tags.write"]).unwrap(),
            Arc::new(AllowList::new(ScopeSet::all())),
            Arc::new(InMemoryDirectory::new()),
            Arc::new(EventBus::new()),
        ));
        let factory: PluginFactory = Arc::new(|| Arc::new(Moody) as Arc<dyn WorkerPlugin>);
        InProcessWorker::start(plugin, &factory, host, exits, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_timeout_keeps_worker_alive() {
        let worker = start(Arc::new(Exits::default())).await;
        let err = worker
            .call("slow", Value::Null, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
        assert!(worker.is_alive());
        worker
            .call(methods::HEALTH, Value::Null, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_panic_is_a_crash() {
        let exits = Arc::new(Exits::default());
        let worker = start(Arc::clone(&exits)).await;
        let err = worker
            .call("panic", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transport_error");
        assert!(!worker.is_alive());
        assert_eq!(exits.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_host_calls_go_through_the_bridge() {
        let worker = start(Arc::new(Exits::default())).await;
        let err = worker
            .call("emit", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "scope_denied");
    }

    #[tokio::test]
    async fn test_terminate_is_quiet() {
        let exits = Arc::new(Exits::default());
        let worker = start(Arc::clone(&exits)).await;
        worker.terminate(true, Duration::from_millis(100)).await;
        assert!(!worker.is_alive());
        assert!(exits.0.lock().unwrap().is_empty());
        let err = worker
            .call(methods::HEALTH, Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "cancelled");
    }

    #[tokio::test]
    async fn test_terminate_cancels_in_flight_calls() {
        let exits = Arc::new(Exits::default());
        let worker = start(Arc::clone(&exits)).await;
        let call = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.call("slow", Value::Null, Duration::from_secs(10)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        worker.terminate(true, Duration::from_millis(100)).await;
        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code(), "cancelled");
        assert!(exits.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_call_sees_pinned_bridge() {
        let worker = start(Arc::new(Exits::default())).await;
        let hold = worker.host.enter_dry_run();
        let reply = worker
            .call_dry_run("mode", Value::Null, Duration::from_secs(1), hold)
            .await
            .unwrap();
        assert_eq!(reply["users"], "would_sync");
        assert!(!worker.host.is_dry_run());
    }
}
