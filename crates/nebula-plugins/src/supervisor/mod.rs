//! Worker lifecycle.
//!
//! The [`Supervisor`] turns a descriptor into a running [`Worker`]: it spawns
//! the process (or instantiates the in-process factory), attaches the cgroup,
//! wires the call channel to the plugin's [`ScopedContext`], and waits for a
//! first successful health probe. Exits the supervisor did not ask for are
//! reported to an [`ExitListener`] independently of any probe or call.

mod in_process;
mod process;
mod token;

pub use in_process::{InProcessRegistry, InProcessWorker, PluginFactory};
pub use process::ProcessWorker;
pub use token::WorkerToken;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nebula_core::PluginName;
use nebula_core::protocol::methods;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bridge::{DryRunGuard, ScopedContext};
use crate::cgroup::{CgroupHandle, CgroupManager};
use crate::descriptor::{PluginDescriptor, PluginKind};
use crate::error::{PluginError, PluginResult};
use crate::policy::CrashCause;

/// Delay between activation probes.
const HANDSHAKE_POLL: Duration = Duration::from_millis(200);

/// Upper bound for a single activation probe.
const HANDSHAKE_PROBE_CAP: Duration = Duration::from_secs(3);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique worker id.
pub(crate) fn next_worker_id() -> u64 {
    NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A running plugin instance, whatever its kind.
#[async_trait]
pub trait Worker: Send + Sync + fmt::Debug {
    /// Process-unique id; observations carry it so stale ones can be dropped.
    fn id(&self) -> u64;

    /// Plugin this worker runs.
    fn plugin(&self) -> &PluginName;

    /// OS process id, for process workers.
    fn pid(&self) -> Option<u32>;

    /// Whether the worker is still running.
    fn is_alive(&self) -> bool;

    /// Forward a call with an explicit timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Timeout`], [`PluginError::Transport`],
    /// [`PluginError::Cancelled`] if the worker is stopped mid-call, or the
    /// worker's own error reply.
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> PluginResult<Value>;

    /// Forward a call whose host writes are reported, not performed. `hold`
    /// keeps the bridge in dry-run mode for as long as the worker may still
    /// act on this call.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    async fn call_dry_run(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        hold: DryRunGuard,
    ) -> PluginResult<Value>;

    /// Stop the worker. Calls still in flight fail with
    /// [`PluginError::Cancelled`]. A graceful stop waits up to `grace`
    /// before killing.
    async fn terminate(&self, graceful: bool, grace: Duration);

    /// Resolves once the worker has gone away.
    async fn exited(&self);

    /// The worker's cgroup, if it has one.
    fn cgroup(&self) -> Option<&CgroupHandle>;

    /// File that receives the worker's stderr.
    fn log_path(&self) -> Option<&Path>;

    /// When the worker was spawned.
    fn started_at(&self) -> DateTime<Utc>;

    /// Whether the kernel OOM-killed the worker.
    fn oom_killed(&self) -> bool;
}

/// An exit nobody asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// Affected plugin.
    pub plugin: PluginName,
    /// The worker that went away.
    pub worker_id: u64,
    /// Why.
    pub cause: CrashCause,
}

/// Receives out-of-band crash signals.
#[async_trait]
pub trait ExitListener: Send + Sync {
    /// A worker exited without being terminated.
    async fn worker_exited(&self, exit: WorkerExit);
}

/// Settings shared by every activation.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Directory for `{name}.log`.
    pub log_dir: PathBuf,
    /// Budget for the activation handshake.
    pub init_timeout: Duration,
    /// Default call timeout; caps each handshake probe.
    pub default_timeout: Duration,
    /// Grace period for graceful termination.
    pub shutdown_grace: Duration,
    /// `RLIMIT_AS`, in MiB.
    pub memory_limit_mb: u64,
    /// `RLIMIT_CPU`, in seconds.
    pub cpu_time_limit_secs: u64,
    /// Passed to workers as `NEBULA_PLUGIN_LOG_LEVEL`.
    pub log_level: String,
}

/// Spawns and stops workers.
pub struct Supervisor {
    settings: SupervisorSettings,
    cgroups: Arc<CgroupManager>,
    registry: InProcessRegistry,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("settings", &self.settings)
            .field("cgroups", self.cgroups.status())
            .field("factories", &self.registry.names())
            .finish()
    }
}

impl Supervisor {
    /// Build a supervisor.
    #[must_use]
    pub fn new(
        settings: SupervisorSettings,
        cgroups: Arc<CgroupManager>,
        registry: InProcessRegistry,
    ) -> Self {
        Self {
            settings,
            cgroups,
            registry,
        }
    }

    /// Activation settings.
    #[must_use]
    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// The cgroup backend.
    #[must_use]
    pub fn cgroups(&self) -> &CgroupManager {
        &self.cgroups
    }

    /// Registered in-process factories.
    #[must_use]
    pub fn registry(&self) -> &InProcessRegistry {
        &self.registry
    }

    /// Where a plugin's stderr goes.
    #[must_use]
    pub fn log_path(&self, plugin: &PluginName) -> PathBuf {
        self.settings.log_dir.join(format!("{plugin}.log"))
    }

    /// Start a worker and wait for its first successful health probe.
    ///
    /// # Errors
    ///
    /// - [`PluginError::ResourceBackend`] if isolation is required and the
    ///   cgroup cannot be set up.
    /// - [`PluginError::Load`] for an unregistered in-process factory.
    /// - Spawn, transport or timeout errors from the handshake. The worker is
    ///   killed before returning.
    pub async fn activate(
        &self,
        descriptor: &PluginDescriptor,
        bridge: Arc<ScopedContext>,
        listener: Arc<dyn ExitListener>,
    ) -> PluginResult<Arc<dyn Worker>> {
        let worker: Arc<dyn Worker> = match &descriptor.kind {
            PluginKind::Process { .. } => {
                let log_path = self.log_path(&descriptor.name);
                process::ProcessWorker::spawn(process::Launch {
                    descriptor,
                    settings: &self.settings,
                    cgroups: &self.cgroups,
                    log_path,
                    bridge,
                    listener,
                })?
            },
            PluginKind::InProcess { factory } => {
                let make = self.registry.get(factory).ok_or_else(|| {
                    PluginError::load(
                        descriptor.name.as_str(),
                        format!("missing entry factory '{factory}'"),
                    )
                })?;
                InProcessWorker::start(
                    descriptor.name.clone(),
                    &make,
                    bridge,
                    listener,
                    self.settings.init_timeout,
                )
                .await?
            },
        };

        if let Err(e) = self.handshake(worker.as_ref()).await {
            warn!(
                plugin = %descriptor.name,
                worker_id = worker.id(),
                error = %e,
                "activation handshake failed"
            );
            worker.terminate(false, Duration::ZERO).await;
            return Err(e);
        }

        info!(
            plugin = %descriptor.name,
            worker_id = worker.id(),
            pid = ?worker.pid(),
            source = descriptor.source(),
            "plugin activated"
        );
        Ok(worker)
    }

    async fn handshake(&self, worker: &dyn Worker) -> PluginResult<()> {
        let probe_timeout = self.settings.default_timeout.min(HANDSHAKE_PROBE_CAP);
        let plugin = worker.plugin().clone();
        let mut last_error: Option<String> = None;

        let attempt = async {
            loop {
                if !worker.is_alive() {
                    return Err(PluginError::transport(
                        &plugin,
                        "worker exited during activation",
                    ));
                }
                match worker.call(methods::HEALTH, Value::Null, probe_timeout).await {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        debug!(plugin = %plugin, error = %e, "activation probe failed");
                        last_error = Some(e.to_string());
                    },
                }
                tokio::time::sleep(HANDSHAKE_POLL).await;
            }
        };

        let result = tokio::time::timeout(self.settings.init_timeout, attempt).await;
        match result {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                if let Some(last) = &last_error {
                    debug!(plugin = %plugin, last_error = %last, "activation timed out");
                }
                Err(PluginError::Timeout {
                    plugin,
                    method: methods::HEALTH.to_string(),
                    timeout: self.settings.init_timeout,
                })
            },
        }
    }

    /// Stop a worker.
    pub async fn terminate(&self, worker: &dyn Worker, graceful: bool) {
        let grace = if graceful {
            self.settings.shutdown_grace
        } else {
            Duration::ZERO
        };
        worker.terminate(graceful, grace).await;
        debug!(plugin = %worker.plugin(), worker_id = worker.id(), graceful, "worker terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{AllowList, InMemoryDirectory};
    use crate::cgroup::CgroupSettings;
    use async_trait::async_trait;
    use nebula_core::protocol::RemoteError;
    use nebula_core::{HostCalls, ScopeSet, WorkerPlugin};
    use nebula_events::EventBus;
    use serde_json::json;
    use std::sync::Mutex;

    pub(crate) fn settings(log_dir: &Path) -> SupervisorSettings {
        SupervisorSettings {
            log_dir: log_dir.to_path_buf(),
            init_timeout: Duration::from_secs(2),
            default_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(200),
            memory_limit_mb: 1024,
            cpu_time_limit_secs: 30,
            log_level: "info".into(),
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        exits: Mutex<Vec<WorkerExit>>,
    }

    #[async_trait]
    impl ExitListener for RecordingListener {
        async fn worker_exited(&self, exit: WorkerExit) {
            self.exits.lock().unwrap().push(exit);
        }
    }

    struct Echo;

    #[async_trait]
    impl WorkerPlugin for Echo {
        async fn health(&self) -> Result<Value, RemoteError> {
            Ok(json!({ "status": "ok" }))
        }

        async fn handle(
            &self,
            method: &str,
            params: Value,
            _host: &dyn HostCalls,
        ) -> Result<Value, RemoteError> {
            Ok(json!({ "method": method, "params": params }))
        }
    }

    fn descriptor(dir: &Path, kind: PluginKind) -> PluginDescriptor {
        PluginDescriptor {
            name: PluginName::new("echo").unwrap(),
            version: semver::Version::new(0, 1, 0),
            api_version: "v1".into(),
            description: String::new(),
            scopes: ScopeSet::new(),
            kind,
            dir: dir.to_path_buf(),
            warning: None,
        }
    }

    fn bridge() -> Arc<ScopedContext> {
        Arc::new(ScopedContext::new(
            PluginName::new("echo").unwrap(),
            &ScopeSet::new(),
            Arc::new(AllowList::new(ScopeSet::all())),
            Arc::new(InMemoryDirectory::new()),
            Arc::new(EventBus::new()),
        ))
    }

    fn supervisor(log_dir: &Path) -> Supervisor {
        let mut registry = InProcessRegistry::new();
        registry.register("echo", Arc::new(|| Arc::new(Echo) as Arc<dyn WorkerPlugin>));
        Supervisor::new(
            settings(log_dir),
            Arc::new(CgroupManager::initialize(CgroupSettings::disabled()).unwrap()),
            registry,
        )
    }

    #[tokio::test]
    async fn test_activate_in_process_worker() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let listener = Arc::new(RecordingListener::default());
        let desc = descriptor(dir.path(), PluginKind::InProcess {
            factory: "echo".into(),
        });

        let worker = sup.activate(&desc, bridge(), listener.clone()).await.unwrap();
        assert!(worker.is_alive());
        assert!(worker.pid().is_none());
        let reply = worker
            .call("sync_users", json!({ "n": 1 }), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply["method"], "sync_users");

        sup.terminate(worker.as_ref(), true).await;
        assert!(!worker.is_alive());
        assert!(listener.exits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_factory_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let desc = descriptor(dir.path(), PluginKind::InProcess {
            factory: "ghost".into(),
        });
        let err = sup
            .activate(&desc, bridge(), Arc::new(RecordingListener::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "load_error");
    }

    #[tokio::test]
    async fn test_process_that_never_answers_fails_activation() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let desc = descriptor(dir.path(), PluginKind::Process {
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "exit 3".into()],
            env: std::collections::BTreeMap::new(),
        });
        let err = sup
            .activate(&desc, bridge(), Arc::new(RecordingListener::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::Transport { .. } | PluginError::Timeout { .. }
        ));
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let a = next_worker_id();
        let b = next_worker_id();
        assert_ne!(a, b);
    }
}
