//! The plugin manager.
//!
//! [`PluginManager`] is an explicit value constructed once by the host. It
//! owns the descriptor arena, one worker slot per plugin, the state actor and
//! the per-plugin health monitors, and serves the host-facing operations.

mod config;
mod ops;
mod rescan;

pub use config::ManagerConfig;
pub use ops::{
    DEFAULT_LOG_TAIL, InvokeOptions, MAX_LOG_TAIL, PluginAction, PluginInfo, PluginStats,
};
pub use rescan::RescanReport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use dashmap::DashMap;
use nebula_core::PluginName;
use nebula_events::EventSink;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arena::DescriptorArena;
use crate::bridge::{AllowList, HostDirectory, ScopedContext};
use crate::cgroup::{CgroupManager, CgroupStatus};
use crate::descriptor::PluginDescriptor;
use crate::error::{PluginError, PluginResult};
use crate::loader::Rejection;
use crate::monitor::Monitor;
use crate::policy::{CrashCause, Directive, Observation};
use crate::record::RuntimeRecord;
use crate::slot::{Active, WorkerSlot};
use crate::state::{DirectiveFor, RecordOp, StateHandle};
use crate::supervisor::{ExitListener, InProcessRegistry, Supervisor};

/// What the host lends the manager.
#[derive(Clone)]
pub struct HostServices {
    /// Data facade guarded by the capability bridge.
    pub directory: Arc<dyn HostDirectory>,
    /// Destination for namespaced plugin events.
    pub events: Arc<dyn EventSink>,
    /// In-process factories.
    pub registry: InProcessRegistry,
}

/// Supervises every plugin found under the scan path.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("scan_path", &self.inner.config.scan_path)
            .field("plugins", &self.inner.slots.len())
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: ManagerConfig,
    supervisor: Supervisor,
    arena: RwLock<Arc<DescriptorArena>>,
    rejected: RwLock<Vec<Rejection>>,
    slots: DashMap<PluginName, Arc<WorkerSlot>>,
    state: StateHandle,
    allow_list: Arc<AllowList>,
    directory: Arc<dyn HostDirectory>,
    events: Arc<dyn EventSink>,
    rescan_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl PluginManager {
    /// Initialise the cgroup backend, start the state actor and run the
    /// first scan.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ResourceBackend`] if cgroups are enabled and
    /// required but unusable.
    pub async fn start(config: ManagerConfig, services: HostServices) -> PluginResult<Self> {
        let cgroups = Arc::new(CgroupManager::initialize(config.cgroup.clone())?);
        let supervisor = Supervisor::new(
            config.supervisor_settings(),
            cgroups,
            services.registry,
        );

        let shutdown = CancellationToken::new();
        let (state, directives, state_task) = StateHandle::spawn(
            config.policy,
            Arc::new(DashMap::new()),
            shutdown.child_token(),
        );

        let inner = Arc::new(Inner {
            allow_list: Arc::new(AllowList::new(config.allowed_scopes.clone())),
            config,
            supervisor,
            arena: RwLock::new(Arc::new(DescriptorArena::new())),
            rejected: RwLock::new(Vec::new()),
            slots: DashMap::new(),
            state,
            directory: services.directory,
            events: services.events,
            rescan_lock: tokio::sync::Mutex::new(()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });

        let directive_task = tokio::spawn(directive_loop(
            Arc::downgrade(&inner),
            directives,
            inner.shutdown.child_token(),
        ));
        inner.track(state_task);
        inner.track(directive_task);

        let manager = Self { inner };
        info!(
            scan_path = %manager.inner.config.scan_path.display(),
            enabled = manager.inner.config.enabled,
            cgroups = ?manager.inner.supervisor.cgroups().status(),
            "plugin manager started"
        );
        if manager.inner.config.enabled {
            let report = manager.rescan().await?;
            info!(
                loaded = report.added.len(),
                rejected = report.rejected.len(),
                "initial plugin scan complete"
            );
        }
        Ok(manager)
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Cgroup backend state.
    #[must_use]
    pub fn cgroup_status(&self) -> &CgroupStatus {
        self.inner.supervisor.cgroups().status()
    }

    /// Current descriptor of a plugin.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.inner.arena_snapshot().get(name).cloned()
    }

    /// Copy of a plugin's runtime record.
    #[must_use]
    pub fn record(&self, name: &str) -> Option<RuntimeRecord> {
        self.inner.state.snapshot(name)
    }

    /// Plugins the last scan refused.
    #[must_use]
    pub fn rejections(&self) -> Vec<Rejection> {
        self.inner
            .rejected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether [`shutdown`](Self::shutdown) has not run yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn ensure_running(&self) -> PluginResult<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PluginError::NotRunning)
        }
    }

    fn arena_snapshot(&self) -> Arc<DescriptorArena> {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*arena)
    }

    fn slot(&self, name: &str) -> Option<Arc<WorkerSlot>> {
        self.slots.get(name).map(|s| Arc::clone(s.value()))
    }

    fn slot_or_insert(&self, name: &PluginName) -> Arc<WorkerSlot> {
        Arc::clone(self.slots.entry(name.clone()).or_default().value())
    }

    /// Look up a plugin's descriptor and slot.
    fn lookup(&self, name: &str) -> PluginResult<(Arc<PluginDescriptor>, Arc<WorkerSlot>)> {
        let descriptor = self
            .arena_snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let slot = self
            .slot(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        Ok((descriptor, slot))
    }

    async fn spawn_worker(&self, descriptor: &PluginDescriptor) -> PluginResult<Active> {
        let bridge = Arc::new(ScopedContext::new(
            descriptor.name.clone(),
            &descriptor.scopes,
            Arc::clone(&self.allow_list),
            Arc::clone(&self.directory),
            Arc::clone(&self.events),
        ));
        let listener: Arc<dyn ExitListener> = Arc::new(self.state.clone());
        let worker = self
            .supervisor
            .activate(descriptor, Arc::clone(&bridge), listener)
            .await?;
        Ok(Active { worker, bridge })
    }

    /// Replace whatever runs in `slot` with a fresh worker and record the
    /// outcome. Failures are absorbed into the record.
    async fn bring_up(&self, descriptor: &PluginDescriptor, slot: &Arc<WorkerSlot>) -> PluginResult<()> {
        let name = &descriptor.name;
        let _lifecycle = slot.lifecycle.lock().await;
        if let Some(old) = slot.take() {
            self.supervisor.terminate(old.worker.as_ref(), true).await;
        }

        match self.spawn_worker(descriptor).await {
            Ok(next) => {
                let worker = Arc::clone(&next.worker);
                slot.install(next);
                self.state
                    .apply(name, RecordOp::Activated {
                        worker_id: worker.id(),
                    })
                    .await;
                self.report_if_dead(name, worker.as_ref()).await;
                self.ensure_monitor(name, slot);
                Ok(())
            },
            Err(e) => {
                warn!(plugin = %name, error = %e, "plugin activation failed");
                self.state
                    .apply(name, RecordOp::ActivationFailed {
                        error: e.to_string(),
                        backend_refused: matches!(e, PluginError::ResourceBackend(_)),
                    })
                    .await;
                self.ensure_monitor(name, slot);
                Err(e)
            },
        }
    }

    /// An exit between spawn and recording the worker id is reported as stale;
    /// catch it here instead.
    async fn report_if_dead(&self, name: &PluginName, worker: &dyn crate::supervisor::Worker) {
        if !worker.is_alive() {
            self.state
                .observe(name, worker.id(), Observation::Crashed {
                    cause: CrashCause::Transport("worker exited during activation".to_string()),
                })
                .await;
        }
    }

    /// Stop and forget a worker.
    async fn tear_down(&self, slot: &WorkerSlot, graceful: bool) {
        let _lifecycle = slot.lifecycle.lock().await;
        if let Some(old) = slot.take() {
            self.supervisor
                .terminate(old.worker.as_ref(), graceful)
                .await;
        }
    }

    fn ensure_monitor(&self, name: &PluginName, slot: &Arc<WorkerSlot>) {
        if slot.has_monitor() || !self.running.load(Ordering::SeqCst) {
            return;
        }
        let handle = Monitor {
            plugin: name.clone(),
            slot: Arc::clone(slot),
            state: self.state.clone(),
            interval: self.config.health_interval,
            probe_timeout: self.config.default_timeout,
        }
        .spawn(self.shutdown.child_token());
        slot.set_monitor(handle);
    }

    async fn handle_directive(&self, name: PluginName, directive: Directive) {
        if self.ensure_running().is_err() {
            return;
        }
        let Some(slot) = self.slot(name.as_str()) else {
            debug!(plugin = %name, "directive for removed plugin ignored");
            return;
        };
        match directive {
            Directive::None => {},
            Directive::Retire { reason } => {
                self.tear_down(&slot, true).await;
                info!(plugin = %name, reason = %reason, "plugin retired");
            },
            Directive::Restart { reason } => self.restart(&name, &slot, &reason).await,
        }
    }

    async fn restart(&self, name: &PluginName, slot: &Arc<WorkerSlot>, reason: &str) {
        let Some(descriptor) = self.arena_snapshot().get(name.as_str()).cloned() else {
            return;
        };
        let _lifecycle = slot.lifecycle.lock().await;

        // A pending restart leaves the record without a worker id.
        match self.state.snapshot(name.as_str()) {
            Some(record) if !record.status.is_terminal() && record.worker_id.is_none() => {},
            _ => {
                debug!(plugin = %name, "stale restart directive ignored");
                return;
            },
        }

        if let Some(old) = slot.take() {
            self.supervisor.terminate(old.worker.as_ref(), false).await;
        }
        match self.spawn_worker(&descriptor).await {
            Ok(next) => {
                let worker = Arc::clone(&next.worker);
                let applied = self
                    .state
                    .apply(name, RecordOp::Restarted {
                        worker_id: worker.id(),
                        reason: reason.to_string(),
                    })
                    .await;
                if applied {
                    slot.install(next);
                    info!(plugin = %name, worker_id = worker.id(), reason, "plugin restarted");
                    self.report_if_dead(name, worker.as_ref()).await;
                } else {
                    self.supervisor.terminate(worker.as_ref(), false).await;
                }
            },
            Err(e) => {
                warn!(plugin = %name, error = %e, "restart failed");
                self.state
                    .apply(name, RecordOp::RestartFailed {
                        error: e.to_string(),
                    })
                    .await;
            },
        }
    }
}

async fn directive_loop(
    inner: Weak<Inner>,
    mut directives: mpsc::UnboundedReceiver<DirectiveFor>,
    shutdown: CancellationToken,
) {
    loop {
        let (name, directive) = tokio::select! {
            () = shutdown.cancelled() => break,
            next = directives.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        // Directives for different plugins never wait on each other.
        tokio::spawn(async move {
            inner.handle_directive(name, directive).await;
        });
    }
    debug!("directive loop stopped");
}
