//! Rescan and reconciliation.

use std::sync::{Arc, PoisonError};

use chrono::Utc;
use futures::future::join_all;
use nebula_core::PluginName;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{Inner, PluginManager};
use crate::descriptor::PluginDescriptor;
use crate::error::PluginResult;
use crate::loader::{self, Rejection, ScanOutcome};
use crate::record::{PluginStatus, RuntimeRecord};
use crate::state::RecordOp;

/// What one rescan did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescanReport {
    /// Newly loaded plugins.
    pub added: Vec<String>,
    /// Plugins whose manifest disappeared.
    pub removed: Vec<String>,
    /// Plugins restarted because their version, scopes or entry changed.
    pub restarted: Vec<String>,
    /// Disabled or crashed plugins brought back.
    pub reactivated: Vec<String>,
    /// Plugins left running undisturbed.
    pub unchanged: Vec<String>,
    /// Plugins the loader refused.
    pub rejected: Vec<Rejection>,
}

enum Step {
    Remove(PluginName),
    Load {
        descriptor: Arc<PluginDescriptor>,
        replace: bool,
    },
    Reactivate(Arc<PluginDescriptor>),
}

enum Outcome {
    Added(PluginName),
    Removed(PluginName),
    Restarted(PluginName),
    Reactivated(PluginName),
    Unchanged(PluginName),
}

impl PluginManager {
    /// Re-read the scan path and reconcile running workers with it.
    ///
    /// Safe to call while probes are in flight. Rescans are serialised;
    /// work on different plugins inside one rescan runs concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotRunning`](crate::PluginError::NotRunning)
    /// after shutdown.
    pub async fn rescan(&self) -> PluginResult<RescanReport> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let _serial = inner.rescan_lock.lock().await;

        if !inner.config.enabled {
            debug!("plugins disabled, rescan skipped");
            return Ok(RescanReport::default());
        }

        let outcome = inner.scan().await;
        let current = inner.arena_snapshot();
        let (next, diff) = current.successor(outcome.valid);
        let next_arena = Arc::new(next);
        *inner.rejected.write().unwrap_or_else(PoisonError::into_inner) = outcome.rejected.clone();
        *inner.arena.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next_arena);

        let mut work = Vec::new();
        for name in diff.removed {
            work.push(Step::Remove(name));
        }
        for (names, replace) in [(diff.added, false), (diff.changed, true)] {
            for name in names {
                if let Some(descriptor) = next_arena.get(name.as_str()) {
                    work.push(Step::Load {
                        descriptor: Arc::clone(descriptor),
                        replace,
                    });
                }
            }
        }
        for name in diff.unchanged {
            if let Some(descriptor) = next_arena.get(name.as_str()) {
                work.push(Step::Reactivate(Arc::clone(descriptor)));
            }
        }

        let mut report = RescanReport {
            rejected: outcome.rejected,
            ..RescanReport::default()
        };
        for outcome in join_all(work.into_iter().map(|step| inner.reconcile(step))).await {
            match outcome {
                Outcome::Added(n) => report.added.push(n.to_string()),
                Outcome::Removed(n) => report.removed.push(n.to_string()),
                Outcome::Restarted(n) => report.restarted.push(n.to_string()),
                Outcome::Reactivated(n) => report.reactivated.push(n.to_string()),
                Outcome::Unchanged(n) => report.unchanged.push(n.to_string()),
            }
        }
        for list in [
            &mut report.added,
            &mut report.removed,
            &mut report.restarted,
            &mut report.reactivated,
            &mut report.unchanged,
        ] {
            list.sort();
        }

        info!(
            generation = next_arena.generation(),
            added = report.added.len(),
            removed = report.removed.len(),
            restarted = report.restarted.len(),
            reactivated = report.reactivated.len(),
            unchanged = report.unchanged.len(),
            rejected = report.rejected.len(),
            "rescan complete"
        );
        for rejection in &report.rejected {
            warn!(plugin = %rejection.name, reason = %rejection.reason, "plugin rejected");
        }
        Ok(report)
    }
}

impl Inner {
    async fn reconcile(&self, step: Step) -> Outcome {
        match step {
            Step::Remove(name) => self.remove_plugin(name).await,
            Step::Load {
                descriptor,
                replace,
            } => self.load_plugin(descriptor, replace).await,
            Step::Reactivate(descriptor) => self.reactivate_if_idle(descriptor).await,
        }
    }

    async fn scan(&self) -> ScanOutcome {
        let path = self.config.scan_path.clone();
        let policy = self.config.loader_policy(self.supervisor.registry());
        match tokio::task::spawn_blocking(move || loader::scan(&path, &policy)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "plugin scan task failed");
                ScanOutcome::default()
            },
        }
    }

    async fn remove_plugin(&self, name: PluginName) -> Outcome {
        if let Some((_, slot)) = self.slots.remove(name.as_str()) {
            slot.stop_monitor();
            self.tear_down(&slot, true).await;
        }
        self.state.apply(&name, RecordOp::Remove).await;
        info!(plugin = %name, "plugin removed");
        Outcome::Removed(name)
    }

    /// Fresh record, then a fresh worker. `replace` marks a changed manifest.
    async fn load_plugin(&self, descriptor: Arc<PluginDescriptor>, replace: bool) -> Outcome {
        let name = descriptor.name.clone();
        let slot = self.slot_or_insert(&name);
        self.state
            .apply(&name, RecordOp::Insert(RuntimeRecord::new(
                descriptor.warning.clone(),
                Utc::now(),
            )))
            .await;
        if let Err(e) = self.bring_up(&descriptor, &slot).await {
            debug!(plugin = %name, error = %e, "plugin loaded but not running");
        }
        if replace {
            info!(plugin = %name, version = %descriptor.version, "manifest changed, plugin restarted");
            Outcome::Restarted(name)
        } else {
            info!(plugin = %name, version = %descriptor.version, source = descriptor.source(), "plugin loaded");
            Outcome::Added(name)
        }
    }

    /// Unchanged manifests keep their worker, unless the plugin sits
    /// disabled or crashed without one.
    async fn reactivate_if_idle(&self, descriptor: Arc<PluginDescriptor>) -> Outcome {
        let name = descriptor.name.clone();
        let slot = self.slot_or_insert(&name);
        let idle = slot.current().is_none();
        let status = self.state.snapshot(name.as_str()).map(|r| r.status);
        let stranded = matches!(
            status,
            None | Some(PluginStatus::Disabled | PluginStatus::Crashed)
        );
        if !(idle && stranded) {
            return Outcome::Unchanged(name);
        }

        self.state
            .apply(&name, RecordOp::Insert(RuntimeRecord::new(
                descriptor.warning.clone(),
                Utc::now(),
            )))
            .await;
        if let Err(e) = self.bring_up(&descriptor, &slot).await {
            debug!(plugin = %name, error = %e, "reactivation failed");
        }
        info!(plugin = %name, "plugin reactivated by rescan");
        Outcome::Reactivated(name)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;
    use nebula_core::{HostCalls, RemoteError, WorkerPlugin};
    use nebula_events::EventBus;
    use serde_json::{Value, json};

    use super::*;
    use crate::bridge::InMemoryDirectory;
    use crate::manager::{HostServices, ManagerConfig, PluginAction};
    use crate::supervisor::InProcessRegistry;

    struct Idle;

    #[async_trait]
    impl WorkerPlugin for Idle {
        async fn health(&self) -> Result<Value, RemoteError> {
            Ok(json!({ "status": "ok" }))
        }

        async fn handle(
            &self,
            method: &str,
            _params: Value,
            _host: &dyn HostCalls,
        ) -> Result<Value, RemoteError> {
            Err(RemoteError::method_not_found(method))
        }
    }

    fn write_manifest(scan: &Path, name: &str, version: &str, description: &str) {
        let dir = scan.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.toml"),
            format!(
                "version = \"{version}\"\ndescription = \"{description}\"\nscopes = [\"users.read\"]\n\n[entry]\ntype = \"in_process\"\nfactory = \"idle\"\n"
            ),
        )
        .unwrap();
    }

    async fn start(root: &Path) -> PluginManager {
        let mut config = ManagerConfig::new(root.join("plugins"));
        config.log_dir = root.join("logs");
        config.health_interval = Duration::from_secs(3600);
        config.shutdown_grace = Duration::from_millis(200);
        let mut registry = InProcessRegistry::new();
        registry.register("idle", Arc::new(|| Arc::new(Idle) as Arc<dyn WorkerPlugin>));
        PluginManager::start(config, HostServices {
            directory: Arc::new(InMemoryDirectory::new()),
            events: Arc::new(EventBus::new()),
            registry,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_second_rescan_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("plugins");
        write_manifest(&scan, "alpha", "1.0.0", "first");
        let manager = start(dir.path()).await;

        let report = manager.rescan().await.unwrap();
        assert!(report.added.is_empty());
        assert!(report.restarted.is_empty());
        assert_eq!(report.unchanged, vec!["alpha"]);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_rescan_reconciles_changes() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("plugins");
        write_manifest(&scan, "alpha", "1.0.0", "first");
        write_manifest(&scan, "beta", "1.0.0", "first");
        write_manifest(&scan, "gamma", "1.0.0", "first");
        let manager = start(dir.path()).await;
        let gamma_started = manager.record("gamma").unwrap().initialized_at;

        std::fs::remove_dir_all(scan.join("alpha")).unwrap();
        write_manifest(&scan, "beta", "1.1.0", "first");
        write_manifest(&scan, "gamma", "1.0.0", "edited description only");
        write_manifest(&scan, "delta", "0.1.0", "new");
        std::fs::create_dir_all(scan.join("bad name!")).unwrap();
        std::fs::write(scan.join("bad name!/plugin.toml"), "[entry]\ntype = \"in_process\"\nfactory = \"idle\"\n").unwrap();

        let report = manager.rescan().await.unwrap();
        assert_eq!(report.added, vec!["delta"]);
        assert_eq!(report.removed, vec!["alpha"]);
        assert_eq!(report.restarted, vec!["beta"]);
        assert_eq!(report.unchanged, vec!["gamma"]);
        assert_eq!(report.rejected.len(), 1);

        assert!(manager.record("alpha").is_none());
        assert!(manager.descriptor("alpha").is_none());
        assert_eq!(manager.descriptor("beta").unwrap().version.to_string(), "1.1.0");
        assert_eq!(
            manager.descriptor("gamma").unwrap().description,
            "edited description only"
        );
        assert_eq!(manager.record("gamma").unwrap().initialized_at, gamma_started);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_rescan_reactivates_stopped_plugin_only_when_crashed_or_disabled() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "alpha", "1.0.0", "first");
        let manager = start(dir.path()).await;

        manager.action("alpha", PluginAction::Stop).await.unwrap();
        let report = manager.rescan().await.unwrap();
        assert_eq!(report.unchanged, vec!["alpha"]);
        assert_eq!(manager.record("alpha").unwrap().status, PluginStatus::Stopped);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_manager_skips_scanning() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "alpha", "1.0.0", "first");
        let mut config = ManagerConfig::new(dir.path().join("plugins"));
        config.enabled = false;
        let manager = PluginManager::start(config, HostServices {
            directory: Arc::new(InMemoryDirectory::new()),
            events: Arc::new(EventBus::new()),
            registry: InProcessRegistry::new(),
        })
        .await
        .unwrap();

        assert_eq!(manager.rescan().await.unwrap(), RescanReport::default());
        assert!(manager.list().is_empty());
        manager.shutdown().await;
    }
}
