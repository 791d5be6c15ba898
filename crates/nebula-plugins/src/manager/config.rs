//! Manager settings.

use std::path::PathBuf;
use std::time::Duration;

use nebula_core::ScopeSet;

use crate::cgroup::CgroupSettings;
use crate::loader::LoaderPolicy;
use crate::policy::RestartPolicy;
use crate::supervisor::{InProcessRegistry, SupervisorSettings};

/// Everything the manager needs to know, already validated.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Whether plugins are loaded at all.
    pub enabled: bool,
    /// Directory of plugin directories.
    pub scan_path: PathBuf,
    /// Development environment; gates the in-process kind.
    pub development: bool,
    /// Whether in-process plugins may load in development.
    pub in_process_enabled: bool,
    /// Activation handshake budget.
    pub init_timeout: Duration,
    /// Call timeout when the caller gives none.
    pub default_timeout: Duration,
    /// Ceiling for caller-supplied timeouts.
    pub max_timeout: Duration,
    /// Health probe period.
    pub health_interval: Duration,
    /// Thresholds and budgets.
    pub policy: RestartPolicy,
    /// Grace period for graceful termination.
    pub shutdown_grace: Duration,
    /// Worker log directory.
    pub log_dir: PathBuf,
    /// `RLIMIT_AS` for process workers, MiB.
    pub memory_limit_mb: u64,
    /// `RLIMIT_CPU` for process workers, seconds.
    pub cpu_time_limit_secs: u64,
    /// Upper bound for the `limit` option of `invoke`.
    pub max_invoke_limit: u64,
    /// Host scope allow-list at start.
    pub allowed_scopes: ScopeSet,
    /// Cgroup backend.
    pub cgroup: CgroupSettings,
    /// Log level handed to workers.
    pub worker_log_level: String,
}

impl ManagerConfig {
    /// Development defaults for `scan_path`.
    #[must_use]
    pub fn new(scan_path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            scan_path: scan_path.into(),
            development: true,
            in_process_enabled: true,
            init_timeout: Duration::from_secs(5),
            default_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(30),
            health_interval: Duration::from_secs(30),
            policy: RestartPolicy::default(),
            shutdown_grace: Duration::from_secs(3),
            log_dir: PathBuf::from("/tmp/nebula/plugin-logs"),
            memory_limit_mb: 128,
            cpu_time_limit_secs: 30,
            max_invoke_limit: 10_000,
            allowed_scopes: ScopeSet::all(),
            cgroup: CgroupSettings::disabled(),
            worker_log_level: "info".to_string(),
        }
    }

    /// Whether the in-process kind is loadable.
    #[must_use]
    pub fn allows_in_process(&self) -> bool {
        self.development && self.in_process_enabled
    }

    pub(crate) fn loader_policy(&self, registry: &InProcessRegistry) -> LoaderPolicy {
        LoaderPolicy {
            allow_in_process: self.allows_in_process(),
            factories: registry.names(),
        }
    }

    pub(crate) fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            log_dir: self.log_dir.clone(),
            init_timeout: self.init_timeout,
            default_timeout: self.default_timeout,
            shutdown_grace: self.shutdown_grace,
            memory_limit_mb: self.memory_limit_mb,
            cpu_time_limit_secs: self.cpu_time_limit_secs,
            log_level: self.worker_log_level.clone(),
        }
    }

    /// Per-call timeout: the caller's, or the default, capped at the ceiling.
    #[must_use]
    pub fn call_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout)
    }

    /// Clamp an invoke `limit` into `1..=max_invoke_limit`. None means the
    /// ceiling.
    #[must_use]
    pub fn invoke_limit(&self, requested: Option<u64>) -> u64 {
        let ceiling = self.max_invoke_limit.max(1);
        requested.map_or(ceiling, |n| n.clamp(1, ceiling))
    }
}
