//! Cgroup v2 resource control for worker processes.
//!
//! The manager initialises one [`CgroupManager`] at start. Every process
//! activation gets a fresh child group `<root>/<plugin>-<millis>` with
//! `memory.max`, `cpu.max` and `pids.max` written before the worker pid is
//! moved in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nebula_core::PluginName;
use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};

/// Controllers enabled for worker groups.
const CONTROLLERS: [&str; 3] = ["+cpu", "+memory", "+pids"];

/// Directory created under the manager's own group when the root is `auto`.
const AUTO_ROOT_LEAF: &str = "nebula-plugins";

/// Per-group limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupLimits {
    /// `memory.max` in bytes.
    pub memory_max_bytes: u64,
    /// `cpu.max` quota in microseconds.
    pub cpu_quota_us: u64,
    /// `cpu.max` period in microseconds.
    pub cpu_period_us: u64,
    /// `pids.max`.
    pub pids_max: u64,
}

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct CgroupSettings {
    /// Whether to use cgroups at all.
    pub enabled: bool,
    /// Whether a missing backend is fatal.
    pub required: bool,
    /// `auto` or an absolute path.
    pub root: String,
    /// Cgroup v2 mount point.
    pub mount: PathBuf,
    /// File describing the manager's own group.
    pub self_cgroup: PathBuf,
    /// Limits for every worker group.
    pub limits: CgroupLimits,
}

impl CgroupSettings {
    /// Disabled backend.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            required: false,
            root: "auto".to_string(),
            mount: PathBuf::from("/sys/fs/cgroup"),
            self_cgroup: PathBuf::from("/proc/self/cgroup"),
            limits: CgroupLimits {
                memory_max_bytes: 128 * 1024 * 1024,
                cpu_quota_us: 50_000,
                cpu_period_us: 100_000,
                pids_max: 128,
            },
        }
    }
}

/// Backend state after initialisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgroupStatus {
    /// Turned off by configuration.
    Disabled,
    /// Ready; groups are created under `root`.
    Active {
        /// Parent of all worker groups.
        root: PathBuf,
    },
    /// Wanted but unavailable; workers run unconfined.
    Unavailable {
        /// Why the backend could not be used.
        reason: String,
    },
}

/// Cgroup backend shared by all activations.
#[derive(Debug)]
pub struct CgroupManager {
    settings: CgroupSettings,
    status: CgroupStatus,
}

impl CgroupManager {
    /// Initialise the backend.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ResourceBackend`] if the backend is enabled,
    /// required and unusable.
    pub fn initialize(settings: CgroupSettings) -> PluginResult<Self> {
        if !settings.enabled {
            debug!("cgroup backend disabled");
            return Ok(Self {
                settings,
                status: CgroupStatus::Disabled,
            });
        }

        let status = match prepare_root(&settings) {
            Ok(root) => {
                info!(root = %root.display(), "cgroup backend ready");
                CgroupStatus::Active { root }
            },
            Err(reason) if settings.required => {
                return Err(PluginError::ResourceBackend(reason));
            },
            Err(reason) => {
                warn!(reason = %reason, "cgroup backend unavailable, workers run unconfined");
                CgroupStatus::Unavailable { reason }
            },
        };

        Ok(Self { settings, status })
    }

    /// Current backend state.
    #[must_use]
    pub fn status(&self) -> &CgroupStatus {
        &self.status
    }

    /// Whether a missing group must fail activation.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.settings.enabled && self.settings.required
    }

    /// Create a group for one activation.
    ///
    /// Returns `Ok(None)` when the backend is off or unavailable but not
    /// required.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ResourceBackend`] if the group cannot be set up
    /// and isolation is required.
    pub fn create_group(&self, plugin: &PluginName) -> PluginResult<Option<CgroupHandle>> {
        let root = match &self.status {
            CgroupStatus::Active { root } => root,
            CgroupStatus::Disabled => return Ok(None),
            CgroupStatus::Unavailable { reason } => {
                if self.is_required() {
                    return Err(PluginError::ResourceBackend(reason.clone()));
                }
                return Ok(None);
            },
        };

        let millis = chrono::Utc::now().timestamp_millis();
        let path = root.join(format!("{plugin}-{millis}"));
        match setup_group(&path, &self.settings.limits) {
            Ok(()) => {
                debug!(plugin = %plugin, path = %path.display(), "cgroup created");
                Ok(Some(CgroupHandle { path }))
            },
            Err(reason) if self.is_required() => Err(PluginError::ResourceBackend(reason)),
            Err(reason) => {
                warn!(plugin = %plugin, reason = %reason, "cgroup setup failed, running unconfined");
                Ok(None)
            },
        }
    }
}

fn prepare_root(settings: &CgroupSettings) -> Result<PathBuf, String> {
    let controllers = settings.mount.join("cgroup.controllers");
    if !controllers.is_file() {
        return Err(format!(
            "cgroup v2 is not mounted at {}",
            settings.mount.display()
        ));
    }

    let (parent, root) = if settings.root == "auto" {
        let own = read_own_group(&settings.self_cgroup)?;
        let parent = settings.mount.join(own);
        let root = parent.join(AUTO_ROOT_LEAF);
        (Some(parent), root)
    } else {
        let root = PathBuf::from(&settings.root);
        (root.parent().map(Path::to_path_buf), root)
    };

    std::fs::create_dir_all(&root)
        .map_err(|e| format!("cannot create {}: {e}", root.display()))?;

    if let Some(parent) = parent {
        enable_controllers(&parent);
    }
    enable_controllers(&root);
    Ok(root)
}

/// Relative path of the `0::` (unified hierarchy) entry.
fn read_own_group(self_cgroup: &Path) -> Result<PathBuf, String> {
    let raw = std::fs::read_to_string(self_cgroup)
        .map_err(|e| format!("cannot read {}: {e}", self_cgroup.display()))?;
    raw.lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|rel| PathBuf::from(rel.trim().trim_start_matches('/')))
        .ok_or_else(|| format!("no unified cgroup entry in {}", self_cgroup.display()))
}

/// Best effort; a parent that holds processes cannot delegate controllers.
fn enable_controllers(dir: &Path) {
    let control = dir.join("cgroup.subtree_control");
    for controller in CONTROLLERS {
        if let Err(e) = std::fs::write(&control, controller) {
            debug!(path = %control.display(), controller, error = %e, "controller not enabled");
        }
    }
}

fn setup_group(path: &Path, limits: &CgroupLimits) -> Result<(), String> {
    std::fs::create_dir(path).map_err(|e| format!("cannot create {}: {e}", path.display()))?;
    let write = |file: &str, value: String| {
        std::fs::write(path.join(file), value)
            .map_err(|e| format!("cannot write {}/{file}: {e}", path.display()))
    };
    write("memory.max", limits.memory_max_bytes.to_string())?;
    write(
        "cpu.max",
        format!("{} {}", limits.cpu_quota_us, limits.cpu_period_us),
    )?;
    write("pids.max", limits.pids_max.to_string())?;
    Ok(())
}

/// One worker's group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    path: PathBuf,
}

impl CgroupHandle {
    /// Wrap an existing group directory.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Group directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move a process into the group.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from writing `cgroup.procs`.
    pub fn assign(&self, pid: u32) -> PluginResult<()> {
        let procs = self.path.join("cgroup.procs");
        std::fs::write(&procs, pid.to_string()).map_err(|e| PluginError::io(procs, e))
    }

    /// Parsed `memory.events`; empty if unreadable.
    #[must_use]
    pub fn memory_events(&self) -> BTreeMap<String, u64> {
        std::fs::read_to_string(self.path.join("memory.events"))
            .map(|raw| parse_flat_keyed(&raw))
            .unwrap_or_default()
    }

    /// `oom_kill` count from `memory.events`.
    #[must_use]
    pub fn oom_kills(&self) -> u64 {
        self.memory_events().get("oom_kill").copied().unwrap_or(0)
    }

    /// `memory.current` in bytes.
    #[must_use]
    pub fn memory_current(&self) -> Option<u64> {
        std::fs::read_to_string(self.path.join("memory.current"))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }

    /// Remove the group once it holds no processes.
    ///
    /// Returns whether the directory is gone.
    pub fn cleanup(&self) -> bool {
        let procs = std::fs::read_to_string(self.path.join("cgroup.procs")).unwrap_or_default();
        if !procs.trim().is_empty() {
            debug!(path = %self.path.display(), "cgroup still has processes, keeping it");
            return false;
        }
        match std::fs::remove_dir(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "cgroup not removed");
                false
            },
        }
    }
}

fn parse_flat_keyed(raw: &str) -> BTreeMap<String, u64> {
    raw.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(' ')?;
            Some((key.to_string(), value.trim().parse().ok()?))
        })
        .collect()
}
