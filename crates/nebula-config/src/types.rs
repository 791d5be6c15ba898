//! Configuration struct definitions.
//!
//! Every section is `#[serde(default)]` so partial files deserialize; the
//! `Default` impls mirror `defaults.toml`.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin runtime settings.
    pub plugins: PluginsSection,
    /// Cgroup v2 resource isolation.
    pub cgroup: CgroupSection,
    /// Host logging.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development: in-process plugins allowed, cgroups off by default.
    #[default]
    Development,
    /// Production: process plugins only, cgroups required by default.
    #[serde(alias = "prod")]
    Production,
}

impl Environment {
    /// Whether this is the development environment.
    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => f.write_str("development"),
            Self::Production => f.write_str("production"),
        }
    }
}

/// Plugin runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Master switch. A disabled manager loads nothing.
    pub enabled: bool,
    /// Deployment environment.
    pub environment: Environment,
    /// Directory scanned for `<name>/plugin.toml`.
    pub scan_path: PathBuf,
    /// Allow in-process plugins (only honoured in development).
    pub in_process_enabled: bool,
    /// Budget for the activation handshake, in seconds.
    pub init_timeout_secs: f64,
    /// Timeout applied to calls that do not name one, in seconds.
    pub default_timeout_secs: f64,
    /// Ceiling for caller-provided timeouts, in seconds.
    pub max_timeout_secs: f64,
    /// Health probe interval, in seconds.
    pub health_interval_secs: u64,
    /// Restart budget.
    pub max_restarts: u32,
    /// Crash budget.
    pub max_crashes: u32,
    /// Consecutive call timeouts that trigger a restart.
    pub timeout_restart_threshold: u32,
    /// Consecutive failed health probes that trigger a restart.
    pub health_restart_threshold: u32,
    /// Wait between the stop signal and a forced kill, in seconds.
    pub shutdown_grace_secs: f64,
    /// Directory holding `{name}.log` worker logs.
    pub log_dir: PathBuf,
    /// Worker memory ceiling in MiB.
    pub memory_limit_mb: u64,
    /// Worker CPU time ceiling in seconds.
    pub cpu_time_limit_secs: u64,
    /// Upper bound for the `limit` option of `invoke`.
    pub max_invoke_limit: u64,
    /// Host allow-list of scope tokens.
    pub allowed_scopes: Vec<String>,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            environment: Environment::Development,
            scan_path: PathBuf::from("plugins"),
            in_process_enabled: true,
            init_timeout_secs: 5.0,
            default_timeout_secs: 10.0,
            max_timeout_secs: 30.0,
            health_interval_secs: 30,
            max_restarts: 3,
            max_crashes: 3,
            timeout_restart_threshold: 3,
            health_restart_threshold: 2,
            shutdown_grace_secs: 3.0,
            log_dir: PathBuf::from("/tmp/nebula/plugin-logs"),
            memory_limit_mb: 128,
            cpu_time_limit_secs: 30,
            max_invoke_limit: 10_000,
            allowed_scopes: [
                "users.read",
                "users.write",
                "roles.read",
                "roles.write",
                "identity_tags.read",
                "identity_tags.write",
                "events.emit",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// CgroupSection
// ---------------------------------------------------------------------------

/// Cgroup v2 settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupSection {
    /// Attach workers to cgroups. Unset follows the environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Refuse to run unconfined. Unset follows the environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Root group for plugin cgroups, or `auto` for a child of our own group.
    pub root: String,
    /// cgroup2 mount point.
    pub mount: PathBuf,
    /// `cpu.max` quota in microseconds.
    pub cpu_quota_us: u64,
    /// `cpu.max` period in microseconds.
    pub cpu_period_us: u64,
    /// `pids.max`.
    pub pids_max: u64,
}

impl Default for CgroupSection {
    fn default() -> Self {
        Self {
            enabled: None,
            required: None,
            root: "auto".to_owned(),
            mount: PathBuf::from("/sys/fs/cgroup"),
            cpu_quota_us: 50_000,
            cpu_period_us: 100_000,
            pids_max: 128,
        }
    }
}

impl CgroupSection {
    /// Effective `enabled` for an environment.
    #[must_use]
    pub fn is_enabled(&self, environment: Environment) -> bool {
        self.enabled.unwrap_or(!environment.is_development())
    }

    /// Effective `required` for an environment.
    #[must_use]
    pub fn is_required(&self, environment: Environment) -> bool {
        self.required.unwrap_or(!environment.is_development())
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Host logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level filter.
    pub level: String,
    /// `pretty`, `compact`, `json` or `full`.
    pub format: String,
    /// Per-target directives, e.g. `nebula_plugins=debug`.
    pub directives: Vec<String>,
    /// Write daily-rotated log files here instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
            directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_follows_environment() {
        let section = CgroupSection::default();
        assert!(!section.is_enabled(Environment::Development));
        assert!(section.is_enabled(Environment::Production));
        assert!(section.is_required(Environment::Production));

        let explicit = CgroupSection {
            required: Some(false),
            ..CgroupSection::default()
        };
        assert!(!explicit.is_required(Environment::Production));
    }

    #[test]
    fn test_environment_accepts_prod_alias() {
        let section: PluginsSection = toml::from_str("environment = \"prod\"").unwrap();
        assert_eq!(section.environment, Environment::Production);
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let config: Config = toml::from_str("[plugins]\nmax_restarts = 5\n").unwrap();
        assert_eq!(config.plugins.max_restarts, 5);
        assert_eq!(config.plugins.max_crashes, 3);
        assert_eq!(config.plugins.allowed_scopes.len(), 7);
    }
}
