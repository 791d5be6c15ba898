//! Conversion from the loaded [`Config`] into runtime settings.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nebula_config::Config;
use nebula_core::{Scope, ScopeSet, WorkerPlugin};
use nebula_plugin_sdk::SampleSync;
use nebula_plugin_sdk::sample_sync::NAME as SAMPLE_SYNC;
use nebula_plugins::{
    CgroupLimits, CgroupSettings, InProcessRegistry, LoaderPolicy, ManagerConfig, RestartPolicy,
};
use nebula_telemetry::{FileRotation, LogConfig, LogFormat};

/// Convert config to [`LogConfig`].
#[must_use]
pub(crate) fn to_log_config(cfg: &Config) -> LogConfig {
    let format = match cfg.logging.format.as_str() {
        "pretty" => LogFormat::Pretty,
        "json" => LogFormat::Json,
        "full" => LogFormat::Full,
        _ => LogFormat::Compact,
    };

    let mut log_config = LogConfig::new(&cfg.logging.level).with_format(format);
    for directive in &cfg.logging.directives {
        log_config = log_config.with_directive(directive);
    }
    if let Some(dir) = &cfg.logging.directory {
        log_config = log_config.with_file_logging(dir, "nebula-plugins", FileRotation::Daily);
    }
    log_config
}

fn secs(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

/// Convert config to [`ManagerConfig`].
///
/// # Errors
///
/// Fails if `allowed_scopes` names a scope outside the fixed universe.
pub(crate) fn to_manager_config(cfg: &Config) -> Result<ManagerConfig> {
    let plugins = &cfg.plugins;
    let allowed_scopes = plugins
        .allowed_scopes
        .iter()
        .map(|s| {
            s.parse::<Scope>()
                .with_context(|| format!("plugins.allowed_scopes: unknown scope {s:?}"))
        })
        .collect::<Result<ScopeSet>>()?;

    let environment = plugins.environment;
    let defaults = ManagerConfig::new(&plugins.scan_path);
    Ok(ManagerConfig {
        enabled: plugins.enabled,
        development: environment.is_development(),
        in_process_enabled: plugins.in_process_enabled,
        init_timeout: secs(plugins.init_timeout_secs, defaults.init_timeout),
        default_timeout: secs(plugins.default_timeout_secs, defaults.default_timeout),
        max_timeout: secs(plugins.max_timeout_secs, defaults.max_timeout),
        health_interval: Duration::from_secs(plugins.health_interval_secs),
        policy: RestartPolicy {
            max_restarts: plugins.max_restarts,
            max_crashes: plugins.max_crashes,
            timeout_restart_threshold: plugins.timeout_restart_threshold,
            health_restart_threshold: plugins.health_restart_threshold,
        },
        shutdown_grace: secs(plugins.shutdown_grace_secs, defaults.shutdown_grace),
        log_dir: plugins.log_dir.clone(),
        memory_limit_mb: plugins.memory_limit_mb,
        cpu_time_limit_secs: plugins.cpu_time_limit_secs,
        max_invoke_limit: plugins.max_invoke_limit,
        allowed_scopes,
        cgroup: CgroupSettings {
            enabled: cfg.cgroup.is_enabled(environment),
            required: cfg.cgroup.is_required(environment),
            root: cfg.cgroup.root.clone(),
            mount: cfg.cgroup.mount.clone(),
            limits: CgroupLimits {
                memory_max_bytes: plugins.memory_limit_mb.saturating_mul(1024 * 1024),
                cpu_quota_us: cfg.cgroup.cpu_quota_us,
                cpu_period_us: cfg.cgroup.cpu_period_us,
                pids_max: cfg.cgroup.pids_max,
            },
            ..CgroupSettings::disabled()
        },
        worker_log_level: cfg.logging.level.clone(),
        ..defaults
    })
}

/// In-process factories compiled into this binary.
#[must_use]
pub(crate) fn builtin_registry() -> InProcessRegistry {
    let mut registry = InProcessRegistry::new();
    registry.register(
        SAMPLE_SYNC,
        Arc::new(|| Arc::new(SampleSync::new()) as Arc<dyn WorkerPlugin>),
    );
    registry
}

/// Loader policy matching what the manager would apply.
#[must_use]
pub(crate) fn loader_policy(manager: &ManagerConfig, registry: &InProcessRegistry) -> LoaderPolicy {
    LoaderPolicy {
        allow_in_process: manager.allows_in_process(),
        factories: registry.names(),
    }
}

/// `dir` if given, else the configured scan path.
#[must_use]
pub(crate) fn scan_dir<'a>(manager: &'a ManagerConfig, dir: Option<&'a Path>) -> &'a Path {
    dir.unwrap_or(&manager.scan_path)
}
