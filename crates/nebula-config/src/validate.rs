//! Post-merge normalisation and validation.
//!
//! [`normalize`] clamps numeric settings into their supported ranges, the way
//! the runtime would interpret them anyway. [`validate`] rejects values that
//! cannot be interpreted at all.

use tracing::warn;

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Smallest accepted timeout, in seconds.
pub const MIN_TIMEOUT_SECS: f64 = 0.1;
/// Largest accepted timeout, in seconds.
pub const MAX_TIMEOUT_SECS: f64 = 30.0;
/// Smallest health probe interval, in seconds.
pub const MIN_HEALTH_INTERVAL_SECS: u64 = 5;
/// Smallest worker memory ceiling, in MiB.
pub const MIN_MEMORY_LIMIT_MB: u64 = 64;
/// Smallest `cpu.max` quota or period, in microseconds.
pub const MIN_CPU_WINDOW_US: u64 = 1000;
/// Smallest `pids.max`.
pub const MIN_PIDS_MAX: u64 = 16;

const LOG_FORMATS: &[&str] = &["pretty", "compact", "json", "full"];

fn clamp_timeout(value: f64) -> f64 {
    value.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)
}

fn at_least<T: Ord + Copy + std::fmt::Display>(field: &str, value: &mut T, min: T) {
    if *value < min {
        warn!(field, value = %value, min = %min, "config value below minimum, clamping");
        *value = min;
    }
}

/// Clamp numeric settings into range.
pub fn normalize(config: &mut Config) {
    let p = &mut config.plugins;
    if p.init_timeout_secs.is_finite() {
        p.init_timeout_secs = clamp_timeout(p.init_timeout_secs);
    }
    if p.default_timeout_secs.is_finite() {
        p.default_timeout_secs = clamp_timeout(p.default_timeout_secs);
    }
    if p.max_timeout_secs.is_finite() {
        p.max_timeout_secs = clamp_timeout(p.max_timeout_secs);
    }
    if p.default_timeout_secs > p.max_timeout_secs {
        warn!(
            default = p.default_timeout_secs,
            max = p.max_timeout_secs,
            "default timeout exceeds the ceiling, lowering it"
        );
        p.default_timeout_secs = p.max_timeout_secs;
    }
    if p.shutdown_grace_secs.is_finite() {
        p.shutdown_grace_secs = clamp_timeout(p.shutdown_grace_secs);
    }

    at_least("plugins.health_interval_secs", &mut p.health_interval_secs, MIN_HEALTH_INTERVAL_SECS);
    at_least("plugins.memory_limit_mb", &mut p.memory_limit_mb, MIN_MEMORY_LIMIT_MB);
    at_least("plugins.cpu_time_limit_secs", &mut p.cpu_time_limit_secs, 1);
    at_least("plugins.max_restarts", &mut p.max_restarts, 1);
    at_least("plugins.max_crashes", &mut p.max_crashes, 1);
    at_least("plugins.timeout_restart_threshold", &mut p.timeout_restart_threshold, 1);
    at_least("plugins.health_restart_threshold", &mut p.health_restart_threshold, 1);
    at_least("plugins.max_invoke_limit", &mut p.max_invoke_limit, 1);

    let c = &mut config.cgroup;
    at_least("cgroup.cpu_quota_us", &mut c.cpu_quota_us, MIN_CPU_WINDOW_US);
    at_least("cgroup.cpu_period_us", &mut c.cpu_period_us, MIN_CPU_WINDOW_US);
    at_least("cgroup.pids_max", &mut c.pids_max, MIN_PIDS_MAX);
}

/// Validate a merged, normalised configuration.
///
/// # Errors
///
/// Returns the first [`ConfigError::ValidationError`] found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_plugins(config)?;
    validate_cgroup(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_plugins(config: &Config) -> ConfigResult<()> {
    let p = &config.plugins;
    for (field, value) in [
        ("plugins.init_timeout_secs", p.init_timeout_secs),
        ("plugins.default_timeout_secs", p.default_timeout_secs),
        ("plugins.max_timeout_secs", p.max_timeout_secs),
        ("plugins.shutdown_grace_secs", p.shutdown_grace_secs),
    ] {
        if !value.is_finite() {
            return Err(invalid(field, "must be a finite number of seconds"));
        }
    }
    if p.scan_path.as_os_str().is_empty() {
        return Err(invalid("plugins.scan_path", "must not be empty"));
    }
    if p.log_dir.as_os_str().is_empty() {
        return Err(invalid("plugins.log_dir", "must not be empty"));
    }
    if let Some(blank) = p.allowed_scopes.iter().find(|s| s.trim().is_empty()) {
        return Err(invalid(
            "plugins.allowed_scopes",
            format!("contains a blank entry {blank:?}"),
        ));
    }
    Ok(())
}

fn validate_cgroup(config: &Config) -> ConfigResult<()> {
    let c = &config.cgroup;
    if c.root.trim().is_empty() {
        return Err(invalid("cgroup.root", "must be 'auto' or an absolute path"));
    }
    if c.root != "auto" && !c.root.starts_with('/') {
        return Err(invalid(
            "cgroup.root",
            format!("'{}' is neither 'auto' nor an absolute path", c.root),
        ));
    }
    if !c.mount.is_absolute() {
        return Err(invalid("cgroup.mount", "must be an absolute path"));
    }
    if c.cpu_quota_us > c.cpu_period_us.saturating_mul(1024) {
        return Err(invalid(
            "cgroup.cpu_quota_us",
            "quota is more than 1024 times the period",
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !LOG_FORMATS.contains(&l.format.as_str()) {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: {}",
                l.format,
                LOG_FORMATS.join(", ")
            ),
        ));
    }
    if l.level.trim().is_empty() {
        return Err(invalid("logging.level", "must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let mut config = Config::default();
        normalize(&mut config);
        validate(&config).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_timeouts_clamped() {
        let mut config = Config::default();
        config.plugins.default_timeout_secs = 0.01;
        config.plugins.max_timeout_secs = 120.0;
        config.plugins.init_timeout_secs = 45.0;
        normalize(&mut config);

        assert!((config.plugins.default_timeout_secs - 0.1).abs() < f64::EPSILON);
        assert!((config.plugins.max_timeout_secs - 30.0).abs() < f64::EPSILON);
        assert!((config.plugins.init_timeout_secs - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_timeout_never_exceeds_max() {
        let mut config = Config::default();
        config.plugins.default_timeout_secs = 20.0;
        config.plugins.max_timeout_secs = 5.0;
        normalize(&mut config);
        assert!((config.plugins.default_timeout_secs - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_minimums_enforced() {
        let mut config = Config::default();
        config.plugins.health_interval_secs = 1;
        config.plugins.memory_limit_mb = 16;
        config.plugins.max_crashes = 0;
        config.cgroup.pids_max = 2;
        config.cgroup.cpu_period_us = 10;
        normalize(&mut config);

        assert_eq!(config.plugins.health_interval_secs, 5);
        assert_eq!(config.plugins.memory_limit_mb, 64);
        assert_eq!(config.plugins.max_crashes, 1);
        assert_eq!(config.cgroup.pids_max, 16);
        assert_eq!(config.cgroup.cpu_period_us, 1000);
    }

    #[test]
    fn test_non_finite_timeout_rejected() {
        let mut config = Config::default();
        config.plugins.max_timeout_secs = f64::NAN;
        normalize(&mut config);
        let err = validate(&config).unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { ref field, .. } if field == "plugins.max_timeout_secs")
        );
    }

    #[test]
    fn test_relative_cgroup_root_rejected() {
        let mut config = Config::default();
        config.cgroup.root = "nebula".to_owned();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.format"));
    }
}
