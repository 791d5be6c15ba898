//! `NEBULA_*` environment fallbacks.
//!
//! Environment variables are a fallback, not an override: they only fill
//! fields that no configuration file set.

use std::collections::HashMap;
use std::hash::BuildHasher;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources};

/// The TOML type a variable is coerced into.
#[derive(Debug, Clone, Copy)]
enum Kind {
    Str,
    Int,
    Float,
    Bool,
    List,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: Kind,
}

const fn mapping(var_name: &'static str, field_path: &'static str, kind: Kind) -> EnvMapping {
    EnvMapping {
        var_name,
        field_path,
        kind,
    }
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    mapping("NEBULA_ENV", "plugins.environment", Kind::Str),
    mapping("NEBULA_PLUGINS_ENABLED", "plugins.enabled", Kind::Bool),
    mapping("NEBULA_PLUGINS_SCAN_PATH", "plugins.scan_path", Kind::Str),
    mapping("NEBULA_PLUGINS_LOG_DIR", "plugins.log_dir", Kind::Str),
    mapping("NEBULA_PLUGINS_IN_PROCESS", "plugins.in_process_enabled", Kind::Bool),
    mapping("NEBULA_PLUGINS_DEFAULT_TIMEOUT_SECS", "plugins.default_timeout_secs", Kind::Float),
    mapping("NEBULA_PLUGINS_MAX_TIMEOUT_SECS", "plugins.max_timeout_secs", Kind::Float),
    mapping("NEBULA_PLUGINS_HEALTH_INTERVAL_SECS", "plugins.health_interval_secs", Kind::Int),
    mapping("NEBULA_PLUGINS_MEMORY_LIMIT_MB", "plugins.memory_limit_mb", Kind::Int),
    mapping("NEBULA_PLUGINS_CPU_TIME_LIMIT_SECS", "plugins.cpu_time_limit_secs", Kind::Int),
    mapping("NEBULA_PLUGINS_ALLOWED_SCOPES", "plugins.allowed_scopes", Kind::List),
    mapping("NEBULA_CGROUP_ENABLED", "cgroup.enabled", Kind::Bool),
    mapping("NEBULA_CGROUP_REQUIRED", "cgroup.required", Kind::Bool),
    mapping("NEBULA_CGROUP_ROOT", "cgroup.root", Kind::Str),
    mapping("NEBULA_LOG_LEVEL", "logging.level", Kind::Str),
    mapping("NEBULA_LOG_FORMAT", "logging.format", Kind::Str),
    mapping("NEBULA_LOG_DIR", "logging.directory", Kind::Str),
];

/// Apply environment fallbacks to fields no configuration file set.
///
/// Returns the number of variables applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] if a numeric or boolean variable does
/// not parse.
pub fn apply_env_fallbacks<S: BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        if sources.get(mapping.field_path).is_some_and(|l| l.is_file()) {
            continue;
        }
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };

        debug!(var = mapping.var_name, field = mapping.field_path, "applying env var fallback");
        let value = coerce(mapping, raw)?;
        set_field(merged, mapping.field_path, value);
        sources.insert(mapping.field_path.to_owned(), ConfigLayer::Environment);
        count = count.saturating_add(1);
    }

    Ok(count)
}

fn coerce(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    let bad = |what: &str| ConfigError::EnvError {
        var_name: mapping.var_name.to_owned(),
        message: format!("expected {what}, got {raw:?}"),
    };
    let raw = raw.trim();
    Ok(match mapping.kind {
        Kind::Str => toml::Value::String(raw.to_owned()),
        Kind::Int => toml::Value::Integer(raw.parse::<i64>().map_err(|_| bad("an integer"))?),
        Kind::Float => toml::Value::Float(raw.parse::<f64>().map_err(|_| bad("a number"))?),
        Kind::Bool => toml::Value::Boolean(parse_bool(raw).ok_or_else(|| bad("a boolean"))?),
        Kind::List => toml::Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_owned()))
                .collect(),
        ),
    })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Set a dotted path in the tree, creating intermediate tables.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

/// Collect the process environment.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_env_fills_defaulted_field() {
        let mut merged: toml::Value = toml::from_str("[logging]\nlevel = \"info\"").unwrap();
        let mut sources = FieldSources::new();
        sources.insert("logging.level".to_owned(), ConfigLayer::Defaults);
        let env = make_env(&[("NEBULA_LOG_LEVEL", "debug")]);

        let count = apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap();

        assert_eq!(count, 1);
        assert_eq!(merged["logging"]["level"].as_str(), Some("debug"));
        assert_eq!(sources.get("logging.level"), Some(&ConfigLayer::Environment));
    }

    #[test]
    fn test_env_skips_file_set_field() {
        let mut merged: toml::Value = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        let mut sources = FieldSources::new();
        sources.insert("logging.level".to_owned(), ConfigLayer::File);
        let env = make_env(&[("NEBULA_LOG_LEVEL", "debug")]);

        let count = apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap();

        assert_eq!(count, 0);
        assert_eq!(merged["logging"]["level"].as_str(), Some("warn"));
    }

    #[test]
    fn test_env_creates_missing_tables() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut sources = FieldSources::new();
        let env = make_env(&[("NEBULA_CGROUP_REQUIRED", "yes")]);

        apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap();

        assert_eq!(merged["cgroup"]["required"].as_bool(), Some(true));
    }

    #[test]
    fn test_env_scope_list() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut sources = FieldSources::new();
        let env = make_env(&[("NEBULA_PLUGINS_ALLOWED_SCOPES", "users.read, events.emit,")]);

        apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap();

        let scopes = merged["plugins"]["allowed_scopes"].as_array().unwrap();
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[1].as_str(), Some("events.emit"));
    }

    #[test]
    fn test_env_rejects_bad_number() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut sources = FieldSources::new();
        let env = make_env(&[("NEBULA_PLUGINS_MEMORY_LIMIT_MB", "lots")]);

        let err = apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap_err();
        assert!(matches!(err, ConfigError::EnvError { ref var_name, .. } if var_name == "NEBULA_PLUGINS_MEMORY_LIMIT_MB"));
    }
}
