//! The environment the supervisor hands a worker.

use std::collections::HashMap;

use nebula_core::{PLUGIN_API_VERSION, PluginName};

use crate::error::{SdkError, SdkResult};

/// Set to `1` to let a worker run with euid 0.
pub const ALLOW_ROOT_VAR: &str = "NEBULA_PLUGIN_ALLOW_ROOT";

/// Worker settings read from `NEBULA_PLUGIN_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    /// Plugin this worker serves.
    pub plugin: PluginName,
    /// API version the host speaks.
    pub api_version: String,
    /// Address-space limit, MiB.
    pub memory_mb: Option<u64>,
    /// CPU-time limit, seconds.
    pub cpu_seconds: Option<u64>,
    /// Log level for the worker's subscriber.
    pub log_level: String,
    /// Opaque worker token.
    pub token: Option<String>,
    /// Whether running as root was explicitly allowed.
    pub allow_root: bool,
}

impl WorkerEnv {
    /// Read the process environment.
    ///
    /// # Errors
    ///
    /// See [`from_vars`](Self::from_vars).
    pub fn from_env() -> SdkResult<Self> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Build from an explicit variable map.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Environment`] if `NEBULA_PLUGIN_NAME` is missing or
    /// invalid, or the API version is not one this SDK speaks.
    pub fn from_vars(vars: &HashMap<String, String>) -> SdkResult<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let name = get("NEBULA_PLUGIN_NAME")
            .ok_or_else(|| SdkError::Environment("NEBULA_PLUGIN_NAME is not set".into()))?;
        let plugin =
            PluginName::new(name).map_err(|e| SdkError::Environment(e.to_string()))?;

        let api_version = get("NEBULA_PLUGIN_API_VERSION")
            .unwrap_or(PLUGIN_API_VERSION)
            .to_string();
        if api_version != PLUGIN_API_VERSION {
            return Err(SdkError::Environment(format!(
                "host speaks plugin API {api_version}, this worker speaks {PLUGIN_API_VERSION}"
            )));
        }

        Ok(Self {
            plugin,
            api_version,
            memory_mb: get("NEBULA_PLUGIN_MEMORY_MB").and_then(|v| v.parse().ok()),
            cpu_seconds: get("NEBULA_PLUGIN_CPU_SECONDS").and_then(|v| v.parse().ok()),
            log_level: get("NEBULA_PLUGIN_LOG_LEVEL").unwrap_or("info").to_string(),
            token: get("NEBULA_PLUGIN_TOKEN").map(str::to_string),
            allow_root: get(ALLOW_ROOT_VAR) == Some("1"),
        })
    }

    /// Refuse to continue as root unless allowed.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::RunningAsRoot`].
    pub fn check_privileges(&self) -> SdkResult<()> {
        if nix::unistd::geteuid().is_root() && !self.allow_root {
            return Err(SdkError::RunningAsRoot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_reads_supervisor_variables() {
        let env = WorkerEnv::from_vars(&vars(&[
            ("NEBULA_PLUGIN_NAME", "sample_sync"),
            ("NEBULA_PLUGIN_API_VERSION", "v1"),
            ("NEBULA_PLUGIN_MEMORY_MB", "128"),
            ("NEBULA_PLUGIN_CPU_SECONDS", "30"),
            ("NEBULA_PLUGIN_LOG_LEVEL", "debug"),
            ("NEBULA_PLUGIN_TOKEN", "abc"),
        ]))
        .unwrap();
        assert_eq!(env.plugin.as_str(), "sample_sync");
        assert_eq!(env.memory_mb, Some(128));
        assert_eq!(env.cpu_seconds, Some(30));
        assert_eq!(env.log_level, "debug");
        assert_eq!(env.token.as_deref(), Some("abc"));
        assert!(!env.allow_root);
    }

    #[test]
    fn test_missing_name_is_an_error() {
        assert!(WorkerEnv::from_vars(&vars(&[])).is_err());
        assert!(WorkerEnv::from_vars(&vars(&[("NEBULA_PLUGIN_NAME", "../x")])).is_err());
    }

    #[test]
    fn test_foreign_api_version_is_refused() {
        let err = WorkerEnv::from_vars(&vars(&[
            ("NEBULA_PLUGIN_NAME", "sample_sync"),
            ("NEBULA_PLUGIN_API_VERSION", "v2"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("v2"));
    }

    #[test]
    fn test_allow_root_needs_exactly_one() {
        let env = WorkerEnv::from_vars(&vars(&[
            ("NEBULA_PLUGIN_NAME", "sample_sync"),
            (ALLOW_ROOT_VAR, "1"),
        ]))
        .unwrap();
        assert!(env.allow_root);
        assert!(env.check_privileges().is_ok());

        let env = WorkerEnv::from_vars(&vars(&[
            ("NEBULA_PLUGIN_NAME", "sample_sync"),
            (ALLOW_ROOT_VAR, "yes"),
        ]))
        .unwrap();
        assert!(!env.allow_root);
    }
}
