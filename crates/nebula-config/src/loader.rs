//! Config file discovery and layered loading.
//!
//! 1. Parse the embedded `defaults.toml`
//! 2. Merge `/etc/nebula/plugins.toml` if present
//! 3. Merge the explicit file, which must exist
//! 4. Apply `NEBULA_*` fallbacks for fields no file set
//! 5. Deserialize, normalise, validate

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::apply_env_fallbacks;
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, deep_merge_tracking, record_leaves};
use crate::show::ResolvedConfig;
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
pub(crate) const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// System-wide configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/nebula/plugins.toml";

/// Maximum allowed config file size (1 MiB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Where [`load_with`] looks for files.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// System file; `None` skips the layer.
    pub system_path: Option<PathBuf>,
    /// Explicit file (`--config`); it is an error if it does not exist.
    pub explicit_path: Option<PathBuf>,
}

impl LoadOptions {
    /// Standard discovery with an optional explicit file.
    #[must_use]
    pub fn standard(explicit_path: Option<&Path>) -> Self {
        Self {
            system_path: Some(PathBuf::from(SYSTEM_CONFIG_PATH)),
            explicit_path: explicit_path.map(Path::to_path_buf),
        }
    }
}

/// Load with the given file locations and environment.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a file is unreadable, oversized or malformed,
/// an environment variable is unusable, or validation fails.
pub fn load_with<S: BuildHasher>(
    options: &LoadOptions,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<ResolvedConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let mut field_sources = FieldSources::new();
    let mut loaded_files = Vec::new();
    record_leaves(&merged, "", ConfigLayer::Defaults, &mut field_sources);

    if let Some(system_path) = &options.system_path
        && let Some(overlay) = try_load_file(system_path)?
    {
        deep_merge_tracking(&mut merged, &overlay, "", ConfigLayer::System, &mut field_sources);
        loaded_files.push(system_path.display().to_string());
        info!(path = %system_path.display(), "loaded system config");
    }

    if let Some(path) = &options.explicit_path {
        let overlay = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        })?;
        deep_merge_tracking(&mut merged, &overlay, "", ConfigLayer::File, &mut field_sources);
        loaded_files.push(path.display().to_string());
        info!(path = %path.display(), "loaded config file");
    }

    let env_count = apply_env_fallbacks(&mut merged, &mut field_sources, env_vars)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    let mut config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::normalize(&mut config);
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Load a single file on top of the defaults, without other layers.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or validated.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let options = LoadOptions {
        system_path: None,
        explicit_path: Some(path.to_path_buf()),
    };
    load_with(&options, &HashMap::<String, String>::new()).map(|r| r.config)
}

/// Read and parse a TOML file, returning `None` if it does not exist.
///
/// Reads once and checks the size afterwards, so there is no window between
/// a metadata check and the read.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    let size = u64::try_from(content.len()).unwrap_or(u64::MAX);
    if size > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {size} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit"
            ),
        });
    }

    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;
    use std::io::Write;

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_deserialize_to_default_config() {
        let config: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_without_files() {
        let resolved = load_with(&LoadOptions::default(), &no_env()).unwrap();
        assert_eq!(resolved.config, Config::default());
        assert!(resolved.loaded_files.is_empty());
        assert_eq!(
            resolved.field_sources.get("plugins.max_restarts"),
            Some(&ConfigLayer::Defaults)
        );
    }

    #[test]
    fn test_explicit_file_overrides_system() {
        let dir = tempfile::tempdir().unwrap();
        let system = write_file(
            dir.path(),
            "system.toml",
            "[plugins]\nmax_restarts = 4\nmax_crashes = 6\n",
        );
        let explicit = write_file(dir.path(), "explicit.toml", "[plugins]\nmax_restarts = 9\n");

        let options = LoadOptions {
            system_path: Some(system),
            explicit_path: Some(explicit),
        };
        let resolved = load_with(&options, &no_env()).unwrap();

        assert_eq!(resolved.config.plugins.max_restarts, 9);
        assert_eq!(resolved.config.plugins.max_crashes, 6);
        assert_eq!(resolved.loaded_files.len(), 2);
        assert_eq!(
            resolved.field_sources.get("plugins.max_crashes"),
            Some(&ConfigLayer::System)
        );
    }

    #[test]
    fn test_env_is_fallback_only() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = write_file(dir.path(), "c.toml", "[logging]\nlevel = \"warn\"\n");
        let env: HashMap<String, String> = [
            ("NEBULA_LOG_LEVEL".to_owned(), "trace".to_owned()),
            ("NEBULA_ENV".to_owned(), "production".to_owned()),
        ]
        .into_iter()
        .collect();

        let options = LoadOptions {
            system_path: None,
            explicit_path: Some(explicit),
        };
        let resolved = load_with(&options, &env).unwrap();

        assert_eq!(resolved.config.logging.level, "warn");
        assert_eq!(resolved.config.plugins.environment, Environment::Production);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let options = LoadOptions {
            system_path: None,
            explicit_path: Some(PathBuf::from("/nonexistent/nebula.toml")),
        };
        assert!(matches!(
            load_with(&options, &no_env()),
            Err(ConfigError::ReadError { .. })
        ));
    }

    #[test]
    fn test_missing_system_file_is_skipped() {
        let options = LoadOptions {
            system_path: Some(PathBuf::from("/nonexistent/plugins.toml")),
            explicit_path: None,
        };
        assert!(load_with(&options, &no_env()).is_ok());
    }

    #[test]
    fn test_oversized_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("# {}\n", "x".repeat(1_100_000));
        let path = write_file(dir.path(), "big.toml", &body);
        assert!(matches!(
            load_file(&path),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_malformed_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bad.toml", "[plugins\nmax_restarts = ");
        assert!(matches!(load_file(&path), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "typed.toml", "[plugins]\nmax_restarts = \"many\"\n");
        assert!(matches!(load_file(&path), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_loaded_values_are_normalised() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "n.toml",
            "[plugins]\nhealth_interval_secs = 1\ndefault_timeout_secs = 90.0\n",
        );
        let config = load_file(&path).unwrap();
        assert_eq!(config.plugins.health_interval_secs, 5);
        assert!((config.plugins.default_timeout_secs - 30.0).abs() < f64::EPSILON);
    }
}
