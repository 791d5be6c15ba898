//! Descriptor loader.
//!
//! [`scan`] reads every `<dir>/<name>/plugin.toml` independently. A broken
//! plugin becomes a [`Rejection`] and never aborts the scan of its siblings.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use nebula_core::{PLUGIN_API_VERSION, PluginName, ScopeSet};
use serde::Serialize;
use tracing::{debug, warn};

use crate::descriptor::{
    EntryPoint, IN_PROCESS_WARNING, MANIFEST_FILE, PluginDescriptor, PluginKind, PluginManifest,
};
use crate::error::{PluginError, PluginResult};

/// Largest accepted manifest.
const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// What the loader may accept beyond the manifest itself.
#[derive(Debug, Clone, Default)]
pub struct LoaderPolicy {
    /// Whether the in-process kind is loadable at all.
    pub allow_in_process: bool,
    /// Registered in-process factory names.
    pub factories: BTreeSet<String>,
}

/// A plugin the loader refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Directory name of the rejected plugin.
    pub name: String,
    /// Why it was refused.
    pub reason: String,
}

/// Result of one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Plugins that loaded, sorted by name.
    pub valid: Vec<PluginDescriptor>,
    /// Plugins that did not.
    pub rejected: Vec<Rejection>,
}

/// Scan `dir` for plugins.
///
/// A missing scan directory yields an empty outcome.
#[must_use]
pub fn scan(dir: &Path, policy: &LoaderPolicy) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "plugin directory unreadable, nothing to load");
            return outcome;
        },
    };

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    candidates.sort();

    for plugin_dir in candidates {
        if !plugin_dir.join(MANIFEST_FILE).is_file() {
            debug!(dir = %plugin_dir.display(), "no manifest, skipping");
            continue;
        }
        let key = plugin_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match load_descriptor(&plugin_dir, policy) {
            Ok(descriptor) => {
                debug!(plugin = %descriptor.name, version = %descriptor.version, "plugin loaded");
                outcome.valid.push(descriptor);
            },
            Err(e) => {
                let reason = match e {
                    PluginError::Load { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(plugin = %key, reason = %reason, "plugin rejected");
                outcome.rejected.push(Rejection { name: key, reason });
            },
        }
    }

    outcome
}

/// Load one plugin directory.
///
/// # Errors
///
/// Returns [`PluginError::Load`] with a human-readable reason.
pub fn load_descriptor(plugin_dir: &Path, policy: &LoaderPolicy) -> PluginResult<PluginDescriptor> {
    let key = plugin_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let reject = |reason: String| PluginError::load(key.clone(), reason);

    let name = PluginName::new(key.clone()).map_err(|e| reject(e.to_string()))?;

    let manifest_path = plugin_dir.join(MANIFEST_FILE);
    let unreadable = |e: std::io::Error| reject(format!("cannot read {}: {e}", manifest_path.display()));
    let size = std::fs::metadata(&manifest_path).map_err(unreadable)?.len();
    if size > MAX_MANIFEST_BYTES {
        return Err(reject(format!(
            "manifest is {size} bytes, exceeding the {MAX_MANIFEST_BYTES} byte limit"
        )));
    }
    let raw = std::fs::read_to_string(&manifest_path).map_err(unreadable)?;
    let manifest: PluginManifest =
        toml::from_str(&raw).map_err(|e| reject(format!("invalid manifest: {e}")))?;

    if let Some(declared) = &manifest.name
        && declared != name.as_str()
    {
        return Err(reject(format!(
            "name mismatch: manifest says '{declared}', directory is '{name}'"
        )));
    }

    let version = semver::Version::parse(manifest.version.trim())
        .map_err(|e| reject(format!("invalid version '{}': {e}", manifest.version)))?;

    if manifest.api_version != PLUGIN_API_VERSION {
        return Err(reject(format!(
            "version mismatch: api_version '{}' is not supported (expected {PLUGIN_API_VERSION})",
            manifest.api_version
        )));
    }

    let scopes = ScopeSet::parse(&manifest.scopes).map_err(|e| reject(e.to_string()))?;

    let (kind, warning) = match manifest.entry {
        EntryPoint::Process { command, args, env } => {
            let command = resolve_command(plugin_dir, &command).map_err(reject)?;
            (PluginKind::Process { command, args, env }, None)
        },
        EntryPoint::InProcess { factory } => {
            if !policy.allow_in_process {
                return Err(reject(
                    "in-process plugins are disabled outside development".to_string(),
                ));
            }
            if !policy.factories.contains(&factory) {
                return Err(reject(format!("missing entry factory '{factory}'")));
            }
            (
                PluginKind::InProcess { factory },
                Some(IN_PROCESS_WARNING.to_string()),
            )
        },
    };

    Ok(PluginDescriptor {
        name,
        version,
        api_version: manifest.api_version,
        description: manifest.description.trim().to_string(),
        scopes,
        kind,
        dir: plugin_dir.to_path_buf(),
        warning,
    })
}

/// Resolve an entry command: plugin-relative file first, then `PATH`.
fn resolve_command(plugin_dir: &Path, command: &str) -> Result<PathBuf, String> {
    let command = command.trim();
    if command.is_empty() {
        return Err("missing entry command".to_string());
    }

    let candidate = Path::new(command);
    if candidate.is_absolute() {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(format!("command not found: {command}"))
        };
    }

    let local = plugin_dir.join(candidate);
    if local.is_file() {
        return Ok(local);
    }
    if command.contains('/') {
        return Err(format!("command not found: {}", local.display()));
    }

    which::which(command).map_err(|_| format!("command not found: {command}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_core::Scope;

    fn write_plugin(root: &Path, name: &str, manifest: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        dir
    }

    fn process_manifest(scopes: &str) -> String {
        format!(
            "version = \"1.0.0\"\nscopes = [{scopes}]\n[entry]\ntype = \"process\"\ncommand = \"/bin/sh\"\n"
        )
    }

    fn dev_policy() -> LoaderPolicy {
        LoaderPolicy {
            allow_in_process: true,
            factories: ["sample_sync".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_scan_loads_valid_plugin() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "sample_sync",
            &process_manifest("\"users.read\", \"users.write\""),
        );

        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert!(outcome.rejected.is_empty());
        assert_eq!(outcome.valid.len(), 1);
        let d = &outcome.valid[0];
        assert_eq!(d.name.as_str(), "sample_sync");
        assert_eq!(d.version, semver::Version::new(1, 0, 0));
        assert!(d.scopes.contains(Scope::UsersWrite));
        assert_eq!(d.source(), "process");
        assert!(d.warning.is_none());
    }

    #[test]
    fn test_one_bad_plugin_does_not_abort_scan() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(root.path(), "good", &process_manifest("\"users.read\""));
        write_plugin(root.path(), "bad", &process_manifest("\"root.everything\""));
        write_plugin(root.path(), "broken", "this is [not toml");

        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.valid[0].name.as_str(), "good");
        assert_eq!(outcome.rejected.len(), 2);

        let bad = outcome.rejected.iter().find(|r| r.name == "bad").unwrap();
        assert!(bad.reason.contains("unknown scope"), "{}", bad.reason);
        let broken = outcome.rejected.iter().find(|r| r.name == "broken").unwrap();
        assert!(broken.reason.contains("invalid manifest"), "{}", broken.reason);
    }

    #[test]
    fn test_directory_without_manifest_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("notes")).unwrap();
        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert!(outcome.valid.is_empty());
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_missing_scan_dir_is_empty() {
        let outcome = scan(Path::new("/nonexistent/nebula-plugins"), &LoaderPolicy::default());
        assert!(outcome.valid.is_empty());
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_api_version_mismatch() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "future",
            "api_version = \"v2\"\n[entry]\ntype = \"process\"\ncommand = \"/bin/sh\"\n",
        );
        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert!(outcome.rejected[0].reason.starts_with("version mismatch"));
    }

    #[test]
    fn test_invalid_semver() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "sloppy",
            "version = \"one\"\n[entry]\ntype = \"process\"\ncommand = \"/bin/sh\"\n",
        );
        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert!(outcome.rejected[0].reason.starts_with("invalid version"));
    }

    #[test]
    fn test_oversized_manifest_rejected_by_size() {
        let root = tempfile::tempdir().unwrap();
        let padding = format!("# {}\n", "x".repeat(70 * 1024));
        write_plugin(root.path(), "bloated", &(padding + &process_manifest("")));
        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert!(outcome.valid.is_empty());
        assert!(
            outcome.rejected[0].reason.contains("byte limit"),
            "{}",
            outcome.rejected[0].reason
        );
    }

    #[test]
    fn test_name_mismatch_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "alpha",
            "name = \"beta\"\n[entry]\ntype = \"process\"\ncommand = \"/bin/sh\"\n",
        );
        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert!(outcome.rejected[0].reason.starts_with("name mismatch"));
    }

    #[test]
    fn test_invalid_directory_name_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(root.path(), "x", &process_manifest(""));
        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.rejected[0].reason.contains("invalid plugin name"));
    }

    #[test]
    fn test_relative_command_resolves_in_plugin_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(
            root.path(),
            "local",
            "[entry]\ntype = \"process\"\ncommand = \"bin/worker\"\n",
        );
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        std::fs::write(dir.join("bin/worker"), "#!/bin/sh\n").unwrap();

        let outcome = scan(root.path(), &LoaderPolicy::default());
        let PluginKind::Process { command, .. } = &outcome.valid[0].kind else {
            panic!("expected process kind");
        };
        assert_eq!(command, &dir.join("bin/worker"));
    }

    #[test]
    fn test_missing_command_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "ghost",
            "[entry]\ntype = \"process\"\ncommand = \"bin/nope\"\n",
        );
        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert!(outcome.rejected[0].reason.starts_with("command not found"));
    }

    #[test]
    fn test_in_process_rejected_outside_development() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "legacy",
            "[entry]\ntype = \"in_process\"\nfactory = \"sample_sync\"\n",
        );
        let outcome = scan(root.path(), &LoaderPolicy::default());
        assert_eq!(
            outcome.rejected[0].reason,
            "in-process plugins are disabled outside development"
        );
    }

    #[test]
    fn test_in_process_requires_registered_factory() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "legacy",
            "[entry]\ntype = \"in_process\"\nfactory = \"unknown\"\n",
        );
        let outcome = scan(root.path(), &dev_policy());
        assert!(outcome.rejected[0].reason.starts_with("missing entry factory"));
    }

    #[test]
    fn test_in_process_carries_dev_warning() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "legacy",
            "[entry]\ntype = \"in_process\"\nfactory = \"sample_sync\"\n",
        );
        let outcome = scan(root.path(), &dev_policy());
        let d = &outcome.valid[0];
        assert!(d.is_in_process());
        assert_eq!(d.warning.as_deref(), Some(IN_PROCESS_WARNING));
    }
}
