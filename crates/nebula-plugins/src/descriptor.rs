//! Plugin manifests and the descriptors built from them.
//!
//! A plugin lives in `<scan_path>/<name>/plugin.toml`:
//!
//! ```toml
//! version = "1.2.0"
//! description = "Reconciles users from an external directory"
//! scopes = ["users.read", "users.write"]
//!
//! [entry]
//! type = "process"
//! command = "bin/sample-sync"
//! args = ["--quiet"]
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use nebula_core::{PLUGIN_API_VERSION, PluginName, ScopeSet};
use serde::{Deserialize, Serialize};

/// File name of a plugin manifest inside its directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Warning attached to every loaded in-process plugin.
pub const IN_PROCESS_WARNING: &str = "DEV ONLY: in-process plugins are forbidden in production";

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_api_version() -> String {
    PLUGIN_API_VERSION.to_string()
}

/// The raw `plugin.toml` contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Optional name; must equal the directory name when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Semantic version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Worker API version.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Requested scope tokens.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// How the plugin runs.
    pub entry: EntryPoint,
}

/// Entry point as written in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPoint {
    /// A separate worker process speaking the stdio protocol.
    Process {
        /// Executable; relative paths resolve against the plugin directory.
        command: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// A factory compiled into the host. Development only.
    InProcess {
        /// Registered factory name.
        factory: String,
    },
}

/// How a loaded plugin is run, with its command already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginKind {
    /// Separate worker process.
    Process {
        /// Absolute path to the executable.
        command: PathBuf,
        /// Arguments.
        args: Vec<String>,
        /// Extra environment variables.
        env: BTreeMap<String, String>,
    },
    /// Legacy in-process plugin.
    InProcess {
        /// Registered factory name.
        factory: String,
    },
}

impl PluginKind {
    /// Short label used in listings.
    #[must_use]
    pub fn source(&self) -> &'static str {
        match self {
            Self::Process { .. } => "process",
            Self::InProcess { .. } => "in_process",
        }
    }
}

/// A validated plugin, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// Unique key, equal to the directory name.
    pub name: PluginName,
    /// Plugin version.
    pub version: semver::Version,
    /// Worker API version.
    pub api_version: String,
    /// Human description.
    pub description: String,
    /// Declared scopes.
    pub scopes: ScopeSet,
    /// Entry point.
    pub kind: PluginKind,
    /// Plugin directory.
    pub dir: PathBuf,
    /// Load-time warning, e.g. for in-process plugins.
    pub warning: Option<String>,
}

impl PluginDescriptor {
    /// Short label for the entry kind.
    #[must_use]
    pub fn source(&self) -> &'static str {
        self.kind.source()
    }

    /// Hash over everything whose change requires a worker restart.
    ///
    /// The description and warning are left out: editing them replaces the
    /// descriptor but keeps the worker running.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.version.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.api_version.as_bytes());
        hasher.update(b"\0");
        for scope in self.scopes.iter() {
            hasher.update(scope.as_str().as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"\0");
        let kind = serde_json::to_vec(&self.kind).unwrap_or_default();
        hasher.update(&kind);
        hasher.finalize().to_hex().to_string()
    }

    /// Whether this is the development-only in-process kind.
    #[must_use]
    pub fn is_in_process(&self) -> bool {
        matches!(self.kind, PluginKind::InProcess { .. })
    }
}
