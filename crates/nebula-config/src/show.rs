//! Resolved configuration and its display.

use std::fmt::Write as _;

use crate::merge::{ConfigLayer, FieldSources};
use crate::types::Config;

/// Output format for [`ResolvedConfig::render`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShowFormat {
    /// TOML with a `# from <layer>` note on every non-default value.
    #[default]
    Toml,
    /// Pretty-printed JSON.
    Json,
}

/// A loaded configuration together with where each value came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The merged configuration.
    pub config: Config,
    /// Layer that set each field.
    pub field_sources: FieldSources,
    /// Files merged, in order.
    pub loaded_files: Vec<String>,
}

impl ResolvedConfig {
    /// Layer that set `field` (dotted path), if recorded.
    #[must_use]
    pub fn source_of(&self, field: &str) -> Option<ConfigLayer> {
        self.field_sources.get(field).copied()
    }

    /// Render for `config show`.
    ///
    /// # Errors
    ///
    /// Returns a message if serialization fails.
    pub fn render(&self, format: ShowFormat) -> Result<String, String> {
        match format {
            ShowFormat::Json => {
                serde_json::to_string_pretty(&self.config).map_err(|e| e.to_string())
            },
            ShowFormat::Toml => self.render_toml(),
        }
    }

    fn render_toml(&self) -> Result<String, String> {
        let tree = toml::Value::try_from(&self.config).map_err(|e| e.to_string())?;
        let mut out = String::new();
        for file in &self.loaded_files {
            let _ = writeln!(out, "# loaded: {file}");
        }
        let toml::Value::Table(sections) = tree else {
            return Err("configuration did not serialize to a table".to_owned());
        };
        for (section, body) in &sections {
            let _ = writeln!(out, "\n[{section}]");
            let toml::Value::Table(fields) = body else {
                continue;
            };
            for (key, value) in fields {
                let path = format!("{section}.{key}");
                let _ = write!(out, "{key} = {value}");
                match self.source_of(&path) {
                    Some(ConfigLayer::Defaults) | None => out.push('\n'),
                    Some(layer) => {
                        let _ = writeln!(out, "  # from {layer}");
                    },
                }
            }
        }
        Ok(out)
    }
}
