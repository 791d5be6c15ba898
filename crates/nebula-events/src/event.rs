//! Plugin event type and the sink seam.

use chrono::{DateTime, Utc};
use nebula_core::PluginName;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EventError, EventResult};

/// Longest accepted local event name.
const MAX_EVENT_NAME_LEN: usize = 128;

/// An event emitted by a plugin, already namespaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Fully qualified name, `plugin.{plugin}.{event}`.
    pub name: String,
    /// Emitting plugin.
    pub plugin: PluginName,
    /// Arbitrary payload.
    pub payload: Value,
    /// When the host accepted the event.
    pub timestamp: DateTime<Utc>,
}

impl PluginEvent {
    /// Build an event, prefixing `event` with the plugin namespace.
    #[must_use]
    pub fn new(plugin: &PluginName, event: &str, payload: Value) -> Self {
        Self {
            name: format!("plugin.{plugin}.{event}"),
            plugin: plugin.clone(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Validate a plugin-local event name.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidName`] for empty, oversized, or
    /// non-printable names.
    pub fn validate_local_name(event: &str) -> EventResult<()> {
        let invalid = |reason: &str| EventError::InvalidName {
            name: event.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = event.trim();
        if trimmed.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if trimmed.len() > MAX_EVENT_NAME_LEN {
            return Err(invalid("too long"));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid("may only contain ASCII letters, digits, '.', '_' and '-'"));
        }
        Ok(())
    }

    /// The local part of the name, without the `plugin.{name}.` prefix.
    #[must_use]
    pub fn local_name(&self) -> &str {
        let prefix_len = "plugin."
            .len()
            .saturating_add(self.plugin.as_str().len())
            .saturating_add(1);
        self.name.get(prefix_len..).unwrap_or(&self.name)
    }
}

/// Destination for plugin events.
pub trait EventSink: Send + Sync {
    /// Deliver an event. Returns the number of receivers reached.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Unavailable`] if the sink is shut down.
    fn emit(&self, event: PluginEvent) -> EventResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespacing() {
        let plugin = PluginName::new("sample_sync").unwrap();
        let event = PluginEvent::new(&plugin, "sync.finished", json!({"count": 2}));
        assert_eq!(event.name, "plugin.sample_sync.sync.finished");
        assert_eq!(event.local_name(), "sync.finished");
    }

    #[test]
    fn test_same_local_name_does_not_collide() {
        let a = PluginName::new("alpha").unwrap();
        let b = PluginName::new("beta").unwrap();
        let ea = PluginEvent::new(&a, "done", Value::Null);
        let eb = PluginEvent::new(&b, "done", Value::Null);
        assert_ne!(ea.name, eb.name);
    }

    #[test]
    fn test_validate_local_name() {
        assert!(PluginEvent::validate_local_name("sync.started").is_ok());
        assert!(PluginEvent::validate_local_name("").is_err());
        assert!(PluginEvent::validate_local_name("   ").is_err());
        assert!(PluginEvent::validate_local_name("a b").is_err());
        assert!(PluginEvent::validate_local_name(&"x".repeat(129)).is_err());
    }
}
