//! Plugin names.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Minimum length of a plugin name.
const MIN_NAME_LEN: usize = 2;
/// Maximum length of a plugin name.
const MAX_NAME_LEN: usize = 64;

/// Unique, stable plugin key.
///
/// Names are 2 to 64 ASCII characters: a leading letter or digit followed by
/// letters, digits, `_` or `-`. The name doubles as a path component (log
/// file, cgroup directory), so the rules are strict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PluginName(String);

/// Deserialize with validation so crafted manifests or frames cannot smuggle
/// path separators into a name.
impl<'de> Deserialize<'de> for PluginName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginName {
    /// Create a new `PluginName`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidName`] if the name breaks the naming rules.
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a string is a valid plugin name.
    #[must_use]
    pub fn is_valid(name: &str) -> bool {
        Self::validate(name).is_ok()
    }

    fn validate(name: &str) -> CoreResult<()> {
        let invalid = |reason: &str| CoreError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.len() < MIN_NAME_LEN || name.len() > MAX_NAME_LEN {
            return Err(invalid("must be between 2 and 64 characters"));
        }
        let mut chars = name.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("must start with a letter or digit"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(invalid(
                "may only contain ASCII letters, digits, '_' and '-'",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PluginName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for PluginName {
    type Error = CoreError;

    fn try_from(value: &str) -> CoreResult<Self> {
        Self::new(value)
    }
}
