//! Capability scopes.
//!
//! A [`Scope`] names one host-side capability. A plugin declares the scopes it
//! wants; the host keeps an allow-list; the grant is always the intersection.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A capability token from the fixed scope universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    /// Read users.
    #[serde(rename = "users.read")]
    UsersRead,
    /// Create and update users.
    #[serde(rename = "users.write")]
    UsersWrite,
    /// Read identity roles.
    #[serde(rename = "roles.read")]
    RolesRead,
    /// Create and update identity roles.
    #[serde(rename = "roles.write")]
    RolesWrite,
    /// Read identity tags.
    #[serde(rename = "identity_tags.read")]
    IdentityTagsRead,
    /// Assign identity tags.
    #[serde(rename = "identity_tags.write")]
    IdentityTagsWrite,
    /// Emit events onto the host event sink.
    #[serde(rename = "events.emit")]
    EventsEmit,
}

impl Scope {
    /// Every scope, in declaration order.
    pub const ALL: [Scope; 7] = [
        Scope::UsersRead,
        Scope::UsersWrite,
        Scope::RolesRead,
        Scope::RolesWrite,
        Scope::IdentityTagsRead,
        Scope::IdentityTagsWrite,
        Scope::EventsEmit,
    ];

    /// The wire token for this scope.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UsersRead => "users.read",
            Self::UsersWrite => "users.write",
            Self::RolesRead => "roles.read",
            Self::RolesWrite => "roles.write",
            Self::IdentityTagsRead => "identity_tags.read",
            Self::IdentityTagsWrite => "identity_tags.write",
            Self::EventsEmit => "events.emit",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| CoreError::UnknownScope(s.to_string()))
    }
}

/// An ordered set of scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<Scope>);

impl ScopeSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The full scope universe.
    #[must_use]
    pub fn all() -> Self {
        Scope::ALL.into_iter().collect()
    }

    /// Parse scope tokens, failing on the first unknown one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownScope`] for a token outside the universe.
    pub fn parse<I, S>(tokens: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tokens
            .into_iter()
            .map(|t| t.as_ref().trim().parse::<Scope>())
            .collect()
    }

    /// Whether the set grants `scope`.
    #[must_use]
    pub fn contains(&self, scope: Scope) -> bool {
        self.0.contains(&scope)
    }

    /// Whether every scope in `other` is granted by this set.
    #[must_use]
    pub fn is_superset(&self, other: &ScopeSet) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Scopes present in both sets.
    #[must_use]
    pub fn intersection(&self, other: &ScopeSet) -> ScopeSet {
        ScopeSet(self.0.intersection(&other.0).copied().collect())
    }

    /// Add a scope. Returns `true` if it was not already present.
    pub fn insert(&mut self, scope: Scope) -> bool {
        self.0.insert(scope)
    }

    /// Remove a scope. Returns `true` if it was present.
    pub fn remove(&mut self, scope: Scope) -> bool {
        self.0.remove(&scope)
    }

    /// Number of scopes in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate scopes in order.
    pub fn iter(&self) -> impl Iterator<Item = Scope> + '_ {
        self.0.iter().copied()
    }

    /// Wire tokens for every scope, in order.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|s| s.as_str().to_string()).collect()
    }
}

impl FromIterator<Scope> for ScopeSet {
    fn from_iter<T: IntoIterator<Item = Scope>>(iter: T) -> Self {
        ScopeSet(iter.into_iter().collect())
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, scope) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(scope.as_str())?;
        }
        f.write_str("}")
    }
}
