//! Generational descriptor arena.
//!
//! The manager keeps the current arena behind an `Arc` and swaps in a
//! successor on every rescan. Tasks that cloned a descriptor keep a valid
//! handle across the swap.

use std::collections::BTreeMap;
use std::sync::Arc;

use nebula_core::PluginName;

use crate::descriptor::PluginDescriptor;

/// One arena slot.
#[derive(Debug, Clone)]
pub struct ArenaEntry {
    /// The descriptor.
    pub descriptor: Arc<PluginDescriptor>,
    /// Arena generation in which this descriptor's fingerprint first appeared.
    pub generation: u64,
    fingerprint: String,
}

/// How each plugin changed between two arenas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaDiff {
    /// New plugins.
    pub added: Vec<PluginName>,
    /// Plugins no longer present.
    pub removed: Vec<PluginName>,
    /// Plugins whose version, scopes or entry changed.
    pub changed: Vec<PluginName>,
    /// Plugins that need no restart.
    pub unchanged: Vec<PluginName>,
}

impl ArenaDiff {
    /// Whether nothing was added, removed or changed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Descriptors keyed by plugin name.
#[derive(Debug, Clone, Default)]
pub struct DescriptorArena {
    generation: u64,
    entries: BTreeMap<PluginName, ArenaEntry>,
}

impl DescriptorArena {
    /// An empty arena at generation zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of this snapshot.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Descriptor for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<PluginDescriptor>> {
        self.entries.get(name).map(|e| &e.descriptor)
    }

    /// Full slot for `name`.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&ArenaEntry> {
        self.entries.get(name)
    }

    /// Iterate slots in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&PluginName, &ArenaEntry)> {
        self.entries.iter()
    }

    /// Number of descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the next generation from a fresh scan.
    ///
    /// Unchanged plugins keep their slot generation, so the diff of two
    /// identical scans is a no-op.
    #[must_use]
    pub fn successor(&self, descriptors: Vec<PluginDescriptor>) -> (Self, ArenaDiff) {
        let generation = self.generation.saturating_add(1);
        let mut entries = BTreeMap::new();
        let mut diff = ArenaDiff::default();

        for descriptor in descriptors {
            let name = descriptor.name.clone();
            let fingerprint = descriptor.fingerprint();
            let entry = match self.entries.get(&name) {
                Some(old) if old.fingerprint == fingerprint => {
                    diff.unchanged.push(name.clone());
                    let descriptor = if *old.descriptor == descriptor {
                        Arc::clone(&old.descriptor)
                    } else {
                        Arc::new(descriptor)
                    };
                    ArenaEntry {
                        descriptor,
                        generation: old.generation,
                        fingerprint,
                    }
                },
                Some(_) => {
                    diff.changed.push(name.clone());
                    ArenaEntry {
                        descriptor: Arc::new(descriptor),
                        generation,
                        fingerprint,
                    }
                },
                None => {
                    diff.added.push(name.clone());
                    ArenaEntry {
                        descriptor: Arc::new(descriptor),
                        generation,
                        fingerprint,
                    }
                },
            };
            entries.insert(name, entry);
        }

        diff.removed = self
            .entries
            .keys()
            .filter(|name| !entries.contains_key(name.as_str()))
            .cloned()
            .collect();

        (
            Self {
                generation,
                entries,
            },
            diff,
        )
    }
}
