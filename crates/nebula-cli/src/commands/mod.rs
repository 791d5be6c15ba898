//! CLI command implementations.

pub(crate) mod config;
pub(crate) mod plugins;

/// How results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    /// Coloured, human-readable.
    Pretty,
    /// One JSON document on stdout.
    Json,
}
