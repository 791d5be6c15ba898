#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Layered configuration for the Nebula plugin runtime.
//!
//! # Usage
//!
//! ```rust,no_run
//! use nebula_config::Config;
//!
//! let resolved = Config::load(None).unwrap();
//! println!("scanning {}", resolved.config.plugins.scan_path.display());
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Explicit file** (`--config FILE`)
//! 2. **System** (`/etc/nebula/plugins.toml`)
//! 3. **Environment variables** (`NEBULA_*`), fallback only
//! 4. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! This crate depends on no other Nebula crate. Conversion into runtime types
//! (durations, scope sets) happens where the configuration is consumed.

/// Environment variable fallbacks.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Layered merging of TOML trees.
pub mod merge;
/// Resolved configuration display.
pub mod show;
/// Configuration struct definitions.
pub mod types;
/// Normalisation and validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::LoadOptions;
pub use merge::ConfigLayer;
pub use show::{ResolvedConfig, ShowFormat};
pub use types::*;

impl Config {
    /// Load with the standard precedence chain and the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any layer is malformed or the result
    /// fails validation.
    pub fn load(explicit_path: Option<&std::path::Path>) -> ConfigResult<ResolvedConfig> {
        loader::load_with(
            &LoadOptions::standard(explicit_path),
            &env::collect_env_vars(),
        )
    }
}
