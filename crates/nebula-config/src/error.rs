//! Configuration error types.

use std::io;

use thiserror::Error;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[error("failed to read config file at {path}: {source}")]
    ReadError {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A configuration file is not valid TOML or does not match the schema.
    #[error("failed to parse config at {path}: {source}")]
    ParseError {
        /// Path of the file, or a marker such as `<merged config>`.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range or inconsistent.
    #[error("validation error in field '{field}': {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong.
        message: String,
    },

    /// An environment variable holds an unusable value.
    #[error("environment variable '{var_name}': {message}")]
    EnvError {
        /// Variable name.
        var_name: String,
        /// What is wrong.
        message: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
