//! Nebula Telemetry - logging setup for the plugin runtime.
//!
//! The host and every worker process install a `tracing` subscriber through
//! [`setup_logging`]. Workers log to stderr, which the supervisor redirects
//! into the per-plugin log file.
//!
//! # Example
//!
//! ```rust,no_run
//! use nebula_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), nebula_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("nebula_plugins=trace");
//!
//! setup_logging(&config)?;
//! tracing::info!("manager starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_logging};
