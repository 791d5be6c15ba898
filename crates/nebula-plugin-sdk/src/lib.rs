//! Nebula Plugin SDK - the worker side of the plugin runtime.
//!
//! A worker binary implements [`WorkerPlugin`] and hands it to [`run`],
//! which checks the environment, installs logging on stderr and serves the
//! stdio protocol until the host asks it to stop.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use nebula_plugin_sdk::{SampleSync, run};
//!
//! fn main() -> std::process::ExitCode {
//!     run(Arc::new(SampleSync::new()))
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod client;
pub mod env;
pub mod error;
pub mod sample_sync;
pub mod serve;

use std::process::ExitCode;
use std::sync::Arc;

pub use client::{HOST_CALL_TIMEOUT, HostClient};
pub use env::{ALLOW_ROOT_VAR, WorkerEnv};
pub use error::{SdkError, SdkResult};
pub use nebula_core::{HostCalls, RemoteError, WorkerPlugin};
pub use sample_sync::SampleSync;
pub use serve::{serve, serve_io};

/// Set up and serve a worker on a single-threaded runtime.
///
/// Failures are logged to stderr, which the supervisor captures into the
/// plugin log, and turned into a non-zero exit code.
#[must_use]
pub fn run(plugin: Arc<dyn WorkerPlugin>) -> ExitCode {
    match try_run(plugin) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker exiting");
            eprintln!("nebula worker: {e}");
            ExitCode::FAILURE
        },
    }
}

fn try_run(plugin: Arc<dyn WorkerPlugin>) -> SdkResult<()> {
    let env = WorkerEnv::from_env()?;
    env.check_privileges()?;
    nebula_telemetry::setup_logging(&nebula_telemetry::LogConfig::for_worker(&env.log_level))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    tracing::info!(
        plugin = %env.plugin,
        api_version = %env.api_version,
        memory_mb = ?env.memory_mb,
        "worker starting"
    );
    runtime.block_on(serve(plugin))?;
    tracing::info!(plugin = %env.plugin, "worker stopped");
    Ok(())
}
