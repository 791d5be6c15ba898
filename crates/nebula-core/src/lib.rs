//! Nebula Core - shared vocabulary for the Nebula plugin runtime.
//!
//! This crate is used by both sides of the worker boundary:
//!
//! - [`PluginName`]: validated, stable plugin key
//! - [`Scope`] / [`ScopeSet`]: capability tokens from a fixed universe
//! - [`protocol`]: newline-delimited JSON frames spoken over worker stdio
//! - [`host`]: typed requests for the host calls a plugin may make
//! - [`WorkerPlugin`] / [`HostCalls`]: the plugin-side contract, shared by
//!   out-of-process workers and the legacy in-process kind
//!
//! It has no dependency on the manager or on any async runtime.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod host;
pub mod name;
pub mod protocol;
pub mod scope;
pub mod worker;

pub use error::{CoreError, CoreResult};
pub use name::PluginName;
pub use protocol::{Frame, RemoteError};
pub use scope::{Scope, ScopeSet};
pub use worker::{HostCalls, WorkerPlugin};

/// The only plugin API version this runtime speaks.
pub const PLUGIN_API_VERSION: &str = "v1";
