//! Plugin runtime manager for the Nebula host.
//!
//! Discovers plugins from a scan directory, runs each one as a supervised
//! worker and mediates every call the worker makes back into the host:
//!
//! - [`loader`]: `plugin.toml` discovery and validation into [`PluginDescriptor`]s
//! - [`arena`]: immutable descriptor snapshots, replaced whole on rescan
//! - [`supervisor`]: process and in-process workers, activation handshake, termination
//! - [`channel`]: request/response multiplexing over a worker's stdio
//! - [`cgroup`]: optional cgroup v2 confinement and OOM detection
//! - [`policy`] / [`state`]: the restart policy and the single actor that owns
//!   every [`RuntimeRecord`]
//! - [`bridge`]: the scope-checked host API a plugin sees
//! - [`manager`]: [`PluginManager`], which ties the above together and serves
//!   the host-facing operations
//!
//! # Failure isolation
//!
//! A failing plugin only ever changes its own record. Load errors reject one
//! directory, crashes and timeouts feed that plugin's restart budget, and no
//! per-plugin failure escapes the manager's control loop.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod arena;
pub mod bridge;
pub mod cgroup;
pub mod channel;
pub mod descriptor;
pub mod error;
pub mod loader;
pub mod manager;
mod monitor;
pub mod policy;
pub mod record;
mod slot;
pub mod state;
pub mod supervisor;

pub use arena::{ArenaDiff, DescriptorArena};
pub use bridge::{
    AllowList, DryRunGuard, HostDirectory, InMemoryDirectory, PinnedHost, ScopedContext,
};
pub use cgroup::{CgroupLimits, CgroupSettings, CgroupStatus};
pub use descriptor::{EntryPoint, PluginDescriptor, PluginKind, PluginManifest};
pub use error::{PluginError, PluginResult};
pub use loader::{LoaderPolicy, Rejection, ScanOutcome};
pub use manager::{
    HostServices, InvokeOptions, ManagerConfig, PluginAction, PluginInfo, PluginManager,
    PluginStats, RescanReport,
};
pub use policy::{CrashCause, RestartPolicy};
pub use record::{PluginStatus, RuntimeRecord};
pub use supervisor::{InProcessRegistry, PluginFactory};
