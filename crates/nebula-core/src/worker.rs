//! The plugin-side contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::RemoteError;

/// Outbound calls a plugin makes into the host.
///
/// Out-of-process workers implement this over their stdio channel; the
/// in-process kind is handed the host's scoped bridge directly. Either way
/// every call lands on the same scope checks.
#[async_trait]
pub trait HostCalls: Send + Sync {
    /// Invoke a `host.*` method.
    async fn host_call(&self, method: &str, params: Value) -> Result<Value, RemoteError>;
}

/// A plugin implementation.
///
/// `health` must stay cheap: it is polled on a fixed interval and during the
/// activation handshake.
#[async_trait]
pub trait WorkerPlugin: Send + Sync {
    /// Called once before the first request is served.
    async fn initialize(&self, host: &dyn HostCalls) -> Result<(), RemoteError> {
        let _ = host;
        Ok(())
    }

    /// Report liveness and any plugin-specific status fields.
    async fn health(&self) -> Result<Value, RemoteError>;

    /// Handle a plugin method such as `sync_users`.
    async fn handle(
        &self,
        method: &str,
        params: Value,
        host: &dyn HostCalls,
    ) -> Result<Value, RemoteError>;

    /// Release resources before the worker exits.
    async fn shutdown(&self) {}
}
