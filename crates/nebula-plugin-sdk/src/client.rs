//! Worker side of `host.*` calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nebula_core::protocol::codes;
use nebula_core::{Frame, HostCalls, RemoteError};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// How long a host call may take before the worker gives up on it.
pub const HOST_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type Waiter = oneshot::Sender<Result<Value, RemoteError>>;

/// Sends requests to the host over the worker's stdout and matches the
/// responses the serve loop hands back.
#[derive(Debug)]
pub struct HostClient {
    outbound: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    timeout: Duration,
}

impl HostClient {
    /// Client writing into `outbound`.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self::with_timeout(outbound, HOST_CALL_TIMEOUT)
    }

    /// Client with a custom per-call timeout.
    #[must_use]
    pub fn with_timeout(outbound: mpsc::Sender<Frame>, timeout: Duration) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            timeout,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a response from the host.
    pub(crate) fn resolve(&self, id: u64, outcome: Result<Value, RemoteError>) {
        match self.pending().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            },
            None => debug!(id, "response for an abandoned host call"),
        }
    }

    /// Fail every outstanding call; later calls fail immediately.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending().clear();
    }

    /// Host calls awaiting a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }
}

fn disconnected() -> RemoteError {
    RemoteError::new(codes::UNAVAILABLE, "host connection closed")
}

#[async_trait]
impl HostCalls for HostClient {
    async fn host_call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(disconnected());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, response) = oneshot::channel();
        self.pending().insert(id, waiter);

        trace!(id, method, "host call");
        let frame = Frame::Request {
            id,
            method: method.to_string(),
            params,
        };
        if self.outbound.send(frame).await.is_err() {
            self.pending().remove(&id);
            return Err(disconnected());
        }

        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_dropped)) => Err(disconnected()),
            Err(_elapsed) => {
                self.pending().remove(&id);
                let _ = self.outbound.try_send(Frame::Cancel { id });
                Err(RemoteError::new(
                    codes::UNAVAILABLE,
                    format!("host call {method} timed out after {:?}", self.timeout),
                ))
            },
        }
    }
}
