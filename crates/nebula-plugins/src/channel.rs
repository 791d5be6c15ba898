//! Bidirectional request/response channel over a worker's stdio.
//!
//! The host writes frames to the worker's stdin and reads its stdout. Host
//! calls are correlated by id; requests the worker sends back (`host.*`) are
//! answered by the plugin's [`ScopedContext`], pinned to the dry-run mode in
//! force when the request line was read.
//!
//! A call that exceeds its timeout is abandoned: its waiter is dropped and a
//! `cancel` frame is sent. The worker stays up. An abandoned dry-run call
//! keeps its [`DryRunGuard`] until the worker answers that id or the channel
//! closes, so writes it still makes are reported, not performed.
//!
//! Lines longer than [`MAX_FRAME_BYTES`] are dropped before their id can be
//! read. A call whose response is dropped this way ends as a timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use nebula_core::protocol::{MAX_FRAME_BYTES, RemoteError, methods};
use nebula_core::{Frame, HostCalls, PluginName};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bridge::{DryRunGuard, ScopedContext};
use crate::error::{PluginError, PluginResult};

/// Frames queued for the writer before senders wait.
const OUTBOUND_CAPACITY: usize = 256;

type Waiter = oneshot::Sender<Result<Value, RemoteError>>;
type PendingCalls = Mutex<HashMap<u64, Waiter>>;
type HeldCalls = Mutex<HashMap<u64, DryRunGuard>>;

/// Host side of a worker's stdio protocol.
pub struct CallChannel {
    plugin: PluginName,
    outbound: mpsc::Sender<Frame>,
    pending: Arc<PendingCalls>,
    abandoned: Arc<HeldCalls>,
    next_id: AtomicU64,
    cancelled: AtomicBool,
    closed: CancellationToken,
}

impl std::fmt::Debug for CallChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallChannel")
            .field("plugin", &self.plugin)
            .field("closed", &self.closed.is_cancelled())
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn lock<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallChannel {
    /// Start the reader and writer tasks.
    pub fn spawn<R, W>(
        plugin: PluginName,
        reader: R,
        writer: W,
        inbound: Arc<ScopedContext>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let pending: Arc<PendingCalls> = Arc::new(Mutex::new(HashMap::new()));
        let abandoned: Arc<HeldCalls> = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(
            plugin.clone(),
            writer,
            outbound_rx,
            closed.clone(),
        ));
        tokio::spawn(read_loop(ReadLoop {
            plugin: plugin.clone(),
            responses: outbound.clone(),
            pending: Arc::clone(&pending),
            abandoned: Arc::clone(&abandoned),
            inbound,
            closed: closed.clone(),
        }, reader));

        Arc::new(Self {
            plugin,
            outbound,
            pending,
            abandoned,
            next_id: AtomicU64::new(1),
            cancelled: AtomicBool::new(false),
            closed,
        })
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        lock(&self.pending)
    }

    /// Issue a call and wait at most `timeout` for its response.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Timeout`] if no response arrived in time; the call is
    ///   cancelled on the worker side.
    /// - [`PluginError::Cancelled`] once [`cancel_pending`](Self::cancel_pending)
    ///   has run.
    /// - [`PluginError::Transport`] if the channel is or becomes closed.
    /// - [`PluginError::ScopeDenied`] / [`PluginError::Remote`] for error
    ///   responses.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> PluginResult<Value> {
        self.admit(method)?;
        self.exchange(method, params, timeout, None).await
    }

    /// Like [`call`](Self::call), with the worker's host writes in dry-run
    /// mode until it answers this call, even past the timeout.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_dry_run(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        hold: DryRunGuard,
    ) -> PluginResult<Value> {
        self.admit(method)?;
        self.exchange(method, params, timeout, Some(hold)).await
    }

    /// Ask the worker to stop. Not refused by
    /// [`cancel_pending`](Self::cancel_pending).
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn request_shutdown(&self, timeout: Duration) -> PluginResult<Value> {
        self.exchange(methods::SHUTDOWN, Value::Null, timeout, None).await
    }

    fn admit(&self, method: &str) -> PluginResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(PluginError::cancelled(&self.plugin, method));
        }
        Ok(())
    }

    async fn exchange(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        hold: Option<DryRunGuard>,
    ) -> PluginResult<Value> {
        if self.closed.is_cancelled() {
            return Err(PluginError::transport(&self.plugin, "channel closed"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, response) = oneshot::channel();
        self.pending().insert(id, waiter);
        // The reader cancels before draining, so a closed token seen here
        // means our waiter may have missed the drain.
        if self.closed.is_cancelled() {
            self.pending().remove(&id);
            return Err(PluginError::transport(&self.plugin, "channel closed"));
        }

        let frame = Frame::Request {
            id,
            method: method.to_string(),
            params,
        };
        trace!(plugin = %self.plugin, id, method, dry_run = hold.is_some(), "call");

        let exchange = async {
            if self.outbound.send(frame).await.is_err() {
                return None;
            }
            response.await.ok()
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Some(Ok(value))) => Ok(value),
            Ok(Some(Err(remote))) => Err(PluginError::from_remote(&self.plugin, remote)),
            Ok(None) => {
                self.pending().remove(&id);
                if self.cancelled.load(Ordering::SeqCst) {
                    return Err(PluginError::cancelled(&self.plugin, method));
                }
                Err(PluginError::transport(
                    &self.plugin,
                    "worker channel closed before responding",
                ))
            },
            Err(_elapsed) => {
                {
                    // The reader checks `abandoned` only after missing `pending`.
                    let mut pending = self.pending();
                    pending.remove(&id);
                    if let Some(hold) = hold
                        && !self.closed.is_cancelled()
                    {
                        lock(&self.abandoned).insert(id, hold);
                    }
                }
                if self.outbound.try_send(Frame::Cancel { id }).is_err() {
                    debug!(plugin = %self.plugin, id, "cancel frame not queued");
                }
                debug!(plugin = %self.plugin, id, method, ?timeout, "call timed out");
                Err(PluginError::Timeout {
                    plugin: self.plugin.clone(),
                    method: method.to_string(),
                    timeout,
                })
            },
        }
    }

    /// Fail every outstanding call with [`PluginError::Cancelled`] and refuse
    /// new ones. The channel itself stays open for the shutdown exchange.
    pub fn cancel_pending(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let dropped = std::mem::take(&mut *self.pending());
        if !dropped.is_empty() {
            debug!(plugin = %self.plugin, calls = dropped.len(), "in-flight calls cancelled");
        }
    }

    /// Stop both tasks and fail all outstanding calls.
    pub fn close(&self) {
        self.closed.cancel();
        self.pending().clear();
        lock(&self.abandoned).clear();
    }

    /// Whether [`cancel_pending`](Self::cancel_pending) has run.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the channel is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Calls awaiting a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }

    /// Timed-out dry-run calls the worker has not answered yet.
    #[must_use]
    pub fn held_calls(&self) -> usize {
        lock(&self.abandoned).len()
    }
}

impl Drop for CallChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn write_loop<W>(
    plugin: PluginName,
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = closed.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let line = match frame.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "dropping unencodable frame");
                match oversized_reply(&frame) {
                    Some(line) => line,
                    None => continue,
                }
            },
        };

        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            debug!(plugin = %plugin, error = %e, "worker stdin closed");
            closed.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Replace an oversized response with an error so the worker is not left
/// waiting.
fn oversized_reply(frame: &Frame) -> Option<String> {
    let Frame::Response { id, .. } = frame else {
        return None;
    };
    Frame::response(*id, Err(RemoteError::internal("response exceeds frame limit")))
        .encode()
        .ok()
}

struct ReadLoop {
    plugin: PluginName,
    responses: mpsc::Sender<Frame>,
    pending: Arc<PendingCalls>,
    abandoned: Arc<HeldCalls>,
    inbound: Arc<ScopedContext>,
    closed: CancellationToken,
}

async fn read_loop<R>(ctx: ReadLoop, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    // FramedRead yields a single `None` after a decode error, then resumes.
    let mut resuming = false;

    loop {
        let next = tokio::select! {
            () = ctx.closed.cancelled() => break,
            next = lines.next() => next,
        };

        let line = match next {
            None if resuming => {
                resuming = false;
                continue;
            },
            None => {
                debug!(plugin = %ctx.plugin, "worker stdout closed");
                break;
            },
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!(plugin = %ctx.plugin, limit = MAX_FRAME_BYTES, "discarding oversized frame");
                resuming = true;
                continue;
            },
            Some(Err(LinesCodecError::Io(e))) => {
                warn!(plugin = %ctx.plugin, error = %e, "worker stdout read failed");
                break;
            },
            Some(Ok(line)) => line,
        };
        if line.trim().is_empty() {
            continue;
        }

        match Frame::decode(&line) {
            Ok(Frame::Response { id, result, error }) => {
                let waiter = lock(&ctx.pending).remove(&id);
                let Some(waiter) = waiter else {
                    if lock(&ctx.abandoned).remove(&id).is_some() {
                        debug!(plugin = %ctx.plugin, id, "abandoned dry-run call settled");
                    } else {
                        debug!(plugin = %ctx.plugin, id, "response for abandoned call");
                    }
                    continue;
                };
                let outcome = match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = waiter.send(outcome);
            },
            Ok(Frame::Request { id, method, params }) => {
                // Pinned here, in stream order, not when the task first runs.
                let host = ctx.inbound.pin_current();
                let responses = ctx.responses.clone();
                tokio::spawn(async move {
                    let outcome = host.host_call(&method, params).await;
                    let _ = responses.send(Frame::response(id, outcome)).await;
                });
            },
            Ok(Frame::Cancel { id }) => {
                trace!(plugin = %ctx.plugin, id, "worker cancelled a host call");
            },
            Err(e) => {
                warn!(plugin = %ctx.plugin, error = %e, "ignoring malformed frame");
            },
        }
    }

    ctx.closed.cancel();
    lock(&ctx.pending).clear();
    lock(&ctx.abandoned).clear();
}
