//! The worker's stdio serve loop.
//!
//! Frames from the host arrive on stdin. Responses to our own `host.*`
//! calls go to the [`HostClient`]; requests run as one task each so a slow
//! handler never blocks `health`. A `cancel` frame drops the matching
//! handler and answers the request with a `cancelled` error, so the host
//! learns the call is over. `shutdown` or EOF on stdin ends the loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use nebula_core::protocol::{MAX_FRAME_BYTES, codes, methods};
use nebula_core::{Frame, RemoteError, WorkerPlugin};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::HostClient;
use crate::error::{SdkError, SdkResult};

const OUTBOUND_CAPACITY: usize = 256;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

enum Inbound {
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    Cancel {
        id: u64,
    },
}

/// Serve `plugin` on this process's stdin and stdout.
///
/// # Errors
///
/// Returns [`SdkError::Initialize`] if the plugin's `initialize` hook fails.
pub async fn serve(plugin: Arc<dyn WorkerPlugin>) -> SdkResult<()> {
    serve_io(plugin, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve `plugin` over arbitrary streams.
///
/// # Errors
///
/// Returns [`SdkError::Initialize`] if the plugin's `initialize` hook fails.
pub async fn serve_io<R, W>(plugin: Arc<dyn WorkerPlugin>, reader: R, writer: W) -> SdkResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, frames) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(write_loop(writer, frames));
    let client = Arc::new(HostClient::new(outbound.clone()));
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&client), inbound_tx));

    // Requests queue up in `inbound` until initialisation is done.
    let initialized = plugin.initialize(client.as_ref()).await;
    if let Err(e) = initialized {
        reader_task.abort();
        return Err(SdkError::Initialize(e));
    }
    debug!("worker ready");

    let mut tasks: JoinSet<u64> = JoinSet::new();
    let mut running: HashMap<u64, CancellationToken> = HashMap::new();
    let mut host_gone = false;

    loop {
        let message = tokio::select! {
            message = inbound.recv() => message,
            Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                if let Ok(id) = done {
                    running.remove(&id);
                }
                continue;
            },
        };

        match message {
            None => {
                debug!("host closed stdin");
                host_gone = true;
                break;
            },
            Some(Inbound::Cancel { id }) => {
                if let Some(token) = running.remove(&id) {
                    token.cancel();
                    debug!(id, "request cancelled by host");
                }
            },
            Some(Inbound::Request { id, method, .. }) if method == methods::SHUTDOWN => {
                info!("shutdown requested");
                tasks.abort_all();
                plugin.shutdown().await;
                let _ = outbound
                    .send(Frame::response(id, Ok(json!({ "status": "stopping" }))))
                    .await;
                break;
            },
            Some(Inbound::Request { id, method, params }) => {
                let plugin = Arc::clone(&plugin);
                let client = Arc::clone(&client);
                let outbound = outbound.clone();
                let token = CancellationToken::new();
                let cancelled = token.clone();
                tasks.spawn(async move {
                    let outcome = tokio::select! {
                        outcome = dispatch(plugin.as_ref(), client.as_ref(), &method, params) => outcome,
                        () = cancelled.cancelled() => Err(RemoteError::new(
                            codes::CANCELLED,
                            format!("{method} cancelled by host"),
                        )),
                    };
                    let _ = outbound.send(Frame::response(id, outcome)).await;
                    id
                });
                running.insert(id, token);
            },
        }
    }

    if !tasks.is_empty() {
        tasks.shutdown().await;
    }
    if host_gone {
        plugin.shutdown().await;
    }
    reader_task.abort();
    client.close();
    drop(client);
    drop(outbound);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer_task).await.is_err() {
        warn!("stdout did not drain before exit");
    }
    Ok(())
}

async fn dispatch(
    plugin: &dyn WorkerPlugin,
    client: &HostClient,
    method: &str,
    params: Value,
) -> Result<Value, RemoteError> {
    let call = async {
        if method == methods::HEALTH {
            plugin.health().await
        } else {
            plugin.handle(method, params, client).await
        }
    };
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_panic) => {
            warn!(method, "handler panicked");
            Err(RemoteError::internal(format!("handler for {method} panicked")))
        },
    }
}

async fn read_loop<R>(reader: R, client: Arc<HostClient>, inbound: mpsc::UnboundedSender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    // FramedRead yields a single `None` after a decode error, then resumes.
    let mut resuming = false;
    loop {
        let Some(next) = lines.next().await else {
            if std::mem::take(&mut resuming) {
                continue;
            }
            break;
        };
        let line = match next {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("discarding oversized frame");
                resuming = true;
                continue;
            },
            Err(LinesCodecError::Io(e)) => {
                warn!(error = %e, "stdin read failed");
                break;
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match Frame::decode(&line) {
            Ok(Frame::Response { id, result, error }) => {
                client.resolve(id, match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                });
                continue;
            },
            Ok(Frame::Request { id, method, params }) => Inbound::Request { id, method, params },
            Ok(Frame::Cancel { id }) => Inbound::Cancel { id },
            Err(e) => {
                warn!(error = %e, "ignoring malformed frame");
                continue;
            },
        };
        if inbound.send(message).is_err() {
            break;
        }
    }
    client.close();
}

async fn write_loop<W>(mut writer: W, mut frames: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let line = match frame.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "dropping unencodable frame");
                let Frame::Response { id, .. } = frame else {
                    continue;
                };
                match Frame::response(id, Err(RemoteError::internal("response exceeds frame limit")))
                    .encode()
                {
                    Ok(line) => line,
                    Err(_) => continue,
                }
            },
        };
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            debug!(error = %e, "stdout closed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use nebula_core::HostCalls;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    use super::*;

    struct TestPlugin;

    #[async_trait]
    impl WorkerPlugin for TestPlugin {
        async fn health(&self) -> Result<Value, RemoteError> {
            Ok(json!({ "status": "ok" }))
        }

        async fn handle(
            &self,
            method: &str,
            params: Value,
            host: &dyn HostCalls,
        ) -> Result<Value, RemoteError> {
            match method {
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Value::Null)
                },
                "ask_host" => host.host_call("host.log", params).await,
                "panic" => panic!("handler blew up"),
                other => Err(RemoteError::method_not_found(other)),
            }
        }
    }

    struct Host {
        to_worker: DuplexStream,
        from_worker: Lines<BufReader<DuplexStream>>,
        served: tokio::task::JoinHandle<SdkResult<()>>,
    }

    impl Host {
        fn start() -> Self {
            let (to_worker, worker_in) = tokio::io::duplex(64 * 1024);
            let (worker_out, from_worker) = tokio::io::duplex(64 * 1024);
            let served = tokio::spawn(serve_io(Arc::new(TestPlugin), worker_in, worker_out));
            Self {
                to_worker,
                from_worker: BufReader::new(from_worker).lines(),
                served,
            }
        }

        async fn send(&mut self, frame: Frame) {
            self.to_worker
                .write_all(frame.encode().unwrap().as_bytes())
                .await
                .unwrap();
        }

        async fn request(&mut self, id: u64, method: &str, params: Value) {
            self.send(Frame::Request {
                id,
                method: method.into(),
                params,
            })
            .await;
        }

        async fn next(&mut self) -> Frame {
            let line = self.from_worker.next_line().await.unwrap().unwrap();
            Frame::decode(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn test_health_and_unknown_method() {
        let mut host = Host::start();
        host.request(1, "health", Value::Null).await;
        assert_eq!(host.next().await, Frame::response(1, Ok(json!({ "status": "ok" }))));

        host.request(2, "reticulate", Value::Null).await;
        let Frame::Response { id, error, .. } = host.next().await else {
            panic!("expected response");
        };
        assert_eq!(id, 2);
        assert_eq!(error.unwrap().code, "method_not_found");
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_health() {
        let mut host = Host::start();
        host.request(1, "sleep", Value::Null).await;
        host.request(2, "health", Value::Null).await;
        let Frame::Response { id, .. } = host.next().await else {
            panic!("expected response");
        };
        assert_eq!(id, 2);

        host.send(Frame::Cancel { id: 1 }).await;
        let Frame::Response { id, error, .. } = host.next().await else {
            panic!("expected response");
        };
        assert_eq!(id, 1);
        assert_eq!(error.unwrap().code, codes::CANCELLED);

        host.request(3, "health", Value::Null).await;
        let Frame::Response { id, .. } = host.next().await else {
            panic!("expected response");
        };
        assert_eq!(id, 3);
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        let mut host = Host::start();
        let mut line = vec![b'x'; MAX_FRAME_BYTES + 16];
        line.push(b'\n');
        let mut to_worker = host.to_worker;
        let writer = tokio::spawn(async move {
            to_worker.write_all(&line).await.unwrap();
            to_worker
        });
        host.to_worker = writer.await.unwrap();

        host.request(4, "health", Value::Null).await;
        assert_eq!(host.next().await, Frame::response(4, Ok(json!({ "status": "ok" }))));
    }

    #[tokio::test]
    async fn test_host_calls_round_trip() {
        let mut host = Host::start();
        host.request(7, "ask_host", json!({ "level": "info", "message": "hello" }))
            .await;

        let Frame::Request { id, method, params } = host.next().await else {
            panic!("expected a host call");
        };
        assert_eq!(method, "host.log");
        assert_eq!(params["message"], "hello");
        host.send(Frame::response(id, Ok(json!({ "status": "logged" }))))
            .await;

        assert_eq!(
            host.next().await,
            Frame::response(7, Ok(json!({ "status": "logged" })))
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let mut host = Host::start();
        host.request(1, "panic", Value::Null).await;
        let Frame::Response { error, .. } = host.next().await else {
            panic!("expected response");
        };
        assert_eq!(error.unwrap().code, "internal");

        host.request(2, "health", Value::Null).await;
        assert!(matches!(host.next().await, Frame::Response { id: 2, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_answers_then_exits() {
        let mut host = Host::start();
        host.request(9, "shutdown", Value::Null).await;
        assert_eq!(
            host.next().await,
            Frame::response(9, Ok(json!({ "status": "stopping" })))
        );
        host.served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_eof_ends_the_loop() {
        let host = Host::start();
        let Host { to_worker, served, .. } = host;
        drop(to_worker);
        served.await.unwrap().unwrap();
    }
}
