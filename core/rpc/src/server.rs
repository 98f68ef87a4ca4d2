// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Server-side dispatch.
//!
//! A [`ServiceRegistry`] binds operations to the four interaction patterns;
//! a [`Server`] accepts connections, demultiplexes frames into per-call
//! channels and drives one dispatch task per call. A transport fault is
//! fatal to its call, never to the process. Graceful shutdown cancels all
//! in-flight calls and drains their tasks before returning.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::CallChannel;
use crate::codec::{Decoder, Encoder};
use crate::context::CallContext;
use crate::frame::{self, Frame, WireFrame};
use crate::status::{Code, Status};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Stream of decoded request messages handed to client-stream and bidi
/// handlers.
pub type RequestStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// Stream of response messages produced by server-stream and bidi handlers.
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, Status>> + Send>>;

type UnaryFn = Arc<dyn Fn(Vec<u8>, CallContext) -> BoxFuture<Result<Vec<u8>, Status>> + Send + Sync>;
type ServerStreamFn =
    Arc<dyn Fn(Vec<u8>, CallContext) -> BoxFuture<Result<ByteStream, Status>> + Send + Sync>;
type ClientStreamFn =
    Arc<dyn Fn(ByteStream, CallContext) -> BoxFuture<Result<Vec<u8>, Status>> + Send + Sync>;
type BidiStreamFn =
    Arc<dyn Fn(ByteStream, CallContext) -> BoxFuture<Result<ByteStream, Status>> + Send + Sync>;

/// A registered operation: one variant per interaction pattern. The pattern
/// is fixed at registration and determines the call state machine.
#[derive(Clone)]
enum Handler {
    Unary(UnaryFn),
    ServerStream(ServerStreamFn),
    ClientStream(ClientStreamFn),
    BidiStream(BidiStreamFn),
}

/// Registry of RPC operations, keyed by "Service/Method".
pub struct ServiceRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, service: &str, method: &str, handler: Handler) {
        self.handlers
            .write()
            .insert(format!("{service}/{method}"), handler);
    }

    /// Register a unary operation: one request, one response.
    pub fn register_unary<Req, Res, F, Fut>(&self, service: &str, method: &str, handler: F)
    where
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapper: UnaryFn = Arc::new(move |bytes: Vec<u8>, ctx: CallContext| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request = Req::decode(&bytes)?;
                let response = handler(request, ctx).await?;
                response.encode()
            }) as BoxFuture<Result<Vec<u8>, Status>>
        });
        self.insert(service, method, Handler::Unary(wrapper));
    }

    /// Register a server-stream operation: one request, many responses.
    pub fn register_server_stream<Req, Res, S, F, Fut>(&self, service: &str, method: &str, handler: F)
    where
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapper: ServerStreamFn = Arc::new(move |bytes: Vec<u8>, ctx: CallContext| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request = Req::decode(&bytes)?;
                let responses = handler(request, ctx).await?;
                let bytes_stream = responses.map(|item| item.and_then(|r| r.encode()));
                Ok(Box::pin(bytes_stream) as ByteStream)
            }) as BoxFuture<Result<ByteStream, Status>>
        });
        self.insert(service, method, Handler::ServerStream(wrapper));
    }

    /// Register a client-stream operation: many requests folded into one
    /// response.
    pub fn register_client_stream<Req, Res, F, Fut>(&self, service: &str, method: &str, handler: F)
    where
        F: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapper: ClientStreamFn = Arc::new(move |bytes: ByteStream, ctx: CallContext| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let requests = bytes.map(|item| item.and_then(|b| Req::decode(&b)));
                let response = handler(Box::pin(requests), ctx).await?;
                response.encode()
            }) as BoxFuture<Result<Vec<u8>, Status>>
        });
        self.insert(service, method, Handler::ClientStream(wrapper));
    }

    /// Register a bidi-stream operation: requests and responses interleaved
    /// per the operation's alternation contract.
    pub fn register_bidi_stream<Req, Res, S, F, Fut>(&self, service: &str, method: &str, handler: F)
    where
        F: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Res, Status>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapper: BidiStreamFn = Arc::new(move |bytes: ByteStream, ctx: CallContext| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let requests = bytes.map(|item| item.and_then(|b| Req::decode(&b)));
                let responses = handler(Box::pin(requests), ctx).await?;
                let bytes_stream = responses.map(|item| item.and_then(|r| r.encode()));
                Ok(Box::pin(bytes_stream) as ByteStream)
            }) as BoxFuture<Result<ByteStream, Status>>
        });
        self.insert(service, method, Handler::BidiStream(wrapper));
    }

    fn get(&self, method_path: &str) -> Option<Handler> {
        self.handlers.read().get(method_path).cloned()
    }

    /// All registered method paths.
    pub fn methods(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    registry: ServiceRegistry,
    cancel: RwLock<CancellationToken>,
    drain_signal: RwLock<Option<drain::Signal>>,
    drain_watch: RwLock<Option<drain::Watch>>,
}

/// RPC server: accepts connections and dispatches calls to registered
/// handlers.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Clone for Server {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        let (drain_signal, drain_watch) = drain::channel();
        Self {
            inner: Arc::new(ServerInner {
                registry: ServiceRegistry::new(),
                cancel: RwLock::new(CancellationToken::new()),
                drain_signal: RwLock::new(Some(drain_signal)),
                drain_watch: RwLock::new(Some(drain_watch)),
            }),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    /// Accept and serve connections until [`Server::shutdown`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Status> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "rpc server listening");
        }
        let token = self.inner.cancel.read().clone();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("rpc server received shutdown signal");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted
                        .map_err(|e| Status::internal(format!("accept failed: {e}")))?;
                    let watch = self
                        .inner
                        .drain_watch
                        .read()
                        .clone()
                        .ok_or_else(|| Status::internal("drain watch not available"))?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        tracing::debug!(%peer, "connection accepted");
                        server.handle_connection(stream, watch).await;
                        tracing::debug!(%peer, "connection closed");
                    });
                }
            }
        }
    }

    /// Shut down gracefully: cancel in-flight calls, wait for their tasks to
    /// drain. The server can be restarted with `serve` afterwards.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down rpc server");

        self.inner.cancel.read().cancel();

        let drain_signal = self.inner.drain_signal.write().take();
        let drain_watch = self.inner.drain_watch.write().take();
        drop(drain_watch);

        if let Some(signal) = drain_signal {
            tracing::debug!("draining active calls");
            signal.drain().await;
        }

        // Fresh drain pair and token so the server can be restarted.
        let (new_signal, new_watch) = drain::channel();
        *self.inner.drain_signal.write() = Some(new_signal);
        *self.inner.drain_watch.write() = Some(new_watch);
        *self.inner.cancel.write() = CancellationToken::new();

        tracing::debug!("server shutdown complete");
    }

    async fn handle_connection(self, stream: TcpStream, watch: drain::Watch) {
        let conn_token = self.inner.cancel.read().child_token();
        let (sink, mut frames) = frame::framed(stream).split();

        // Writer task: the single serialization point for outbound frames.
        let (out_tx, out_rx) = mpsc::unbounded_channel::<WireFrame>();
        let writer = tokio::spawn(frame::write_frames(sink, out_rx));

        // Dispatch tasks report completion so the call table stays bounded.
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();
        let mut calls: HashMap<u64, CallSlot> = HashMap::new();

        loop {
            tokio::select! {
                _ = conn_token.cancelled() => break,
                Some(call_id) = done_rx.recv() => {
                    calls.remove(&call_id);
                }
                inbound = frames.next() => {
                    let wire = match inbound {
                        Some(Ok(bytes)) => match frame::decode(&bytes) {
                            Ok(wire) => wire,
                            Err(e) => {
                                tracing::warn!(%e, "undecodable frame, dropping connection");
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            tracing::warn!(%e, "framing error, dropping connection");
                            break;
                        }
                        None => break,
                    };
                    self.route_frame(wire, &mut calls, &out_tx, &done_tx, &conn_token, &watch);
                }
            }
        }

        // Unwind whatever is still running for this connection; dropping the
        // call table closes each call's inbound queue.
        conn_token.cancel();
        drop(calls);
        drop(out_tx);
        let _ = writer.await;
        drop(watch);
    }

    fn route_frame(
        &self,
        wire: WireFrame,
        calls: &mut HashMap<u64, CallSlot>,
        out_tx: &mpsc::UnboundedSender<WireFrame>,
        done_tx: &mpsc::UnboundedSender<u64>,
        conn_token: &CancellationToken,
        watch: &drain::Watch,
    ) {
        let call_id = wire.call_id;
        match wire.frame {
            Frame::Open {
                method,
                deadline_ms,
            } => {
                if calls.contains_key(&call_id) {
                    tracing::debug!(call_id, "duplicate open, ignoring");
                    return;
                }
                let Some(handler) = self.inner.registry.get(&method) else {
                    tracing::debug!(call_id, %method, "no handler registered");
                    let _ = out_tx.send(WireFrame {
                        call_id,
                        frame: Frame::Status {
                            code: Code::Unimplemented.as_i32(),
                            message: format!("unknown method: {method}"),
                        },
                    });
                    return;
                };

                let token = conn_token.child_token();
                let deadline = deadline_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
                if let Some(deadline) = deadline {
                    let timer_token = token.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = timer_token.cancelled() => {}
                            _ = tokio::time::sleep_until(deadline) => timer_token.cancel(),
                        }
                    });
                }

                let ctx = CallContext::new(method, deadline, token.clone());
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                let chan = CallChannel::new(call_id, out_tx.clone(), in_rx);
                calls.insert(call_id, CallSlot { in_tx, token });

                let done_tx = done_tx.clone();
                let watch = watch.clone();
                tokio::spawn(async move {
                    let token = ctx.token().clone();
                    if let Err(status) = dispatch(handler, chan, ctx).await {
                        // Fatal to this call only, never to the process.
                        tracing::error!(call_id, %status, "call failed");
                    }
                    // Reaps the deadline timer if it is still pending.
                    token.cancel();
                    let _ = done_tx.send(call_id);
                    drop(watch);
                });
            }
            Frame::Status { code, message } => {
                if let Some(slot) = calls.get(&call_id) {
                    // Client-initiated terminal status is the cancellation
                    // signal for the handler.
                    slot.token.cancel();
                    let _ = slot.in_tx.send(Frame::Status { code, message });
                } else {
                    tracing::debug!(call_id, "status for unknown call");
                }
            }
            other => {
                if let Some(slot) = calls.get(&call_id) {
                    let _ = slot.in_tx.send(other);
                } else {
                    tracing::debug!(call_id, "frame for unknown call");
                }
            }
        }
    }
}

struct CallSlot {
    in_tx: mpsc::UnboundedSender<Frame>,
    token: CancellationToken,
}

fn cancel_status(ctx: &CallContext) -> Status {
    if ctx.is_deadline_exceeded() {
        Status::deadline_exceeded("deadline exceeded")
    } else {
        Status::cancelled("call cancelled")
    }
}

async fn dispatch(handler: Handler, chan: CallChannel, ctx: CallContext) -> Result<(), Status> {
    match handler {
        Handler::Unary(f) => dispatch_unary(f, chan, ctx).await,
        Handler::ServerStream(f) => dispatch_server_stream(f, chan, ctx).await,
        Handler::ClientStream(f) => dispatch_client_stream(f, chan, ctx).await,
        Handler::BidiStream(f) => dispatch_bidi_stream(f, chan, ctx).await,
    }
}

/// Receive the single request of a unary-input call. `None` means the call
/// is already settled (cancelled, closed early or faulted) and the caller
/// has nothing left to do.
async fn recv_single_request(chan: &mut CallChannel, ctx: &CallContext) -> Option<Vec<u8>> {
    tokio::select! {
        _ = ctx.cancelled() => {
            chan.fail(cancel_status(ctx));
            None
        }
        received = chan.recv() => match received {
            Ok(Some(payload)) => Some(payload),
            Ok(None) => {
                chan.fail(Status::invalid_argument("call closed without a request"));
                None
            }
            Err(status) => {
                tracing::debug!(%status, "receive failed before request");
                None
            }
        }
    }
}

async fn dispatch_unary(
    handler: UnaryFn,
    mut chan: CallChannel,
    ctx: CallContext,
) -> Result<(), Status> {
    let Some(request) = recv_single_request(&mut chan, &ctx).await else {
        return Ok(());
    };

    let result = tokio::select! {
        _ = ctx.cancelled() => Err(cancel_status(&ctx)),
        result = handler(request, ctx.clone()) => result,
    };

    match result {
        Ok(response) => {
            chan.send(response)?;
            chan.close_send();
        }
        Err(status) => chan.fail(status),
    }
    Ok(())
}

async fn dispatch_server_stream(
    handler: ServerStreamFn,
    mut chan: CallChannel,
    ctx: CallContext,
) -> Result<(), Status> {
    let Some(request) = recv_single_request(&mut chan, &ctx).await else {
        return Ok(());
    };

    let mut responses = tokio::select! {
        _ = ctx.cancelled() => {
            chan.fail(cancel_status(&ctx));
            return Ok(());
        }
        result = handler(request, ctx.clone()) => match result {
            Ok(responses) => responses,
            Err(status) => {
                chan.fail(status);
                return Ok(());
            }
        }
    };

    loop {
        // The cancellation check runs on every emission.
        tokio::select! {
            _ = ctx.cancelled() => {
                chan.fail(cancel_status(&ctx));
                return Ok(());
            }
            item = responses.next() => match item {
                Some(Ok(payload)) => chan.send(payload)?,
                Some(Err(status)) => {
                    chan.fail(status);
                    return Ok(());
                }
                None => break,
            }
        }
    }
    chan.close_send();
    Ok(())
}

/// Turn the receive half of a call into the request stream handed to
/// stream-input handlers, observing cancellation on every iteration.
fn request_stream(mut rx: crate::channel::CallReceiver, ctx: CallContext) -> ByteStream {
    Box::pin(stream! {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    yield Err(cancel_status(&ctx));
                    break;
                }
                received = rx.recv() => match received {
                    Ok(Some(payload)) => yield Ok(payload),
                    Ok(None) => break,
                    Err(status) => {
                        yield Err(status);
                        break;
                    }
                }
            }
        }
    })
}

async fn dispatch_client_stream(
    handler: ClientStreamFn,
    chan: CallChannel,
    ctx: CallContext,
) -> Result<(), Status> {
    let (mut tx, rx) = chan.into_split();
    let requests = request_stream(rx, ctx.clone());

    match handler(requests, ctx).await {
        Ok(response) => {
            tx.send(response)?;
            tx.close_send();
        }
        Err(status) => tx.fail(&status),
    }
    Ok(())
}

async fn dispatch_bidi_stream(
    handler: BidiStreamFn,
    chan: CallChannel,
    ctx: CallContext,
) -> Result<(), Status> {
    let (mut tx, rx) = chan.into_split();
    let requests = request_stream(rx, ctx.clone());

    let mut responses = match handler(requests, ctx.clone()).await {
        Ok(responses) => responses,
        Err(status) => {
            tx.fail(&status);
            return Ok(());
        }
    };

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                tx.fail(&cancel_status(&ctx));
                return Ok(());
            }
            item = responses.next() => match item {
                Some(Ok(payload)) => tx.send(payload)?,
                Some(Err(status)) => {
                    tx.fail(&status);
                    return Ok(());
                }
                None => break,
            }
        }
    }
    tx.close_send();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_empty() {
        let registry = ServiceRegistry::new();
        assert!(registry.methods().is_empty());
        assert!(registry.get("Calculator/Add").is_none());
    }

    #[test]
    fn registry_keys_by_service_and_method() {
        let registry = ServiceRegistry::new();
        registry.register_unary(
            "Calculator",
            "Add",
            |request: Vec<u8>, _ctx: CallContext| async move { Ok(request) },
        );

        assert_eq!(registry.methods(), vec!["Calculator/Add".to_string()]);
        assert!(registry.get("Calculator/Add").is_some());
        assert!(registry.get("Calculator/Sub").is_none());
    }

    #[test]
    fn registration_is_pattern_typed() {
        let registry = ServiceRegistry::new();
        registry.register_client_stream(
            "Calculator",
            "Count",
            |mut requests: RequestStream<Vec<u8>>, _ctx: CallContext| async move {
                let mut count = 0u64;
                while let Some(item) = requests.next().await {
                    item?;
                    count += 1;
                }
                Ok(count.to_be_bytes().to_vec())
            },
        );

        assert!(matches!(
            registry.get("Calculator/Count"),
            Some(Handler::ClientStream(_))
        ));
    }
}
