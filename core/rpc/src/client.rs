// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Client-side channel and pattern drivers.
//!
//! A [`Channel`] owns one multiplexed connection: a writer task serializing
//! outbound frames and a demultiplexer routing inbound frames to per-call
//! queues. The four drivers map onto the four interaction patterns; the bidi
//! driver runs an independent send task and receive loop over the same call
//! and completes only after both have finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use futures::stream::{SplitStream, Stream};
use parking_lot::Mutex;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::channel::CallChannel;
use crate::codec::{Decoder, Encoder};
use crate::frame::{self, Frame, WireFrame};
use crate::status::Status;

type CallMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Frame>>>>;

struct ChannelInner {
    out: mpsc::UnboundedSender<WireFrame>,
    calls: CallMap,
    next_call_id: AtomicU64,
}

/// Client-side channel to a remote server. Cheap to clone; any number of
/// concurrent calls share the one connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Dial the server and spin up the connection's writer and
    /// demultiplexer tasks.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, Status> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Status::unavailable(format!("failed to connect: {e}")))?;
        let (sink, frames) = frame::framed(stream).split();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let calls: CallMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(frame::write_frames(sink, out_rx));
        tokio::spawn(demux(frames, Arc::clone(&calls)));

        Ok(Self {
            inner: Arc::new(ChannelInner {
                out: out_tx,
                calls,
                next_call_id: AtomicU64::new(1),
            }),
        })
    }

    /// Open one call: allocate an id, register its inbound queue and send
    /// the `Open` frame ahead of any message.
    fn open_call(
        &self,
        service: &str,
        method: &str,
        timeout: Option<Duration>,
    ) -> Result<CallChannel, Status> {
        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.inner.calls.lock().insert(call_id, in_tx);

        let open = WireFrame {
            call_id,
            frame: Frame::Open {
                method: format!("{service}/{method}"),
                deadline_ms: timeout.map(|d| d.as_millis() as u64),
            },
        };
        if self.inner.out.send(open).is_err() {
            self.inner.calls.lock().remove(&call_id);
            return Err(Status::unavailable("connection closed"));
        }

        tracing::debug!(call_id, service, method, "opened call");
        Ok(CallChannel::new(call_id, self.inner.out.clone(), in_rx))
    }

    /// Unary: one request, one response. A timeout is enforced locally and
    /// also shipped to the server as the call deadline.
    pub async fn unary<Req, Res>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        timeout: Option<Duration>,
    ) -> Result<Res, Status>
    where
        Req: Encoder,
        Res: Decoder,
    {
        let mut call = self.open_call(service, method, timeout)?;
        call.send(request.encode()?)?;
        call.close_send();
        single_response(call, timeout).await
    }

    /// Server-stream: one request, responses yielded as a lazy finite
    /// stream until end-of-stream.
    pub fn server_stream<Req, Res>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        timeout: Option<Duration>,
    ) -> impl Stream<Item = Result<Res, Status>> + use<Req, Res>
    where
        Req: Encoder + Send + 'static,
        Res: Decoder + Send + 'static,
    {
        let channel = self.clone();
        let service = service.to_string();
        let method = method.to_string();

        try_stream! {
            let mut call = channel.open_call(&service, &method, timeout)?;
            call.send(request.encode()?)?;
            call.close_send();

            while let Some(payload) = call.recv().await? {
                yield Res::decode(&payload)?;
            }
        }
    }

    /// Client-stream: send every item of a finite request stream, close the
    /// send direction, then wait for the single aggregated response.
    pub async fn client_stream<Req, Res, S>(
        &self,
        service: &str,
        method: &str,
        mut requests: S,
        timeout: Option<Duration>,
    ) -> Result<Res, Status>
    where
        S: Stream<Item = Req> + Unpin,
        Req: Encoder,
        Res: Decoder,
    {
        let mut call = self.open_call(service, method, timeout)?;
        while let Some(request) = requests.next().await {
            call.send(request.encode()?)?;
        }
        call.close_send();
        single_response(call, timeout).await
    }

    /// Bidi-stream: an independent send task and the receive loop run
    /// concurrently against the same call; the returned stream terminates
    /// only after the receive loop has observed end-of-stream AND the send
    /// task has been joined, so neither a late request nor a response tail
    /// can be dropped.
    pub fn bidi_stream<Req, Res, S>(
        &self,
        service: &str,
        method: &str,
        requests: S,
        timeout: Option<Duration>,
    ) -> impl Stream<Item = Result<Res, Status>> + use<Req, Res, S>
    where
        S: Stream<Item = Req> + Send + Unpin + 'static,
        Req: Encoder + Send + 'static,
        Res: Decoder + Send + 'static,
    {
        let channel = self.clone();
        let service = service.to_string();
        let method = method.to_string();

        try_stream! {
            let call = channel.open_call(&service, &method, timeout)?;
            let (mut tx, mut rx) = call.into_split();

            // The send task and this receive loop share only the call.
            let sender = tokio::spawn(async move {
                let mut requests = requests;
                while let Some(request) = requests.next().await {
                    tx.send(request.encode()?)?;
                }
                tx.close_send();
                Ok::<(), Status>(())
            });

            loop {
                match rx.recv().await {
                    Ok(Some(payload)) => yield Res::decode(&payload)?,
                    Ok(None) => break,
                    Err(status) => {
                        // Terminal error ends the call; nothing left to send.
                        sender.abort();
                        Err(status)?;
                    }
                }
            }

            // Completion barrier: wait for the slower side.
            match sender.await {
                Ok(result) => result?,
                Err(e) => Err(Status::internal(format!("send task failed: {e}")))?,
            }
        }
    }
}

/// Wait for the one response of a unary-shaped call, honoring the local
/// timeout.
async fn single_response<Res: Decoder>(
    mut call: CallChannel,
    timeout: Option<Duration>,
) -> Result<Res, Status> {
    let response = async {
        match call.recv().await? {
            Some(payload) => Res::decode(&payload),
            None => Err(Status::internal("call closed without a response")),
        }
    };

    match timeout {
        Some(limit) => {
            let outcome = tokio::time::timeout(limit, response).await;
            match outcome {
                Ok(result) => result,
                Err(_) => {
                    call.fail(Status::cancelled("deadline exceeded"));
                    Err(Status::deadline_exceeded(format!(
                        "no response within {limit:?}"
                    )))
                }
            }
        }
        None => response.await,
    }
}

/// Route inbound frames to their calls. Terminal frames retire the call's
/// queue; when the connection dies every pending call sees its queue close.
async fn demux(mut frames: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>, calls: CallMap) {
    while let Some(inbound) = frames.next().await {
        let wire = match inbound {
            Ok(bytes) => match frame::decode(&bytes) {
                Ok(wire) => wire,
                Err(e) => {
                    tracing::warn!(%e, "undecodable frame, dropping connection");
                    break;
                }
            },
            Err(e) => {
                tracing::warn!(%e, "framing error, dropping connection");
                break;
            }
        };

        let mut guard = calls.lock();
        match wire.frame {
            terminal @ (Frame::Close | Frame::Status { .. }) => {
                if let Some(tx) = guard.remove(&wire.call_id) {
                    let _ = tx.send(terminal);
                } else {
                    tracing::debug!(call_id = wire.call_id, "terminal frame for unknown call");
                }
            }
            other => match guard.get(&wire.call_id) {
                Some(tx) => {
                    if tx.send(other).is_err() {
                        guard.remove(&wire.call_id);
                    }
                }
                None => tracing::debug!(call_id = wire.call_id, "frame for unknown call"),
            },
        }
    }
    calls.lock().clear();
}
