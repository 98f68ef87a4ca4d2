// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-call channel.
//!
//! A [`CallChannel`] is one logical duplex pipe for exactly one call: an
//! unbounded FIFO send direction and an unbounded FIFO receive direction,
//! each closable independently. End-of-stream and terminal-status
//! observations are sticky: once `recv` has returned end-of-stream it keeps
//! returning it, and once a terminal status has surfaced every later `recv`
//! surfaces the same status. Sends never block on capacity, only fail on
//! closure.

use tokio::sync::mpsc;

use crate::frame::{Frame, WireFrame};
use crate::status::{Code, Status};

/// Receive-direction state. `Eos` and `Failed` are terminal and sticky.
#[derive(Debug, Clone)]
enum RecvState {
    Open,
    Eos,
    Failed(Status),
}

/// Send half of a call: outgoing frames tagged with the call id.
pub struct CallSender {
    call_id: u64,
    out: mpsc::UnboundedSender<WireFrame>,
    closed: bool,
}

impl CallSender {
    fn push(&self, frame: Frame) -> Result<(), Status> {
        self.out
            .send(WireFrame {
                call_id: self.call_id,
                frame,
            })
            .map_err(|_| Status::unavailable("connection closed"))
    }

    /// Enqueue one message. Fails if this direction was already closed by
    /// `close_send` or by a terminal status.
    pub fn send(&mut self, payload: Vec<u8>) -> Result<(), Status> {
        if self.closed {
            return Err(Status::failed_precondition(
                "send on a closed call direction",
            ));
        }
        self.push(Frame::Message { payload })
    }

    /// Signal end-of-stream for this direction. Idempotent; unblocks a peer
    /// waiting to receive.
    pub fn close_send(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.push(Frame::Close) {
            tracing::debug!(call_id = self.call_id, %e, "close_send after connection loss");
        }
    }

    /// Emit a terminal status and close this direction. Best-effort: a dead
    /// connection cannot carry the status anywhere anyway.
    pub fn fail(&mut self, status: &Status) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.push(Frame::Status {
            code: status.code().as_i32(),
            message: status.message().to_string(),
        });
    }
}

impl Drop for CallSender {
    fn drop(&mut self) {
        // An abandoned call (sender dropped without close_send or a terminal
        // status) cancels the peer's remaining work for it.
        if !self.closed {
            self.closed = true;
            let _ = self.push(Frame::Status {
                code: Code::Cancelled.as_i32(),
                message: "call abandoned".to_string(),
            });
        }
    }
}

/// Receive half of a call: the demultiplexed inbound frame queue.
pub struct CallReceiver {
    call_id: u64,
    rx: mpsc::UnboundedReceiver<Frame>,
    state: RecvState,
}

impl CallReceiver {
    /// Receive the next message.
    ///
    /// Returns `Ok(Some(payload))` for a message, `Ok(None)` once the peer
    /// has closed its send direction, and `Err(status)` on a terminal error.
    /// Both terminal outcomes are sticky and never block.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, Status> {
        match &self.state {
            RecvState::Eos => return Ok(None),
            RecvState::Failed(status) => return Err(status.clone()),
            RecvState::Open => {}
        }

        match self.rx.recv().await {
            Some(Frame::Message { payload }) => Ok(Some(payload)),
            Some(Frame::Close) => {
                self.state = RecvState::Eos;
                Ok(None)
            }
            Some(Frame::Status { code, message }) => {
                let status = Status::from_wire(code, message);
                if status.code().is_ok() {
                    self.state = RecvState::Eos;
                    Ok(None)
                } else {
                    self.state = RecvState::Failed(status.clone());
                    Err(status)
                }
            }
            Some(Frame::Open { .. }) => {
                let status = Status::internal("unexpected open frame on an active call");
                self.state = RecvState::Failed(status.clone());
                Err(status)
            }
            None => {
                let status = Status::internal("connection closed before end of stream");
                self.state = RecvState::Failed(status.clone());
                Err(status)
            }
        }
    }

    fn fail_local(&mut self, status: Status) {
        if matches!(self.state, RecvState::Open) {
            self.state = RecvState::Failed(status);
        }
    }
}

/// One active call: both directions together.
///
/// Created by the client connection when a call is opened and by the server
/// demultiplexer when an `Open` frame arrives. [`CallChannel::into_split`]
/// hands the two halves to independent tasks; the halves share nothing but
/// the underlying queues.
pub struct CallChannel {
    tx: CallSender,
    rx: CallReceiver,
}

impl CallChannel {
    pub(crate) fn new(
        call_id: u64,
        out: mpsc::UnboundedSender<WireFrame>,
        rx: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            tx: CallSender {
                call_id,
                out,
                closed: false,
            },
            rx: CallReceiver {
                call_id,
                rx,
                state: RecvState::Open,
            },
        }
    }

    pub fn call_id(&self) -> u64 {
        self.rx.call_id
    }

    /// See [`CallSender::send`].
    pub fn send(&mut self, payload: Vec<u8>) -> Result<(), Status> {
        self.tx.send(payload)
    }

    /// See [`CallSender::close_send`].
    pub fn close_send(&mut self) {
        self.tx.close_send();
    }

    /// See [`CallReceiver::recv`].
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, Status> {
        self.rx.recv().await
    }

    /// Set a terminal status: closes both directions and makes pending and
    /// future `recv` calls surface the status.
    pub fn fail(&mut self, status: Status) {
        self.tx.fail(&status);
        self.rx.fail_local(status);
    }

    /// Split into independently owned halves, for drivers that must send and
    /// receive concurrently.
    pub fn into_split(self) -> (CallSender, CallReceiver) {
        (self.tx, self.rx)
    }
}

/// In-process loopback pair, mainly for tests: frames sent on one channel
/// arrive on the other, in order.
pub fn pair(call_id: u64) -> (CallChannel, CallChannel) {
    fn forward(
        mut wire_rx: mpsc::UnboundedReceiver<WireFrame>,
        in_tx: mpsc::UnboundedSender<Frame>,
    ) {
        tokio::spawn(async move {
            while let Some(wire) = wire_rx.recv().await {
                if in_tx.send(wire.frame).is_err() {
                    break;
                }
            }
        });
    }

    let (a_out, a_out_rx) = mpsc::unbounded_channel();
    let (b_out, b_out_rx) = mpsc::unbounded_channel();
    let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
    let (b_in_tx, b_in_rx) = mpsc::unbounded_channel();

    forward(a_out_rx, b_in_tx);
    forward(b_out_rx, a_in_tx);

    (
        CallChannel::new(call_id, a_out, a_in_rx),
        CallChannel::new(call_id, b_out, b_in_rx),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_and_sticky_eos() {
        let (mut a, mut b) = pair(1);

        a.send(vec![1]).unwrap();
        a.send(vec![2]).unwrap();
        a.send(vec![3]).unwrap();
        a.close_send();

        assert_eq!(b.recv().await.unwrap(), Some(vec![1]));
        assert_eq!(b.recv().await.unwrap(), Some(vec![2]));
        assert_eq!(b.recv().await.unwrap(), Some(vec![3]));
        assert_eq!(b.recv().await.unwrap(), None);
        // End-of-stream is idempotent: never blocks, never errors.
        assert_eq!(b.recv().await.unwrap(), None);
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_send_is_idempotent() {
        let (mut a, mut b) = pair(1);
        a.close_send();
        a.close_send();
        assert_eq!(b.recv().await.unwrap(), None);
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (mut a, _b) = pair(1);
        a.close_send();
        let err = a.send(vec![1]).unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn fail_is_sticky_on_both_sides() {
        let (mut a, mut b) = pair(1);
        a.fail(Status::internal("boom"));

        // The failing side sees its own status on receive.
        let err = a.recv().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        // The peer surfaces the same status, repeatedly.
        let err = b.recv().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(err.message(), "boom");
        let again = b.recv().await.unwrap_err();
        assert_eq!(again, err);

        // And its sends are refused after the terminal status.
        a.close_send(); // no-op, already closed by fail
        let err = a.send(vec![1]).unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn peer_drop_without_close_surfaces_cancellation() {
        let (a, mut b) = pair(1);
        drop(a);
        let err = b.recv().await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn pending_sends_drain_before_eos() {
        let (mut a, mut b) = pair(1);
        for i in 0..100u8 {
            a.send(vec![i]).unwrap();
        }
        a.close_send();
        drop(a);

        let mut received = Vec::new();
        while let Some(payload) = b.recv().await.unwrap() {
            received.push(payload[0]);
        }
        assert_eq!(received, (0..100).collect::<Vec<u8>>());
    }
}
