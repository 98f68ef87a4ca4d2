// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire frames.
//!
//! One TCP connection carries many concurrent calls. Every length-delimited
//! frame on the wire is a bincode-encoded [`WireFrame`]: a call id plus one
//! [`Frame`]. Per-call FIFO order falls out of TCP ordering plus per-call
//! queues on both ends; nothing reorders or coalesces.

use bytes::Bytes;
use futures::SinkExt;
use futures::stream::SplitSink;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Maximum accepted frame size, including the encoded envelope.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// One protocol event on a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Client opens a call to `method` ("Service/Method"), optionally with a
    /// deadline relative to now.
    Open {
        method: String,
        deadline_ms: Option<u64>,
    },
    /// One request or response message, opaque to this layer.
    Message { payload: Vec<u8> },
    /// The sender is done sending in its direction.
    Close,
    /// Terminal status; after this, no further frames in either direction.
    /// A `Cancelled` status from the client doubles as the cancellation
    /// signal observed by the server handler.
    Status { code: i32, message: String },
}

/// A frame tagged with the call it belongs to. Call ids are allocated by the
/// client and unique per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub call_id: u64,
    pub frame: Frame,
}

/// Faults at the framing layer. These are transport errors: fatal to the
/// connection, surfaced to calls as `Internal` statuses.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode(frame: &WireFrame) -> Result<Bytes, WireError> {
    let buf = bincode::serde::encode_to_vec(frame, bincode::config::standard())?;
    Ok(Bytes::from(buf))
}

pub fn decode(buf: &[u8]) -> Result<WireFrame, WireError> {
    let (frame, _) = bincode::serde::decode_from_slice(buf, bincode::config::standard())?;
    Ok(frame)
}

/// Wrap a TCP stream in the length-delimited framing both ends speak.
pub fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(
        stream,
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec(),
    )
}

/// Writer task shared by both ends: drain the outbound queue into the sink
/// until the queue closes or the peer goes away.
pub(crate) async fn write_frames(
    mut sink: SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
    mut out_rx: mpsc::UnboundedReceiver<WireFrame>,
) {
    while let Some(wire) = out_rx.recv().await {
        let bytes = match encode(&wire) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(%e, "dropping unencodable frame");
                continue;
            }
        };
        if sink.send(bytes).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_variants() {
        let frames = [
            WireFrame {
                call_id: 1,
                frame: Frame::Open {
                    method: "Calculator/Add".to_string(),
                    deadline_ms: Some(30_000),
                },
            },
            WireFrame {
                call_id: 2,
                frame: Frame::Message {
                    payload: vec![1, 2, 3],
                },
            },
            WireFrame {
                call_id: 3,
                frame: Frame::Close,
            },
            WireFrame {
                call_id: u64::MAX,
                frame: Frame::Status {
                    code: 3,
                    message: "bad input".to_string(),
                },
            },
        ];

        for frame in frames {
            let bytes = encode(&frame).unwrap();
            assert_eq!(decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(decode(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
