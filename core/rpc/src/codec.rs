// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Codec traits for message payloads.
//!
//! The RPC layer treats every payload as an opaque byte vector; these traits
//! are the seam between typed messages and that byte form. Any serde type
//! gets both for free via bincode.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Status;

/// Encode a message to bytes.
pub trait Encoder {
    fn encode(&self) -> Result<Vec<u8>, Status>;
}

/// Decode a message from bytes.
pub trait Decoder: Sized {
    fn decode(buf: &[u8]) -> Result<Self, Status>;
}

impl<T: Serialize> Encoder for T {
    fn encode(&self) -> Result<Vec<u8>, Status> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| Status::internal(format!("failed to encode message: {e}")))
    }
}

impl<T: DeserializeOwned> Decoder for T {
    fn decode(buf: &[u8]) -> Result<Self, Status> {
        bincode::serde::decode_from_slice(buf, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(|e| Status::internal(format!("failed to decode message: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct TestMessage {
        text: String,
        value: i64,
    }

    #[test]
    fn roundtrip() {
        let msg = TestMessage {
            text: "hello".to_string(),
            value: -42,
        };
        let bytes = msg.encode().unwrap();
        let back = TestMessage::decode(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn decode_garbage_is_an_error() {
        let err = TestMessage::decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err.code(), crate::Code::Internal);
    }
}
