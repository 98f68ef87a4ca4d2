// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Streaming RPC substrate.
//!
//! One TCP connection multiplexes any number of concurrent calls, each of
//! which follows one of four interaction patterns: unary, server-stream,
//! client-stream or bidi-stream. The call channel, the server-side pattern
//! dispatch and the client-side pattern drivers live here; payloads are
//! opaque encoded messages.

pub mod channel;
pub mod client;
pub mod codec;
pub mod context;
pub mod frame;
pub mod server;
pub mod status;

pub use channel::{CallChannel, CallReceiver, CallSender};
pub use client::Channel;
pub use codec::{Decoder, Encoder};
pub use context::CallContext;
pub use server::{RequestStream, ResponseStream, Server, ServiceRegistry};
pub use status::{Code, Status};
