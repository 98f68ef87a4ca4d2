// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Calculator service on top of the `calcrpc` streaming-RPC substrate:
//! message types, operation handlers and the glue used by the `calc-server`
//! and `calc-client` binaries.

pub mod messages;
pub mod service;

pub use service::{CalculatorConfig, SERVICE_NAME, register};
