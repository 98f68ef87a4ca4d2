// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Request and response payloads for the calculator operations. Plain serde
//! structs; the RPC layer treats them as opaque bincode-encoded bytes.

use serde::{Deserialize, Serialize};

/// Request for `Add` and `SlowAdd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddResponse {
    pub sum: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquareRootRequest {
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SquareRootResponse {
    pub root: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorizeRequest {
    pub value: u64,
}

/// One prime factor; factors arrive in non-decreasing order with
/// multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorizeResponse {
    pub factor: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AverageRequest {
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AverageResponse {
    pub average: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningMaxRequest {
    pub value: i64,
}

/// Running maximum over the requests received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningMaxResponse {
    pub max: i64,
}
