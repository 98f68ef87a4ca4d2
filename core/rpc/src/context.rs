// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-call context handed to handlers: the method path, the optional
//! deadline and the cancellation token. Streaming handlers must observe
//! cancellation on every loop iteration.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CallContext {
    method: String,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(
        method: String,
        deadline: Option<Instant>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            method,
            deadline,
            cancellation,
        }
    }

    /// Full method path, "Service/Method".
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Non-blocking cancellation poll, the check point handlers insert into
    /// multi-iteration loops.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the call is cancelled, by the client, a deadline or
    /// server shutdown.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancellation
    }
}
