// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Terminal call status: a gRPC-compatible code plus a human-readable
//! message. Every call ends with exactly one of these, successful or not.

use std::fmt;

/// Status codes surfaced to clients. Numbering is gRPC-compatible so the
/// wire form stays recognizable; only the codes this crate actually emits
/// are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum Code {
    /// Success.
    #[default]
    Ok = 0,
    /// The call was cancelled, by the client or by a deadline.
    Cancelled = 1,
    /// A code this crate does not know how to interpret.
    Unknown = 2,
    /// The operation rejected its input.
    InvalidArgument = 3,
    /// The deadline expired before the call completed.
    DeadlineExceeded = 4,
    /// The call channel was used after it was closed.
    FailedPrecondition = 9,
    /// No handler is registered for the requested method.
    Unimplemented = 12,
    /// Unexpected channel or transport fault, fatal to the call.
    Internal = 13,
    /// The connection is not available.
    Unavailable = 14,
}

impl Code {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Code::Ok),
            1 => Some(Code::Cancelled),
            2 => Some(Code::Unknown),
            3 => Some(Code::InvalidArgument),
            4 => Some(Code::DeadlineExceeded),
            9 => Some(Code::FailedPrecondition),
            12 => Some(Code::Unimplemented),
            13 => Some(Code::Internal),
            14 => Some(Code::Unavailable),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Code::Ok)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Rebuild a status from its wire form. An unrecognized code maps to
    /// `Unknown` rather than failing the decode.
    pub fn from_wire(code: i32, message: impl Into<String>) -> Self {
        Self::new(Code::from_i32(code).unwrap_or(Code::Unknown), message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for code in [
            Code::Ok,
            Code::Cancelled,
            Code::Unknown,
            Code::InvalidArgument,
            Code::DeadlineExceeded,
            Code::FailedPrecondition,
            Code::Unimplemented,
            Code::Internal,
            Code::Unavailable,
        ] {
            assert_eq!(Code::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(Code::from_i32(999), None);
    }

    #[test]
    fn unknown_wire_code_is_lenient() {
        let status = Status::from_wire(999, "weird");
        assert_eq!(status.code(), Code::Unknown);
        assert_eq!(status.message(), "weird");
    }

    #[test]
    fn display() {
        assert_eq!(
            Status::invalid_argument("negative value").to_string(),
            "INVALID_ARGUMENT: negative value"
        );
        assert_eq!(Status::new(Code::Ok, "").to_string(), "OK");
    }
}
