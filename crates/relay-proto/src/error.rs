// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error taxonomy carried inside ERROR envelopes.
///
/// Renders `http_status`/`grpc_code`-style severity mapping as a plain
/// `fatal` classification instead, since this relay has no HTTP or gRPC
/// surface of its own — only the framed Unix-socket envelope stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Protocol,
    Transport,
    Storage,
    NotFound,
    Timeout,
    Cancelled,
    Backpressure,
    Internal,
}

impl ErrorCode {
    /// Whether an error of this kind always closes the connection it
    /// travels on.
    pub fn fatal(&self) -> bool {
        matches!(self, Self::Protocol)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Protocol => "PROTOCOL",
            Self::Transport => "TRANSPORT",
            Self::Storage => "STORAGE",
            Self::NotFound => "NOT_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Backpressure => "BACKPRESSURE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
