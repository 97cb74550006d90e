// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Error types shared across the bridge.
//!
//! Anything that happens while handling a request is converted into a
//! `return != 0` response envelope at the boundary closest to its origin;
//! none of these variants is fatal to the process.

use std::fmt;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur in the bridge core.
#[derive(Debug, Clone)]
pub enum BridgeError {
    /// A sequence number was reused while still outstanding.
    DuplicateSequence(u64),

    /// No response arrived within the deadline.
    Timeout,

    /// The transport dropped; every pending request on it fails with this.
    ConnectionClosed(String),

    /// The requested function is not in the operation registry.
    UnknownOperation(String),

    /// A required input parameter is absent.
    MissingParameter(String),

    /// The request body could not be parsed.
    MalformedRequest(String),

    /// No producer connection is registered at the relay.
    ProducerUnavailable,

    /// The computation engine reported a domain error.
    Engine(String),

    /// Transport-level I/O failure.
    Io(String),

    /// Framing or serialization failure.
    Protocol(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateSequence(seq) => {
                write!(f, "Sequence number {} is already outstanding", seq)
            }
            Self::Timeout => write!(f, "Request timed out"),
            Self::ConnectionClosed(reason) => write!(f, "Connection closed: {}", reason),
            Self::UnknownOperation(name) => write!(f, "Unknown operation: {}", name),
            Self::MissingParameter(key) => write!(f, "Missing required parameter: {}", key),
            Self::MalformedRequest(detail) => write!(f, "Malformed request: {}", detail),
            Self::ProducerUnavailable => write!(f, "Producer not connected"),
            Self::Engine(msg) => write!(f, "Engine error: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
