// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Bridge wire protocol.
//!
//! Length-prefixed JSON over a byte stream. All messages are field-named
//! records so new operations and fields stay forward-compatible.
//!
//! Wire format:
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default cap on a single framed message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// The two sides the relay connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Executes operations (the device holding the calculator).
    Producer,
    /// Consumes results.
    Requester,
}

impl Role {
    /// The role on the other end of the relay.
    pub fn peer(self) -> Role {
        match self {
            Role::Producer => Role::Requester,
            Role::Requester => Role::Producer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Requester => write!(f, "requester"),
        }
    }
}

/// A typed request: which operation to run and with what parameters.
///
/// `sequence_num` is caller-assigned and must be unique among requests
/// concurrently in flight from the same origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub sequence_num: u64,
    pub function: String,
    #[serde(default)]
    pub input_parameters: Map<String, Value>,
}

/// The reply to a [`RequestEnvelope`]; echoes its sequence number and
/// function name. `return` is 0 on success; failures carry a single
/// `error` string in `output_parameters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub sequence_num: u64,
    pub function: String,
    #[serde(rename = "return")]
    pub ret: i32,
    #[serde(default)]
    pub output_parameters: Map<String, Value>,
}

impl ResponseEnvelope {
    /// Build a success response echoing the request identity.
    pub fn success(sequence_num: u64, function: &str, output_parameters: Map<String, Value>) -> Self {
        Self {
            sequence_num,
            function: function.to_string(),
            ret: 0,
            output_parameters,
        }
    }

    /// Build a failure response; the message lands under `error`.
    pub fn failure(sequence_num: u64, function: &str, message: &str) -> Self {
        let mut output_parameters = Map::new();
        output_parameters.insert("error".into(), Value::String(message.to_string()));
        Self {
            sequence_num,
            function: function.to_string(),
            ret: -1,
            output_parameters,
        }
    }

    /// True when the remote reported success.
    pub fn is_success(&self) -> bool {
        self.ret == 0
    }
}

/// Bridge protocol message types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// A peer announces its role after connecting.
    #[serde(rename = "register")]
    Register { role: Role },

    /// Relay acknowledges a registration.
    #[serde(rename = "registered")]
    Registered { role: Role },

    /// An operation request.
    #[serde(rename = "request")]
    Request(RequestEnvelope),

    /// The reply to a request.
    #[serde(rename = "response")]
    Response(ResponseEnvelope),

    /// Protocol-level notice with no sequence number to correlate.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Read one framed message.
///
/// Returns `Ok(None)` if the stream closed cleanly at a frame boundary.
pub async fn read_message<R>(
    reader: &mut R,
    max_message_size: usize,
) -> BridgeResult<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BridgeError::Io(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(BridgeError::Protocol("Empty message".into()));
    }
    if len > max_message_size {
        return Err(BridgeError::Protocol(format!(
            "Message too large: {} > {}",
            len, max_message_size
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| BridgeError::Io(e.to_string()))?;

    let msg: WireMessage = serde_json::from_slice(&body)
        .map_err(|e| BridgeError::Protocol(format!("Invalid JSON: {}", e)))?;

    Ok(Some(msg))
}

/// Write one framed message and flush.
pub async fn write_message<W>(
    writer: &mut W,
    msg: &WireMessage,
    max_message_size: usize,
) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(msg)
        .map_err(|e| BridgeError::Protocol(format!("Serialize error: {}", e)))?;

    if json.len() > max_message_size {
        return Err(BridgeError::Protocol(format!(
            "Message too large: {} > {}",
            json.len(),
            max_message_size
        )));
    }

    let len = json.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| BridgeError::Io(e.to_string()))?;
    writer
        .write_all(&json)
        .await
        .map_err(|e| BridgeError::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::Io(e.to_string()))?;

    Ok(())
}
