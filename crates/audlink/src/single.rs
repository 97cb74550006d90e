// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Independent one-request-one-response adapter.
//!
//! The entry points here serve transports with no persistent channel and no
//! correlation: each call carries one request body and must get exactly one
//! response back, success or not. Malformed input still produces a response
//! that echoes whatever request identity could be salvaged.
//!
//! The exactly-once guarantee is type-level: a [`ReplyToken`] wraps a
//! single-use completion slot and [`ReplyToken::send`] consumes it, so a
//! handler cannot answer twice and forgetting to answer shows up as a
//! dropped token on the receiving side.

use crate::dispatch::Dispatcher;
use crate::protocol::{RequestEnvelope, ResponseEnvelope};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

/// Single-use slot for the one response a call is owed.
pub struct ReplyToken {
    tx: oneshot::Sender<ResponseEnvelope>,
}

impl ReplyToken {
    /// Deliver the response, consuming the token.
    ///
    /// Returns `false` when the caller stopped waiting.
    pub fn send(self, response: ResponseEnvelope) -> bool {
        self.tx.send(response).is_ok()
    }
}

/// Create a token and the receiver its response arrives on.
pub fn reply_channel() -> (ReplyToken, oneshot::Receiver<ResponseEnvelope>) {
    let (tx, rx) = oneshot::channel();
    (ReplyToken { tx }, rx)
}

/// Execute one parsed request. Infallible by construction: dispatch
/// failures come back as `return != 0` responses.
pub fn handle_request(dispatcher: &Dispatcher, request: &RequestEnvelope) -> ResponseEnvelope {
    dispatcher.respond(request)
}

/// Execute one raw request body.
///
/// A body that fails to parse is answered with a failure response carrying
/// the sequence number and function name if they were readable, zero and
/// empty otherwise.
pub fn handle_body(dispatcher: &Dispatcher, body: &[u8]) -> ResponseEnvelope {
    match serde_json::from_slice::<RequestEnvelope>(body) {
        Ok(request) => dispatcher.respond(&request),
        Err(e) => {
            warn!("Malformed request body: {}", e);
            let (sequence_num, function) = salvage_identity(body);
            ResponseEnvelope::failure(
                sequence_num,
                &function,
                &format!("Malformed request: {}", e),
            )
        }
    }
}

/// Execute one raw body and deliver the response through `token`.
pub fn respond_once(dispatcher: &Dispatcher, body: &[u8], token: ReplyToken) {
    let response = handle_body(dispatcher, body);
    if !token.send(response) {
        warn!("Caller gave up before the response was ready");
    }
}

/// Best-effort read of the request identity from an otherwise unusable
/// body, so the failure response still correlates when possible.
fn salvage_identity(body: &[u8]) -> (u64, String) {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => {
            let sequence_num = value
                .get("sequence_num")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let function = value
                .get("function")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            (sequence_num, function)
        }
        Err(_) => (0, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::StubEngine;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(StubEngine::new()))
    }

    #[test]
    fn valid_body_gets_success_response() {
        let body = serde_json::to_vec(&json!({
            "sequence_num": 3,
            "function": "dllVersion",
            "input_parameters": {}
        }))
        .unwrap();

        let response = handle_body(&dispatcher(), &body);
        assert_eq!(response.sequence_num, 3);
        assert_eq!(response.function, "dllVersion");
        assert!(response.is_success());
    }

    #[test]
    fn garbage_body_still_gets_a_response() {
        let response = handle_body(&dispatcher(), b"not json at all");
        assert_eq!(response.ret, -1);
        assert_eq!(response.sequence_num, 0);
        assert!(response.output_parameters["error"]
            .as_str()
            .unwrap()
            .contains("Malformed"));
    }

    #[test]
    fn partial_body_echoes_salvaged_identity() {
        // Parses as JSON but not as a request (sequence_num is a string).
        let body = br#"{"sequence_num": "nine", "function": "GetMLE"}"#;
        let response = handle_body(&dispatcher(), body);
        assert_eq!(response.ret, -1);
        assert_eq!(response.sequence_num, 0);
        assert_eq!(response.function, "GetMLE");
    }

    #[tokio::test]
    async fn token_delivers_exactly_one_response() {
        let (token, rx) = reply_channel();
        let body = serde_json::to_vec(&json!({
            "sequence_num": 8,
            "function": "SetGender",
            "input_parameters": {"gender": 1}
        }))
        .unwrap();

        respond_once(&dispatcher(), &body, token);

        let response = rx.await.unwrap();
        assert_eq!(response.sequence_num, 8);
        assert!(response.is_success());
        assert_eq!(response.output_parameters["success"], json!(true));
    }

    #[test]
    fn send_to_dropped_receiver_reports_false() {
        let (token, rx) = reply_channel();
        drop(rx);
        let response = ResponseEnvelope::success(1, "dllVersion", Map::new());
        assert!(!token.send(response));
    }
}
