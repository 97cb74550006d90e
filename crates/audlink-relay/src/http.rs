// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! One-shot HTTP surface of the relay.
//!
//! `POST /api/v1/process` carries one operation request and returns exactly
//! one response envelope. The broker does the waiting; this layer only maps
//! bridge errors onto status codes: no producer connected is 503, a missed
//! deadline is 504, an unreadable body is 400.

use crate::broker::Broker;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use audlink::error::BridgeError;
use audlink::protocol::ResponseEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let code = match err {
            BridgeError::ProducerUnavailable => 503,
            BridgeError::Timeout => 504,
            BridgeError::MalformedRequest(_) => 400,
            _ => 500,
        };
        Self {
            error: err.to_string(),
            code,
        }
    }
}

/// One-shot request body. The sequence number is optional; the broker
/// correlates internally and the reply echoes whatever the caller sent.
#[derive(Deserialize)]
struct ProcessRequest {
    #[serde(default)]
    sequence_num: u64,
    function: String,
    #[serde(default)]
    input_parameters: Map<String, Value>,
}

pub fn router(broker: Arc<Broker>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/process", post(process))
        .route("/api/v1/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Serve the router until `shutdown` fires.
pub async fn serve(
    broker: Arc<Broker>,
    addr: String,
    shutdown: Arc<Notify>,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP API listening on {}", addr);

    axum::serve(listener, router(broker))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
}

/// POST /api/v1/process
async fn process(
    State(broker): State<Arc<Broker>>,
    body: Bytes,
) -> Result<Json<ResponseEnvelope>, ApiError> {
    let request: ProcessRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::from(BridgeError::MalformedRequest(e.to_string())))?;

    let mut response = broker
        .call(&request.function, request.input_parameters)
        .await?;
    response.sequence_num = request.sequence_num;

    Ok(Json(response))
}

/// GET /api/v1/health
async fn health(State(broker): State<Arc<Broker>>) -> Response {
    let stats = broker.stats().await;
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "producer_connected": stats.producer_connected,
        "requester_connected": stats.requester_connected,
        "pending_calls": stats.pending_calls,
    });
    (StatusCode::OK, Json(body)).into_response()
}
