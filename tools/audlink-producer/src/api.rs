// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Local HTTP API of the producer daemon.
//!
//! Serves one-shot calculation calls directly against the in-process
//! dispatcher, bypassing the relay entirely. Useful for clients on the
//! same network segment as the device and for checking the daemon is
//! alive.

use audlink::dispatch::Dispatcher;
use audlink::protocol::ResponseEnvelope;
use audlink::single;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub server_name: String,
}

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/process", post(process))
        .route("/api/status", get(status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<ApiState>, addr: String) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Local API listening on {}", addr);
    axum::serve(listener, router(state)).await
}

/// POST /api/process
///
/// One request in, exactly one response envelope out; a body that does
/// not parse still gets a failure envelope rather than a bare status.
async fn process(State(state): State<Arc<ApiState>>, body: Bytes) -> Json<ResponseEnvelope> {
    Json(single::handle_body(&state.dispatcher, &body))
}

/// GET /api/status
async fn status(State(state): State<Arc<ApiState>>) -> Response {
    let body = serde_json::json!({
        "status": "ok",
        "server": state.server_name,
        "version": env!("CARGO_PKG_VERSION"),
        "operations": state.dispatcher.registry().len(),
    });
    (StatusCode::OK, Json(body)).into_response()
}
