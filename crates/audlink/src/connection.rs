// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Client side of the persistent duplex channel.
//!
//! A [`Connection`] dials the relay, registers its role, and then runs two
//! background tasks: a writer draining an outbound queue and a reader that
//! routes inbound frames. Responses resolve the local correlator; requests
//! are answered in place by the attached dispatcher, so either side of the
//! channel can originate calls.
//!
//! Lifecycle is `Disconnected → Connecting → Open → Disconnected`; recovery
//! is an explicit [`Connection::reconnect`], never automatic. On transport
//! loss every pending request fails immediately and nothing is replayed.

use crate::correlator::Correlator;
use crate::dispatch::Dispatcher;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{
    read_message, write_message, RequestEnvelope, ResponseEnvelope, Role, WireMessage,
    MAX_MESSAGE_SIZE,
};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Delay between tearing down a stale transport and dialing the new one.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

const OUTBOUND_QUEUE: usize = 64;

/// Observable connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Reconnecting,
    Open,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Tunables for a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Per-call response deadline.
    pub call_timeout: Duration,
    /// Cap on a single framed message in either direction.
    pub max_message_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// A registered duplex channel to the relay.
pub struct Connection {
    endpoint: String,
    role: Role,
    dispatcher: Option<Arc<Dispatcher>>,
    options: ConnectOptions,
    state: Arc<Mutex<ConnectionState>>,
    correlator: Arc<Correlator>,
    outbound: mpsc::Sender<WireMessage>,
    sequence: AtomicU64,
    shutdown: Arc<Notify>,
}

impl Connection {
    /// Dial `endpoint` (`host:port`), register `role`, and start the I/O
    /// tasks. If a dispatcher is given, inbound requests are executed and
    /// answered on this connection; without one they are refused with an
    /// error response.
    pub async fn connect(
        endpoint: &str,
        role: Role,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> BridgeResult<Self> {
        Self::connect_with(endpoint, role, dispatcher, ConnectOptions::default()).await
    }

    pub async fn connect_with(
        endpoint: &str,
        role: Role,
        dispatcher: Option<Arc<Dispatcher>>,
        options: ConnectOptions,
    ) -> BridgeResult<Self> {
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        info!("Connecting to {} as {}", endpoint, role);

        let mut stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| BridgeError::Io(format!("connect {}: {}", endpoint, e)))?;

        // Role registration is part of connection establishment; the
        // channel is not Open until the relay acknowledges it.
        write_message(
            &mut stream,
            &WireMessage::Register { role },
            options.max_message_size,
        )
        .await?;
        match read_message(&mut stream, options.max_message_size).await? {
            Some(WireMessage::Registered { role: acked }) if acked == role => {}
            Some(other) => {
                return Err(BridgeError::Protocol(format!(
                    "Expected registration ack, got {:?}",
                    other
                )))
            }
            None => {
                return Err(BridgeError::ConnectionClosed(
                    "closed during registration".into(),
                ))
            }
        }

        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let correlator = Arc::new(Correlator::new());
        let shutdown = Arc::new(Notify::new());

        *state.lock().expect("state lock poisoned") = ConnectionState::Open;
        info!("Registered with {} as {}", endpoint, role);

        tokio::spawn(writer_task(
            write_half,
            outbound_rx,
            Arc::clone(&shutdown),
            options.max_message_size,
        ));
        tokio::spawn(reader_task(
            read_half,
            dispatcher.clone(),
            Arc::clone(&correlator),
            Arc::clone(&state),
            outbound.clone(),
            Arc::clone(&shutdown),
            options.max_message_size,
        ));

        Ok(Self {
            endpoint: endpoint.to_string(),
            role,
            dispatcher,
            options,
            state,
            correlator,
            outbound,
            sequence: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Outstanding calls on this connection.
    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Issue one operation call and await its response.
    ///
    /// Sequence numbers are assigned here and never reused while
    /// outstanding; responses may resolve in any order.
    pub async fn call(
        &self,
        function: &str,
        input_parameters: Map<String, Value>,
    ) -> BridgeResult<ResponseEnvelope> {
        if self.state() != ConnectionState::Open {
            return Err(BridgeError::ConnectionClosed(format!(
                "connection is {}",
                self.state()
            )));
        }

        let sequence_num = self.sequence.fetch_add(1, Ordering::Relaxed);
        let pending = self
            .correlator
            .register(sequence_num, self.options.call_timeout)?;

        let request = WireMessage::Request(RequestEnvelope {
            sequence_num,
            function: function.to_string(),
            input_parameters,
        });
        if self.outbound.send(request).await.is_err() {
            self.correlator.remove(sequence_num);
            return Err(BridgeError::ConnectionClosed("writer stopped".into()));
        }

        pending.wait().await
    }

    /// Tear down the transport. Safe to call repeatedly; pending calls
    /// fail, they are not replayed.
    pub fn close(&self) {
        *self.state.lock().expect("state lock poisoned") = ConnectionState::Disconnected;
        self.shutdown.notify_waiters();
        self.correlator.fail_all("closed by caller");
    }

    /// Explicitly rebuild the channel: close whatever transport remains,
    /// wait out [`RECONNECT_DELAY`], then dial and re-register.
    pub async fn reconnect(&mut self) -> BridgeResult<()> {
        self.close();
        *self.state.lock().expect("state lock poisoned") = ConnectionState::Reconnecting;
        info!("Reconnecting to {} in {:?}", self.endpoint, RECONNECT_DELAY);
        tokio::time::sleep(RECONNECT_DELAY).await;

        let fresh = Self::connect_with(
            &self.endpoint,
            self.role,
            self.dispatcher.clone(),
            self.options.clone(),
        )
        .await;
        match fresh {
            Ok(conn) => {
                *self = conn;
                Ok(())
            }
            Err(e) => {
                *self.state.lock().expect("state lock poisoned") = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<WireMessage>,
    shutdown: Arc<Notify>,
    max_message_size: usize,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write_message(&mut write_half, &msg, max_message_size).await {
                    warn!("Write failed: {}", e);
                    shutdown.notify_waiters();
                    break;
                }
            }
        }
    }
    use tokio::io::AsyncWriteExt;
    let _ = write_half.shutdown().await;
}

async fn reader_task(
    mut read_half: OwnedReadHalf,
    dispatcher: Option<Arc<Dispatcher>>,
    correlator: Arc<Correlator>,
    state: Arc<Mutex<ConnectionState>>,
    outbound: mpsc::Sender<WireMessage>,
    shutdown: Arc<Notify>,
    max_message_size: usize,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            result = read_message(&mut read_half, max_message_size) => match result {
                Ok(Some(WireMessage::Request(request))) => {
                    let response = match &dispatcher {
                        Some(d) => d.respond(&request),
                        None => ResponseEnvelope::failure(
                            request.sequence_num,
                            &request.function,
                            "No operation handler on this endpoint",
                        ),
                    };
                    if outbound.send(WireMessage::Response(response)).await.is_err() {
                        break;
                    }
                }
                Ok(Some(WireMessage::Response(response))) => {
                    correlator.resolve(response);
                }
                Ok(Some(WireMessage::Error { message })) => {
                    warn!("Peer error: {}", message);
                }
                Ok(Some(other)) => {
                    debug!("Ignoring unexpected message: {:?}", other);
                }
                Ok(None) => {
                    info!("Peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Read failed: {}", e);
                    break;
                }
            }
        }
    }

    *state.lock().expect("state lock poisoned") = ConnectionState::Disconnected;
    shutdown.notify_waiters();
    correlator.fail_all("connection lost");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::StubEngine;
    use tokio::net::TcpListener;

    async fn accept_registered(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        match read_message(&mut stream, MAX_MESSAGE_SIZE).await.unwrap() {
            Some(WireMessage::Register { role }) => {
                write_message(
                    &mut stream,
                    &WireMessage::Registered { role },
                    MAX_MESSAGE_SIZE,
                )
                .await
                .unwrap();
            }
            other => panic!("Expected register, got {:?}", other),
        }
        stream
    }

    #[tokio::test]
    async fn call_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut stream = accept_registered(&listener).await;
            match read_message(&mut stream, MAX_MESSAGE_SIZE).await.unwrap() {
                Some(WireMessage::Request(req)) => {
                    let resp = ResponseEnvelope::success(
                        req.sequence_num,
                        &req.function,
                        Map::new(),
                    );
                    write_message(&mut stream, &WireMessage::Response(resp), MAX_MESSAGE_SIZE)
                        .await
                        .unwrap();
                }
                other => panic!("Expected request, got {:?}", other),
            }
        });

        let conn = Connection::connect(&addr.to_string(), Role::Requester, None)
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);

        let resp = conn.call("dllVersion", Map::new()).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.function, "dllVersion");
        assert_eq!(conn.pending_count(), 0);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn transport_loss_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut stream = accept_registered(&listener).await;
            // Swallow the request, then drop the socket without replying.
            let _ = read_message(&mut stream, MAX_MESSAGE_SIZE).await;
        });

        let options = ConnectOptions {
            call_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let conn =
            Connection::connect_with(&addr.to_string(), Role::Requester, None, options)
                .await
                .unwrap();

        let err = conn.call("GetMLE", Map::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionClosed(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_request_answered_by_dispatcher() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dispatcher = Arc::new(Dispatcher::new(Arc::new(StubEngine::new())));
        let conn = tokio::spawn(async move {
            Connection::connect(&addr.to_string(), Role::Producer, Some(dispatcher))
                .await
                .unwrap()
        });

        let mut stream = accept_registered(&listener).await;
        let request = RequestEnvelope {
            sequence_num: 12,
            function: "dllVersion".into(),
            input_parameters: Map::new(),
        };
        write_message(
            &mut stream,
            &WireMessage::Request(request),
            MAX_MESSAGE_SIZE,
        )
        .await
        .unwrap();

        match read_message(&mut stream, MAX_MESSAGE_SIZE).await.unwrap() {
            Some(WireMessage::Response(resp)) => {
                assert_eq!(resp.sequence_num, 12);
                assert!(resp.is_success());
            }
            other => panic!("Expected response, got {:?}", other),
        }
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_request_without_dispatcher_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = tokio::spawn(async move {
            Connection::connect(&addr.to_string(), Role::Requester, None)
                .await
                .unwrap()
        });

        let mut stream = accept_registered(&listener).await;
        let request = RequestEnvelope {
            sequence_num: 4,
            function: "dllVersion".into(),
            input_parameters: Map::new(),
        };
        write_message(
            &mut stream,
            &WireMessage::Request(request),
            MAX_MESSAGE_SIZE,
        )
        .await
        .unwrap();

        match read_message(&mut stream, MAX_MESSAGE_SIZE).await.unwrap() {
            Some(WireMessage::Response(resp)) => {
                assert_eq!(resp.sequence_num, 4);
                assert_eq!(resp.ret, -1);
            }
            other => panic!("Expected response, got {:?}", other),
        }
        let _ = conn.await.unwrap();
    }

    #[tokio::test]
    async fn call_after_close_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let _stream = accept_registered(&listener).await;
        });

        let conn = Connection::connect(&addr.to_string(), Role::Requester, None)
            .await
            .unwrap();
        conn.close();
        conn.close(); // idempotent

        let err = conn.call("dllVersion", Map::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionClosed(_)));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_builds_a_fresh_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: registered, then dropped by the server.
            drop(accept_registered(&listener).await);
            // Second connection: serve one call.
            let mut stream = accept_registered(&listener).await;
            if let Some(WireMessage::Request(req)) =
                read_message(&mut stream, MAX_MESSAGE_SIZE).await.unwrap()
            {
                let resp =
                    ResponseEnvelope::success(req.sequence_num, &req.function, Map::new());
                write_message(&mut stream, &WireMessage::Response(resp), MAX_MESSAGE_SIZE)
                    .await
                    .unwrap();
            }
        });

        let mut conn = Connection::connect(&addr.to_string(), Role::Requester, None)
            .await
            .unwrap();

        conn.reconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);

        let resp = conn.call("dllVersion", Map::new()).await.unwrap();
        assert!(resp.is_success());

        server.await.unwrap();
    }
}
