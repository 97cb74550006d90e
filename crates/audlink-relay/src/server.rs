// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! TCP front of the relay: accepts bridge connections, runs the
//! registration handshake, and pumps frames between the socket and the
//! broker's role slots.

use crate::broker::Broker;
use crate::config::BrokerConfig;
use audlink::protocol::{read_message, write_message, Role, WireMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// The relay's duplex-channel server.
#[derive(Clone)]
pub struct RelayServer {
    config: Arc<BrokerConfig>,
    broker: Arc<Broker>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl RelayServer {
    pub fn new(config: BrokerConfig) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let broker = Arc::new(Broker::new(config.call_timeout()));
        Ok(Self {
            config: Arc::new(config),
            broker,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the server to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Accept and serve bridge connections until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = format!("{}:{}", self.config.bind_address, self.config.tcp_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        info!("Relay listening on {}", addr);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            info!("New connection from {}", peer_addr);
                            let broker = Arc::clone(&self.broker);
                            let config = Arc::clone(&self.config);
                            let shutdown = Arc::clone(&self.shutdown);

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, broker, config, shutdown).await
                                {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Bind on an ephemeral port and return it together with the running
    /// server task. Test support.
    #[cfg(test)]
    pub async fn spawn_ephemeral() -> (Self, u16) {
        let config = BrokerConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            tcp_port: 0,
            ..Default::default()
        };
        // Port 0 fails validation on purpose; build the parts by hand.
        let broker = Arc::new(Broker::new(config.call_timeout()));
        let server = Self {
            config: Arc::new(config),
            broker,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = server.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        let broker = Arc::clone(&accept.broker);
                        let config = Arc::clone(&accept.config);
                        let shutdown = Arc::clone(&accept.shutdown);
                        tokio::spawn(async move {
                            let _ = handle_connection(stream, broker, config, shutdown).await;
                        });
                    }
                    _ = accept.shutdown.notified() => break,
                }
            }
        });

        (server, port)
    }
}

/// Serve one bridge connection from registration to teardown.
async fn handle_connection(
    mut stream: TcpStream,
    broker: Arc<Broker>,
    config: Arc<BrokerConfig>,
    shutdown: Arc<Notify>,
) -> Result<(), ServerError> {
    let max = config.max_message_size;

    // First frame must be a registration.
    let role = match read_message(&mut stream, max).await {
        Ok(Some(WireMessage::Register { role })) => role,
        Ok(Some(other)) => {
            let notice = WireMessage::Error {
                message: "Expected registration".into(),
            };
            let _ = write_message(&mut stream, &notice, max).await;
            return Err(ServerError::Protocol(format!(
                "First message was {:?}, not register",
                other
            )));
        }
        Ok(None) => return Ok(()),
        Err(e) => return Err(ServerError::Protocol(e.to_string())),
    };

    write_message(&mut stream, &WireMessage::Registered { role }, max)
        .await
        .map_err(|e| ServerError::Io(e.to_string()))?;

    let mut grant = broker.register(role).await;
    let generation = grant.generation;

    loop {
        tokio::select! {
            result = read_message(&mut stream, max) => {
                match result {
                    Ok(Some(WireMessage::Request(request))) => {
                        if let Some(response) = broker.route_request(role, request).await {
                            // Peer missing; answer the originator directly.
                            if write_message(&mut stream, &WireMessage::Response(response), max)
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Ok(Some(WireMessage::Response(response))) => {
                        broker.route_response(response).await;
                    }
                    Ok(Some(WireMessage::Register { .. })) => {
                        let notice = WireMessage::Error {
                            message: "Already registered".into(),
                        };
                        if write_message(&mut stream, &notice, max).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(other)) => {
                        debug!("Ignoring unexpected message from {}: {:?}", role, other);
                    }
                    Ok(None) => {
                        info!("{} connection closed", role);
                        break;
                    }
                    Err(e) => {
                        warn!("Read error on {} connection: {}", role, e);
                        break;
                    }
                }
            }
            outbound = grant.outbound.recv() => {
                let Some(msg) = outbound else { break };
                if let Err(e) = write_message(&mut stream, &msg, max).await {
                    warn!("Write error on {} connection: {}", role, e);
                    break;
                }
            }
            _ = grant.evicted.notified() => {
                info!("{} connection evicted by a newer registration", role);
                let notice = WireMessage::Error {
                    message: format!("Replaced by a newer {} connection", role),
                };
                let _ = write_message(&mut stream, &notice, max).await;
                break;
            }
            _ = shutdown.notified() => {
                debug!("{} connection handler shutting down", role);
                break;
            }
        }
    }

    broker.deregister(role, generation).await;
    Ok(())
}

/// Server error types.
#[derive(Debug)]
pub enum ServerError {
    Config(String),
    Bind(String),
    AlreadyRunning,
    Io(String),
    Protocol(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "Configuration error: {}", s),
            Self::Bind(s) => write!(f, "Bind error: {}", s),
            Self::AlreadyRunning => write!(f, "Server already running"),
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(s) => write!(f, "Protocol error: {}", s),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
