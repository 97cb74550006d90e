// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Audlink relay broker.
//!
//! Pairs the device holding the fitting calculator (the producer) with its
//! LAN clients (requesters). Runs two surfaces: a TCP bridge for the
//! persistent duplex channel and an HTTP API for one-shot calls.
//!
//! # Usage
//!
//! ```bash
//! # Start with default ports (TCP 3000, HTTP 3001)
//! audlink-relay
//!
//! # Custom ports and config
//! audlink-relay --tcp-port 4000 --http-port 4001 --config broker.json
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod broker;
mod config;
mod http;
mod server;

pub use config::BrokerConfig;
pub use server::RelayServer;

/// Audlink relay broker - pairs the fitting calculator with LAN clients
#[derive(Parser, Debug)]
#[command(name = "audlink-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port for the bridge channel
    #[arg(short, long, default_value = "3000")]
    tcp_port: u16,

    /// HTTP port for the one-shot API
    #[arg(long, default_value = "3001")]
    http_port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Deadline for a one-shot call in seconds
    #[arg(long, default_value = "30")]
    call_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        BrokerConfig::from_file(&config_path)?
    } else {
        BrokerConfig {
            bind_address: args.bind.parse()?,
            tcp_port: args.tcp_port,
            http_port: args.http_port,
            call_timeout_secs: args.call_timeout,
            ..Default::default()
        }
    };

    info!("+----------------------------------------------------+");
    info!(
        "|        Audlink Relay v{}                        |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!(
        "|  Bridge:  {:40} |",
        format!("{}:{}", config.bind_address, config.tcp_port)
    );
    info!(
        "|  HTTP:    {:40} |",
        format!("{}:{}", config.bind_address, config.http_port)
    );
    info!(
        "|  Timeout: {:40} |",
        format!("{}s", config.call_timeout_secs)
    );
    info!("+----------------------------------------------------+");

    let http_addr = format!("{}:{}", config.bind_address, config.http_port);
    let server = RelayServer::new(config)?;

    let http_shutdown = Arc::new(tokio::sync::Notify::new());
    let http_task = tokio::spawn(http::serve(
        server.broker(),
        http_addr.clone(),
        Arc::clone(&http_shutdown),
    ));

    let server_handle = server.clone();
    let signal_shutdown = Arc::clone(&http_shutdown);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping relay...");
        server_handle.shutdown();
        signal_shutdown.notify_waiters();
    });

    server.run().await?;
    http_shutdown.notify_waiters();
    http_task.await??;

    info!("Relay stopped");
    Ok(())
}
