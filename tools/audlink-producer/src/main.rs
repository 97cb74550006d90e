// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Audlink producer daemon.
//!
//! Runs on the device holding the fitting calculator. Finds the relay
//! (explicit address, saved config, or a network scan), registers as the
//! producer on the bridge channel, and answers every operation request
//! that arrives. Also serves a local HTTP API for one-shot calls that
//! skip the relay.
//!
//! # Usage
//!
//! ```bash
//! # Explicit relay address
//! audlink-producer --relay 192.168.1.40:3000
//!
//! # Saved endpoint, scanning the subnet when the file is missing
//! audlink-producer --config endpoint.json --scan-prefix 192.168.1
//!
//! # Keep re-registering after connection loss
//! audlink-producer --relay 192.168.1.40:3000 --reconnect
//! ```

use audlink::config::EndpointConfig;
use audlink::connection::{Connection, ConnectionState};
use audlink::dispatch::{Dispatcher, StubEngine};
use audlink::protocol::Role;
use audlink::scan::{self, Candidate, ScanOptions, COMMON_PORTS};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod api;

/// Audlink producer daemon - serves fitting calculations over the bridge
#[derive(Parser, Debug)]
#[command(name = "audlink-producer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address (host:port); skips config and scanning
    #[arg(short, long)]
    relay: Option<String>,

    /// Endpoint config file (JSON); updated after a successful scan
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subnet prefix to scan when no endpoint is known (e.g. 192.168.1)
    #[arg(long)]
    scan_prefix: Option<String>,

    /// Local HTTP API port
    #[arg(long, default_value = "8080")]
    http_port: u16,

    /// Local HTTP API bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Re-register with the relay after connection loss
    #[arg(long)]
    reconnect: bool,

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
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Audlink producer v{}", env!("CARGO_PKG_VERSION"));

    let dispatcher = Arc::new(Dispatcher::new(Arc::new(StubEngine::new())));
    info!(
        "Operation registry loaded: {} operations",
        dispatcher.registry().len()
    );

    // Local one-shot API runs regardless of relay reachability.
    let api_state = Arc::new(api::ApiState {
        dispatcher: Arc::clone(&dispatcher),
        server_name: "audlink-producer".into(),
    });
    let api_addr = format!("{}:{}", args.bind, args.http_port);
    tokio::spawn(api::serve(api_state, api_addr));

    let endpoint = resolve_endpoint(&args).await?;
    info!("Using relay at {}", endpoint);

    let mut connection =
        Connection::connect(&endpoint, Role::Producer, Some(Arc::clone(&dispatcher))).await?;
    info!("Registered as producer");

    tokio::spawn(async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        std::process::exit(0);
    });

    // Watch the channel; with --reconnect, re-register whenever it drops.
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if connection.state() == ConnectionState::Open {
            continue;
        }

        if !args.reconnect {
            warn!("Bridge channel lost; exiting (run with --reconnect to stay up)");
            break;
        }

        match connection.reconnect().await {
            Ok(()) => info!("Re-registered with {}", endpoint),
            Err(e) => warn!("Reconnect failed: {} (will retry)", e),
        }
    }

    Ok(())
}

/// Determine the relay endpoint: explicit flag, then saved config, then a
/// network scan (quick pass on the default port first, full port sweep as
/// fallback).
async fn resolve_endpoint(args: &Args) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(relay) = &args.relay {
        return Ok(relay.clone());
    }

    if let Some(path) = &args.config {
        if path.exists() {
            let config = EndpointConfig::from_file(path)?;
            config.validate()?;
            info!("Loaded saved endpoint {}", config.endpoint());
            return Ok(config.endpoint());
        }
    }

    let options = ScanOptions::default();

    let Some(prefix) = &args.scan_prefix else {
        info!("No endpoint configured; probing likely hosts");
        let candidate = scan::quick_scan(&scan::likely_hosts(), &options)
            .await
            .ok_or("No relay found; pass --relay or --scan-prefix")?;
        info!("Found relay at {}", candidate);
        if let Some(path) = &args.config {
            save_endpoint(path, &candidate);
        }
        return Ok(candidate.endpoint());
    };

    info!("Scanning {}.0/24 for a relay", prefix);
    let hosts = scan::subnet_hosts(prefix);

    let candidate = match scan::quick_scan(&hosts, &options).await {
        Some(hit) => hit,
        None => {
            info!("Quick scan found nothing; sweeping common ports");
            scan::scan(&hosts, COMMON_PORTS, &options)
                .await
                .into_iter()
                .next()
                .ok_or("No relay found on the subnet")?
        }
    };
    info!("Found relay at {}", candidate);

    if let Some(path) = &args.config {
        save_endpoint(path, &candidate);
    }
    Ok(candidate.endpoint())
}

fn save_endpoint(path: &PathBuf, candidate: &Candidate) {
    let config = EndpointConfig {
        address: candidate.address.clone(),
        port: candidate.port,
        ..Default::default()
    };
    match config.to_file(path) {
        Ok(()) => info!("Saved endpoint to {:?}", path),
        Err(e) => warn!("Could not save endpoint: {}", e),
    }
}
