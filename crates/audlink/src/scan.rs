// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Endpoint discovery over the local network.
//!
//! A probe is a plain TCP connect with a deadline; anything that accepts is
//! reported as a candidate and the caller decides what to do with it. The
//! full scan fans out with bounded concurrency, the quick scan walks a
//! short list of likely hosts one at a time and stops at the first hit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Ports the relay is commonly served on, in probe order.
pub const COMMON_PORTS: &[u16] = &[3000, 8080, 8000, 3001, 5000, 9000];

/// Default relay port, used exclusively by the quick scan.
pub const DEFAULT_PORT: u16 = 3000;

/// Hosts worth trying before any subnet sweep: loopback, the emulator
/// host alias, and common gateway addresses.
pub const LIKELY_HOSTS: &[&str] = &["127.0.0.1", "10.0.2.2", "192.168.1.1", "192.168.0.1"];

/// Owned copy of [`LIKELY_HOSTS`] for APIs that take host lists.
pub fn likely_hosts() -> Vec<String> {
    LIKELY_HOSTS.iter().map(|h| h.to_string()).collect()
}

/// A host/port pair that accepted a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: String,
    pub port: u16,
}

impl Candidate {
    /// `host:port` form suitable for dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Scanner tunables.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Deadline for a single probe.
    pub probe_timeout: Duration,
    /// Upper bound on probes in flight at once.
    pub max_concurrent: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            max_concurrent: 5,
        }
    }
}

/// Probe one host/port. True iff a TCP connection was established within
/// the deadline; the connection is dropped immediately.
pub async fn probe(address: &str, port: u16, timeout: Duration) -> bool {
    let target = format!("{}:{}", address, port);
    match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(_stream)) => {
            debug!("Probe hit: {}", target);
            true
        }
        Ok(Err(_)) | Err(_) => false,
    }
}

/// Probe every host/port combination with at most
/// [`ScanOptions::max_concurrent`] probes in flight.
///
/// Candidates are returned in probe order (host-major, then port), not in
/// completion order, so results are stable across runs.
pub async fn scan(hosts: &[String], ports: &[u16], options: &ScanOptions) -> Vec<Candidate> {
    if hosts.is_empty() || ports.is_empty() {
        return Vec::new();
    }

    let limiter = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
    let mut tasks = JoinSet::new();

    for (host_idx, host) in hosts.iter().enumerate() {
        for (port_idx, &port) in ports.iter().enumerate() {
            let order = host_idx * ports.len() + port_idx;
            let host = host.clone();
            let timeout = options.probe_timeout;
            let limiter = Arc::clone(&limiter);

            tasks.spawn(async move {
                let _permit = limiter.acquire().await.expect("semaphore closed");
                if probe(&host, port, timeout).await {
                    Some((order, Candidate { address: host, port }))
                } else {
                    None
                }
            });
        }
    }

    let mut hits = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some(hit)) = joined {
            hits.push(hit);
        }
    }
    hits.sort_by_key(|(order, _)| *order);

    let found: Vec<Candidate> = hits.into_iter().map(|(_, c)| c).collect();
    info!(
        "Scan finished: {} candidate(s) across {} host(s)",
        found.len(),
        hosts.len()
    );
    found
}

/// Sequentially probe `hosts` on the default port and return the first hit.
///
/// Meant for the common case where the relay sits on a well-known address;
/// falls back to [`scan`] when it returns `None`.
pub async fn quick_scan(hosts: &[String], options: &ScanOptions) -> Option<Candidate> {
    for host in hosts {
        if probe(host, DEFAULT_PORT, options.probe_timeout).await {
            let candidate = Candidate {
                address: host.clone(),
                port: DEFAULT_PORT,
            };
            info!("Quick scan hit: {}", candidate);
            return Some(candidate);
        }
    }
    None
}

/// Expand a dotted /24 prefix (e.g. `192.168.1`) into its host addresses.
pub fn subnet_hosts(prefix: &str) -> Vec<String> {
    (1..=254).map(|n| format!("{}.{}", prefix, n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn options() -> ScanOptions {
        ScanOptions {
            probe_timeout: Duration::from_millis(500),
            max_concurrent: 5,
        }
    }

    #[tokio::test]
    async fn empty_input_yields_empty_result() {
        assert!(scan(&[], COMMON_PORTS, &options()).await.is_empty());
        assert!(scan(&["127.0.0.1".into()], &[], &options()).await.is_empty());
    }

    #[tokio::test]
    async fn probe_hits_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(probe("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn scan_reports_only_open_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        // A port that was just released is almost certainly closed.
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let hosts = vec!["127.0.0.1".to_string()];
        let found = scan(&hosts, &[closed, open], &options()).await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, open);
        assert_eq!(found[0].endpoint(), format!("127.0.0.1:{}", open));
    }

    #[tokio::test]
    async fn quick_scan_misses_return_none() {
        // Reserved TEST-NET address; nothing listens there.
        let hosts = vec!["192.0.2.1".to_string()];
        let opts = ScanOptions {
            probe_timeout: Duration::from_millis(100),
            max_concurrent: 5,
        };
        assert!(quick_scan(&hosts, &opts).await.is_none());
    }

    #[test]
    fn subnet_expansion_covers_the_host_range() {
        let hosts = subnet_hosts("192.168.1");
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], "192.168.1.1");
        assert_eq!(hosts[253], "192.168.1.254");
    }
}
