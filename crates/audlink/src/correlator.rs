// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Request correlator: matches asynchronous responses to the requests that
//! caused them, keyed by caller-assigned sequence number.
//!
//! Each pending request owns a single-assignment completion slot (a oneshot
//! sender consumed exactly once), so resolution happens at most once no
//! matter how the race between response, timeout and disconnect falls out.
//! Responses may arrive in any order; matching is by key, not arrival.

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::ResponseEnvelope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

type Completion = oneshot::Sender<BridgeResult<ResponseEnvelope>>;

/// Per-connection table of outstanding requests.
///
/// All table operations are O(1) map mutations under a plain mutex; the
/// lock is never held across I/O or an await.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<u64, Completion>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request.
    ///
    /// Fails with [`BridgeError::DuplicateSequence`] if `sequence_num` is
    /// already outstanding on this correlator.
    pub fn register(
        self: &Arc<Self>,
        sequence_num: u64,
        ttl: Duration,
    ) -> BridgeResult<PendingRequest> {
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            if pending.contains_key(&sequence_num) {
                return Err(BridgeError::DuplicateSequence(sequence_num));
            }
            pending.insert(sequence_num, tx);
        }

        Ok(PendingRequest {
            sequence_num,
            deadline: Instant::now() + ttl,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Resolve the pending request matching `response.sequence_num`.
    ///
    /// Returns `false` when no match exists (already resolved, timed out,
    /// or never registered) — an idempotent discard, not an error.
    pub fn resolve(&self, response: ResponseEnvelope) -> bool {
        let slot = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.remove(&response.sequence_num)
        };

        match slot {
            Some(tx) => {
                // Receiver may have given up between removal and send.
                drop(tx.send(Ok(response)));
                true
            }
            None => {
                debug!(
                    "Discarding response with no pending request (seq={})",
                    response.sequence_num
                );
                false
            }
        }
    }

    /// Fail every outstanding request, e.g. when the connection drops.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(u64, Completion)> = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.drain().collect()
        };

        if !drained.is_empty() {
            debug!("Failing {} pending requests: {}", drained.len(), reason);
        }
        for (_, tx) in drained {
            drop(tx.send(Err(BridgeError::ConnectionClosed(reason.to_string()))));
        }
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").len()
    }

    /// Discard a pending entry without resolving it, e.g. when the send
    /// that was supposed to pair with it never went out.
    pub fn remove(&self, sequence_num: u64) {
        self.pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(&sequence_num);
    }
}

/// An outstanding request awaiting its response.
///
/// Exactly one of {matching response, timeout, connection closed}
/// terminates it; the entry removes itself from the table on expiry.
#[derive(Debug)]
pub struct PendingRequest {
    sequence_num: u64,
    deadline: Instant,
    rx: oneshot::Receiver<BridgeResult<ResponseEnvelope>>,
    table: Arc<Correlator>,
}

impl PendingRequest {
    pub fn sequence_num(&self) -> u64 {
        self.sequence_num
    }

    /// Await resolution, bounded by the deadline fixed at registration.
    pub async fn wait(self) -> BridgeResult<ResponseEnvelope> {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without resolution: the table was torn down.
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed("correlator dropped".into())),
            Err(_) => {
                self.table.remove(self.sequence_num);
                Err(BridgeError::Timeout)
            }
        }
    }
}
