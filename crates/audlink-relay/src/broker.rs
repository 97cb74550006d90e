// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Role-slot router at the heart of the relay.
//!
//! The broker holds at most one live connection per role. Registering a
//! role that is already occupied evicts the previous holder: its handler is
//! told to close and the slot is handed to the newcomer, so a device that
//! reconnects never finds itself locked out by its own stale socket.
//!
//! Traffic routing is by role: a request from one side goes to the other
//! side's slot, and a response first tries the broker's own correlator
//! (calls that entered over HTTP), then the requester slot, and is
//! otherwise discarded. When the target slot is empty the broker answers
//! the originator itself with a failure response carrying the request's
//! sequence number, so callers are told immediately instead of waiting out
//! a timeout.

use audlink::correlator::Correlator;
use audlink::error::{BridgeError, BridgeResult};
use audlink::protocol::{RequestEnvelope, ResponseEnvelope, Role, WireMessage};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

/// Sequence range reserved for broker-originated calls. Forwarded traffic
/// keeps its caller-assigned numbers, which stay far below this, so the two
/// spaces cannot collide at the producer.
const LOCAL_SEQUENCE_BASE: u64 = 1 << 48;

const SLOT_QUEUE: usize = 64;

/// What a handler receives when it claims a role slot.
pub struct SlotGrant {
    /// Identifies this occupancy; cleanup is a no-op if the slot has been
    /// handed to a newer connection since.
    pub generation: u64,
    /// Messages the broker wants written to this connection.
    pub outbound: mpsc::Receiver<WireMessage>,
    /// Signalled when a newer connection takes the slot.
    pub evicted: Arc<Notify>,
}

struct RoleSlot {
    sender: mpsc::Sender<WireMessage>,
    generation: u64,
    evicted: Arc<Notify>,
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BrokerStats {
    pub producer_connected: bool,
    pub requester_connected: bool,
    pub pending_calls: usize,
    pub forwarded_requests: u64,
    pub forwarded_responses: u64,
    pub local_calls: u64,
    pub evictions: u64,
}

pub struct Broker {
    slots: RwLock<HashMap<Role, RoleSlot>>,
    correlator: Arc<Correlator>,
    call_timeout: Duration,
    sequence: AtomicU64,
    generations: AtomicU64,
    forwarded_requests: AtomicU64,
    forwarded_responses: AtomicU64,
    local_calls: AtomicU64,
    evictions: AtomicU64,
}

impl Broker {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            correlator: Arc::new(Correlator::new()),
            call_timeout,
            sequence: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            forwarded_requests: AtomicU64::new(0),
            forwarded_responses: AtomicU64::new(0),
            local_calls: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Claim the slot for `role`, evicting any current holder.
    pub async fn register(&self, role: Role) -> SlotGrant {
        let (sender, outbound) = mpsc::channel(SLOT_QUEUE);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let evicted = Arc::new(Notify::new());

        let previous = {
            let mut slots = self.slots.write().await;
            slots.insert(
                role,
                RoleSlot {
                    sender,
                    generation,
                    evicted: Arc::clone(&evicted),
                },
            )
        };

        if let Some(old) = previous {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!("Evicting previous {} connection (gen {})", role, old.generation);
            // notify_one stores a permit, so the handler sees the eviction
            // even if it is mid-read when the slot changes hands.
            old.evicted.notify_one();
        } else {
            info!("Registered {} connection (gen {})", role, generation);
        }

        SlotGrant {
            generation,
            outbound,
            evicted,
        }
    }

    /// Release the slot for `role`, but only if `generation` still holds
    /// it. A handler cleaning up after eviction must not tear down its
    /// replacement.
    pub async fn deregister(&self, role: Role, generation: u64) {
        let mut slots = self.slots.write().await;
        if slots.get(&role).is_some_and(|s| s.generation == generation) {
            slots.remove(&role);
            info!("Deregistered {} connection (gen {})", role, generation);
        }
    }

    /// Route a request from `from` to its peer slot.
    ///
    /// Returns `Some(response)` when the peer is not connected (or went
    /// away mid-send); the caller writes that response back on the
    /// originating connection. `None` means the request was forwarded
    /// verbatim.
    pub async fn route_request(
        &self,
        from: Role,
        request: RequestEnvelope,
    ) -> Option<ResponseEnvelope> {
        let target = from.peer();
        let sender = {
            let slots = self.slots.read().await;
            slots.get(&target).map(|s| s.sender.clone())
        };

        let Some(sender) = sender else {
            debug!(
                "No {} connected for request seq={} ({})",
                target, request.sequence_num, request.function
            );
            return Some(peer_unavailable(&request, target));
        };

        match sender.send(WireMessage::Request(request.clone())).await {
            Ok(()) => {
                self.forwarded_requests.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(_) => Some(peer_unavailable(&request, target)),
        }
    }

    /// Route a response from the producer side.
    ///
    /// Broker-originated calls match the local correlator; everything else
    /// is forwarded to the requester slot. A response matching neither is
    /// logged and dropped.
    pub async fn route_response(&self, response: ResponseEnvelope) {
        if self.correlator.resolve(response.clone()) {
            return;
        }

        let sender = {
            let slots = self.slots.read().await;
            slots.get(&Role::Requester).map(|s| s.sender.clone())
        };
        match sender {
            Some(sender) => {
                if sender
                    .send(WireMessage::Response(response))
                    .await
                    .is_ok()
                {
                    self.forwarded_responses.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                warn!(
                    "Dropping response with no destination (seq={})",
                    response.sequence_num
                );
            }
        }
    }

    /// Synchronous call into the producer, used by the HTTP surface.
    ///
    /// Fails fast with [`BridgeError::ProducerUnavailable`] when no
    /// producer is connected; otherwise waits up to the configured call
    /// deadline for the matching response.
    pub async fn call(
        &self,
        function: &str,
        input_parameters: Map<String, Value>,
    ) -> BridgeResult<ResponseEnvelope> {
        let sender = {
            let slots = self.slots.read().await;
            slots.get(&Role::Producer).map(|s| s.sender.clone())
        };
        let Some(sender) = sender else {
            return Err(BridgeError::ProducerUnavailable);
        };

        let sequence_num = LOCAL_SEQUENCE_BASE + self.sequence.fetch_add(1, Ordering::Relaxed);
        let pending = self.correlator.register(sequence_num, self.call_timeout)?;

        let request = WireMessage::Request(RequestEnvelope {
            sequence_num,
            function: function.to_string(),
            input_parameters,
        });
        if sender.send(request).await.is_err() {
            self.correlator.remove(sequence_num);
            return Err(BridgeError::ProducerUnavailable);
        }
        self.local_calls.fetch_add(1, Ordering::Relaxed);

        pending.wait().await
    }

    pub async fn connected(&self, role: Role) -> bool {
        self.slots.read().await.contains_key(&role)
    }

    pub async fn stats(&self) -> BrokerStats {
        let slots = self.slots.read().await;
        BrokerStats {
            producer_connected: slots.contains_key(&Role::Producer),
            requester_connected: slots.contains_key(&Role::Requester),
            pending_calls: self.correlator.pending_count(),
            forwarded_requests: self.forwarded_requests.load(Ordering::Relaxed),
            forwarded_responses: self.forwarded_responses.load(Ordering::Relaxed),
            local_calls: self.local_calls.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

fn peer_unavailable(request: &RequestEnvelope, target: Role) -> ResponseEnvelope {
    let message = match target {
        Role::Producer => "Producer not connected".to_string(),
        Role::Requester => "Requester not connected".to_string(),
    };
    ResponseEnvelope::failure(request.sequence_num, &request.function, &message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use audlink::protocol::WireMessage;

    fn request(seq: u64, function: &str) -> RequestEnvelope {
        RequestEnvelope {
            sequence_num: seq,
            function: function.into(),
            input_parameters: Map::new(),
        }
    }

    fn broker() -> Broker {
        Broker::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn register_evicts_previous_holder() {
        let broker = broker();
        let first = broker.register(Role::Producer).await;

        let evicted = Arc::clone(&first.evicted);
        let waiter = tokio::spawn(async move { evicted.notified().await });

        let second = broker.register(Role::Producer).await;
        assert!(second.generation > first.generation);
        waiter.await.unwrap();

        let stats = broker.stats().await;
        assert_eq!(stats.evictions, 1);
        assert!(stats.producer_connected);
    }

    #[tokio::test]
    async fn stale_generation_cannot_deregister() {
        let broker = broker();
        let first = broker.register(Role::Producer).await;
        let _second = broker.register(Role::Producer).await;

        broker.deregister(Role::Producer, first.generation).await;
        assert!(broker.connected(Role::Producer).await);
    }

    #[tokio::test]
    async fn request_forwarded_verbatim_to_peer() {
        let broker = broker();
        let mut producer = broker.register(Role::Producer).await;

        let req = request(9, "GetMLE");
        let synthesized = broker.route_request(Role::Requester, req.clone()).await;
        assert!(synthesized.is_none());

        match producer.outbound.recv().await.unwrap() {
            WireMessage::Request(forwarded) => {
                assert_eq!(forwarded.sequence_num, 9);
                assert_eq!(forwarded.function, "GetMLE");
            }
            other => panic!("Expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_peer_yields_immediate_failure_response() {
        let broker = broker();
        let response = broker
            .route_request(Role::Requester, request(4, "dllVersion"))
            .await
            .expect("no producer, must synthesize");

        assert_eq!(response.sequence_num, 4);
        assert_eq!(response.ret, -1);
        assert_eq!(
            response.output_parameters["error"].as_str().unwrap(),
            "Producer not connected"
        );
    }

    #[tokio::test]
    async fn call_fails_fast_without_producer() {
        let broker = broker();
        let start = std::time::Instant::now();
        let err = broker.call("dllVersion", Map::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::ProducerUnavailable));
        // Fast path, not a timeout.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn call_round_trip_through_producer_slot() {
        let broker = Arc::new(broker());
        let mut producer = broker.register(Role::Producer).await;

        let responder = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                while let Some(msg) = producer.outbound.recv().await {
                    if let WireMessage::Request(req) = msg {
                        let resp = ResponseEnvelope::success(
                            req.sequence_num,
                            &req.function,
                            Map::new(),
                        );
                        broker.route_response(resp).await;
                        break;
                    }
                }
            })
        };

        let response = broker.call("dllVersion", Map::new()).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.function, "dllVersion");
        responder.await.unwrap();

        let stats = broker.stats().await;
        assert_eq!(stats.local_calls, 1);
        assert_eq!(stats.pending_calls, 0);
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_out_of_order() {
        let broker = Arc::new(broker());
        let mut producer = broker.register(Role::Producer).await;

        let responder = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let mut held = Vec::new();
                for _ in 0..2 {
                    if let Some(WireMessage::Request(req)) = producer.outbound.recv().await {
                        held.push(req);
                    }
                }
                // Answer in reverse arrival order.
                for req in held.into_iter().rev() {
                    let mut output = Map::new();
                    output.insert("echo".into(), Value::String(req.function.clone()));
                    broker
                        .route_response(ResponseEnvelope::success(
                            req.sequence_num,
                            &req.function,
                            output,
                        ))
                        .await;
                }
            })
        };

        let (a, b) = tokio::join!(
            broker.call("dllVersion", Map::new()),
            broker.call("GetMLE", Map::new()),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.output_parameters["echo"], Value::String("dllVersion".into()));
        assert_eq!(b.output_parameters["echo"], Value::String("GetMLE".into()));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn producer_response_forwarded_to_requester_slot() {
        let broker = broker();
        let mut requester = broker.register(Role::Requester).await;

        let resp = ResponseEnvelope::success(21, "GetTubing_NL2", Map::new());
        broker.route_response(resp).await;

        match requester.outbound.recv().await.unwrap() {
            WireMessage::Response(forwarded) => assert_eq!(forwarded.sequence_num, 21),
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn orphan_response_is_discarded_quietly() {
        let broker = broker();
        // Neither a pending local call nor a requester slot exists.
        broker
            .route_response(ResponseEnvelope::success(5, "dllVersion", Map::new()))
            .await;
        assert_eq!(broker.stats().await.forwarded_responses, 0);
    }
}
