// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Audlink core — transport bridge between a fitting calculator and its
//! LAN clients.
//!
//! The calculator runs embedded in a mobile device; clients reach it either
//! through a shared relay (persistent duplex channel, see the
//! `audlink-relay` crate) or through a self-contained HTTP call handled by
//! the one-shot adapter. Both paths share the same wire envelopes, the same
//! operation dispatch table, and the same sequence-number correlation.
//!
//! Modules:
//! - [`protocol`] — wire envelopes and length-prefixed JSON framing
//! - [`correlator`] — pending-request table matching responses to requests
//! - [`dispatch`] — operation registry and the [`dispatch::ComputeEngine`]
//!   boundary to the numeric calculator
//! - [`connection`] — client side of the duplex channel (state machine)
//! - [`scan`] — endpoint discovery probes
//! - [`config`] — persisted endpoint selection
//! - [`single`] — independent one-request-one-response adapter

pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod scan;
pub mod single;

pub use connection::{ConnectOptions, Connection, ConnectionState};
pub use correlator::{Correlator, PendingRequest};
pub use dispatch::{ComputeEngine, Dispatcher, OperationRegistry, StubEngine};
pub use error::{BridgeError, BridgeResult};
pub use protocol::{RequestEnvelope, ResponseEnvelope, Role, WireMessage};
pub use scan::Candidate;
pub use single::{reply_channel, ReplyToken};
