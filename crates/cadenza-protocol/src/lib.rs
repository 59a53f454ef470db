// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadenza Protocol - proxy message vocabulary
//!
//! This crate defines the messages exchanged between a cadenza worker and the
//! sidecar proxy that fronts the orchestration server:
//! - Worker -> proxy: connection setup, domain and worker management, and the
//!   routed calls a running workflow makes (time, sleep, versions, history values)
//! - Proxy -> worker: workflow invocations, signals, queries and local activities
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    cadenza-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Payloads: typed request/reply pairs (serde)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelope: message type + nullable string properties        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Codec: little-endian length-prefixed binary (bytes)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use cadenza_protocol::{ProxyMessage, codec, payloads::PingRequest};
//!
//! let message = ProxyMessage::from_payload(&PingRequest {})
//!     .unwrap()
//!     .with_request_id(1);
//! let bytes = codec::encode(&message).unwrap();
//! let decoded = codec::decode(bytes).unwrap();
//! assert_eq!(decoded, message);
//! ```

pub mod codec;
pub mod error;
pub mod message;
pub mod message_type;
pub mod payloads;
pub mod serde_helpers;

pub use error::{CodecError, ErrorKind, ProxyError};
pub use message::{CLIENT_ID, Payload, ProxyMessage, ProxyReply, ProxyRequest, REQUEST_ID};
pub use message_type::MessageType;

/// Content type used when messages travel over HTTP.
pub const CONTENT_TYPE: &str = "application/x-cadenza-message";
