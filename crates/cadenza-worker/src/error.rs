// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker error types.

use cadenza_protocol::{CodecError, ErrorKind, MessageType, ProxyError};
use thiserror::Error;

/// Errors that can occur in the worker runtime.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// Sending to, or receiving from, the proxy failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unsupported message
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// The proxy (or the orchestration server behind it) returned an error
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// A reply arrived whose type does not answer the pending request
    #[error("reply type mismatch: expected {expected}, got {actual}")]
    ReplyTypeMismatch {
        expected: MessageType,
        actual: MessageType,
    },

    /// The connection to the proxy is closing or closed
    #[error("connection closed")]
    ConnectionClosed,

    /// The pending operation was cancelled before a reply arrived
    #[error("operation cancelled")]
    Cancelled,

    /// A different type is already registered under this workflow or activity name
    #[error("type '{0}' is already registered with a different implementation")]
    TypeConflict(String),

    /// Internal worker error
    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Whether this error is a proxy error of the given kind.
    pub fn is_proxy_kind(&self, kind: ErrorKind) -> bool {
        matches!(self, WorkerError::Proxy(err) if err.kind == kind)
    }

    /// Convert into the structured error carried in a reply.
    pub fn into_proxy_error(self) -> ProxyError {
        match self {
            WorkerError::Proxy(err) => err,
            WorkerError::Cancelled => ProxyError::cancelled("operation cancelled"),
            WorkerError::TypeConflict(_) => ProxyError::already_exists(self.to_string()),
            WorkerError::Protocol(_) | WorkerError::ReplyTypeMismatch { .. } => {
                ProxyError::bad_request(self.to_string())
            }
            other => ProxyError::generic(other.to_string()),
        }
    }
}

/// Type alias for worker results.
pub type Result<T> = std::result::Result<T, WorkerError>;
