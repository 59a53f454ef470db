// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types carried by, or raised while handling, proxy messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message_type::MessageType;

/// Errors that can occur during message encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too large: {0} bytes (max: {max})", max = crate::codec::MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(i32),

    #[error("truncated frame: {0}")]
    Truncated(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("property '{name}': {source}")]
    Property {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Classification of a [`ProxyError`].
///
/// The first group mirrors the orchestration server's business errors so user
/// code can branch on them; the second group describes how an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    EntityNotExists,
    AlreadyExists,
    BadRequest,
    ServiceBusy,
    InternalService,
    Cancelled,
    Custom,
    Generic,
    Panic,
    Terminated,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EntityNotExists => "EntityNotExists",
            Self::AlreadyExists => "AlreadyExists",
            Self::BadRequest => "BadRequest",
            Self::ServiceBusy => "ServiceBusy",
            Self::InternalService => "InternalService",
            Self::Cancelled => "Cancelled",
            Self::Custom => "Custom",
            Self::Generic => "Generic",
            Self::Panic => "Panic",
            Self::Terminated => "Terminated",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried in the `Error` property of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "PascalCase")]
#[error("{kind}: {message}")]
pub struct ProxyError {
    #[serde(rename = "Type")]
    pub kind: ErrorKind,
    #[serde(rename = "String")]
    pub message: String,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn entity_not_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EntityNotExists, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Terminated, message)
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::entity_not_exists("Domain X");
        assert_eq!(err.to_string(), "EntityNotExists: Domain X");
    }

    #[test]
    fn test_proxy_error_json_shape() {
        let err = ProxyError::new(ErrorKind::Terminated, "stopped by operator");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["Type"], "Terminated");
        assert_eq!(json["String"], "stopped by operator");

        let back: ProxyError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_codec_error_messages() {
        assert_eq!(
            CodecError::InvalidMessageType(42).to_string(),
            "invalid message type: 42"
        );
        assert_eq!(
            CodecError::UnexpectedType {
                expected: MessageType::PingReply,
                actual: MessageType::HeartbeatReply,
            }
            .to_string(),
            "unexpected message type: expected PingReply, got HeartbeatReply"
        );
    }
}
