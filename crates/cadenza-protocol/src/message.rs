// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The property-bag envelope exchanged with the proxy.
//!
//! A [`ProxyMessage`] is a message type plus a map of named, nullable string
//! properties. `RequestId` and `ClientId` belong to the envelope; all other
//! properties are produced from, and parsed into, a typed [`Payload`].
//!
//! Property values are JSON text, so `"42"` is the number 42 and `"\"42\""` is
//! the string "42". An absent (`None`) property reads back as JSON `null`.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{CodecError, ProxyError};
use crate::message_type::MessageType;

/// Envelope property holding the correlation id.
pub const REQUEST_ID: &str = "RequestId";
/// Envelope property identifying the client connection.
pub const CLIENT_ID: &str = "ClientId";

/// A typed message body.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    const MESSAGE_TYPE: MessageType;
}

/// A request payload, statically paired with the reply that answers it.
pub trait ProxyRequest: Payload {
    type Reply: ProxyReply;
}

/// A reply payload. Every reply can carry a [`ProxyError`].
pub trait ProxyReply: Payload + Default {
    fn error(&self) -> Option<&ProxyError>;

    fn set_error(&mut self, error: Option<ProxyError>);

    /// A reply carrying only the given error.
    fn from_error(error: ProxyError) -> Self {
        let mut reply = Self::default();
        reply.set_error(Some(error));
        reply
    }

    /// Convert into a `Result`, moving a carried error into `Err`.
    fn into_result(mut self) -> Result<Self, ProxyError> {
        match self.error().cloned() {
            Some(err) => {
                self.set_error(None);
                Err(err)
            }
            None => Ok(self),
        }
    }
}

/// A message exchanged with the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyMessage {
    message_type: MessageType,
    properties: BTreeMap<String, Option<String>>,
}

impl ProxyMessage {
    /// Create an empty message of the given type
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            properties: BTreeMap::new(),
        }
    }

    pub(crate) fn from_parts(
        message_type: MessageType,
        properties: BTreeMap<String, Option<String>>,
    ) -> Self {
        Self {
            message_type,
            properties,
        }
    }

    /// Build a message from a typed payload.
    pub fn from_payload<P: Payload>(payload: &P) -> Result<Self, CodecError> {
        let value = serde_json::to_value(payload)?;
        let mut message = Self::new(P::MESSAGE_TYPE);
        if let Value::Object(fields) = value {
            for (name, field) in fields {
                let encoded = match field {
                    Value::Null => None,
                    other => Some(other.to_string()),
                };
                message.properties.insert(name, encoded);
            }
        }
        Ok(message)
    }

    /// Build a reply to `request`, carrying over its correlation properties.
    pub fn reply_to<P: ProxyReply>(request: &ProxyMessage, reply: &P) -> Result<Self, CodecError> {
        let mut message = Self::from_payload(reply)?;
        message.set_request_id(request.request_id());
        message.set_client_id(request.client_id());
        Ok(message)
    }

    /// Build an error-only reply to `request` without knowing its payload type.
    ///
    /// Returns `None` when `request` is not a request.
    pub fn error_reply(request: &ProxyMessage, error: &ProxyError) -> Result<Option<Self>, CodecError> {
        let Some(reply_type) = request.message_type.reply_type() else {
            return Ok(None);
        };
        let mut message = Self::new(reply_type);
        message.set_property("Error", Some(serde_json::to_string(error)?));
        message.set_request_id(request.request_id());
        message.set_client_id(request.client_id());
        Ok(Some(message))
    }

    /// Parse the message into a typed payload, checking the message type.
    pub fn to_payload<P: Payload>(&self) -> Result<P, CodecError> {
        if self.message_type != P::MESSAGE_TYPE {
            return Err(CodecError::UnexpectedType {
                expected: P::MESSAGE_TYPE,
                actual: self.message_type,
            });
        }

        let mut fields = Map::new();
        for (name, value) in &self.properties {
            if name == REQUEST_ID || name == CLIENT_ID {
                continue;
            }
            let field = match value {
                Some(text) => {
                    serde_json::from_str(text).map_err(|source| CodecError::Property {
                        name: name.clone(),
                        source,
                    })?
                }
                None => Value::Null,
            };
            fields.insert(name.clone(), field);
        }
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is_request(&self) -> bool {
        self.message_type.is_request()
    }

    pub fn is_reply(&self) -> bool {
        self.message_type.is_reply()
    }

    pub fn properties(&self) -> &BTreeMap<String, Option<String>> {
        &self.properties
    }

    /// Raw property text, `None` when absent or null.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_deref())
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Option<String>) {
        self.properties.insert(name.into(), value);
    }

    fn id_property(&self, name: &str) -> u64 {
        self.property(name)
            .and_then(|text| text.parse().ok())
            .unwrap_or(0)
    }

    pub fn request_id(&self) -> u64 {
        self.id_property(REQUEST_ID)
    }

    pub fn set_request_id(&mut self, request_id: u64) {
        self.set_property(REQUEST_ID, Some(request_id.to_string()));
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.set_request_id(request_id);
        self
    }

    pub fn client_id(&self) -> u64 {
        self.id_property(CLIENT_ID)
    }

    pub fn set_client_id(&mut self, client_id: u64) {
        self.set_property(CLIENT_ID, Some(client_id.to_string()));
    }

    pub fn with_client_id(mut self, client_id: u64) -> Self {
        self.set_client_id(client_id);
        self
    }
}
