// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binary encoding of [`ProxyMessage`].
//!
//! All integers are little-endian:
//! - 4 bytes: message type code (i32)
//! - 4 bytes: property count (i32)
//! - per property: key string, then value string
//!
//! A string is a 4-byte length followed by UTF-8 bytes. A length of `-1`
//! encodes an absent value; keys are never absent.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::message::ProxyMessage;
use crate::message_type::MessageType;

/// Maximum encoded message size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Header size (4 bytes type + 4 bytes property count)
pub const HEADER_SIZE: usize = 8;

const ABSENT: i32 = -1;

/// Encode a message to bytes for wire transmission
pub fn encode(message: &ProxyMessage) -> Result<Bytes, CodecError> {
    let properties = message.properties();
    let body: usize = properties
        .iter()
        .map(|(k, v)| 8 + k.len() + v.as_ref().map_or(0, String::len))
        .sum();
    let size = HEADER_SIZE + body;
    if size > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(size));
    }

    let mut buf = BytesMut::with_capacity(size);
    buf.put_i32_le(message.message_type().code());
    buf.put_i32_le(properties.len() as i32);
    for (key, value) in properties {
        put_string(&mut buf, Some(key));
        put_string(&mut buf, value.as_deref());
    }
    Ok(buf.freeze())
}

/// Decode a message from bytes
pub fn decode(mut bytes: Bytes) -> Result<ProxyMessage, CodecError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(bytes.len()));
    }
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::Truncated("message header"));
    }

    let message_type = MessageType::try_from(bytes.get_i32_le())?;
    let count = bytes.get_i32_le();
    if count < 0 {
        return Err(CodecError::Truncated("property count"));
    }

    let mut properties = BTreeMap::new();
    for _ in 0..count {
        let key = get_string(&mut bytes, "property key")?
            .ok_or(CodecError::Truncated("property key"))?;
        let value = get_string(&mut bytes, "property value")?;
        properties.insert(key, value);
    }

    Ok(ProxyMessage::from_parts(message_type, properties))
}

fn put_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(s) => {
            buf.put_i32_le(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
        None => buf.put_i32_le(ABSENT),
    }
}

fn get_string(bytes: &mut Bytes, what: &'static str) -> Result<Option<String>, CodecError> {
    if bytes.remaining() < 4 {
        return Err(CodecError::Truncated(what));
    }
    let length = bytes.get_i32_le();
    if length == ABSENT {
        return Ok(None);
    }
    if length < 0 || bytes.remaining() < length as usize {
        return Err(CodecError::Truncated(what));
    }
    let raw = bytes.split_to(length as usize);
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| CodecError::InvalidUtf8(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_little_endian() {
        let msg = ProxyMessage::new(MessageType::PingRequest).with_request_id(5);
        let bytes = encode(&msg).unwrap();

        assert_eq!(&bytes[0..4], &21i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &9i32.to_le_bytes());
        assert_eq!(&bytes[12..21], b"RequestId");
        assert_eq!(&bytes[21..25], &1i32.to_le_bytes());
        assert_eq!(&bytes[25..26], b"5");
        assert_eq!(bytes.len(), 26);
    }

    #[test]
    fn test_absent_value_uses_negative_length() {
        let mut msg = ProxyMessage::new(MessageType::PingReply);
        msg.set_property("Error", None);
        let bytes = encode(&msg).unwrap();
        assert_eq!(&bytes[bytes.len() - 4..], &(-1i32).to_le_bytes());

        let decoded = decode(bytes).unwrap();
        assert_eq!(decoded.properties().get("Error"), Some(&None));
    }

    #[test]
    fn test_truncated_header() {
        let err = decode(Bytes::from_static(&[21, 0, 0])).unwrap_err();
        assert!(matches!(err, CodecError::Truncated("message header")));
    }

    #[test]
    fn test_truncated_value() {
        let mut msg = ProxyMessage::new(MessageType::PingRequest);
        msg.set_property("Name", Some("hello".to_string()));
        let bytes = encode(&msg).unwrap();
        let cut = bytes.slice(..bytes.len() - 2);
        assert!(matches!(
            decode(cut),
            Err(CodecError::Truncated("property value"))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(4242);
        buf.put_i32_le(0);
        assert!(matches!(
            decode(buf.freeze()),
            Err(CodecError::InvalidMessageType(4242))
        ));
    }
}
