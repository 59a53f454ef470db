// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serde adapters for the property encodings used on the wire.

/// Byte payloads travel as base64 strings.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Optional byte payloads; `None` is distinct from an empty payload.
pub mod opt_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Durations travel as signed 64-bit nanosecond counts; zero means "not set".
pub mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        serializer.serialize_i64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = Option::<i64>::deserialize(deserializer)?.unwrap_or(0);
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::b64")]
        data: Vec<u8>,
        #[serde(with = "super::opt_b64")]
        maybe: Option<Vec<u8>>,
        #[serde(with = "super::nanos")]
        timeout: Duration,
    }

    #[test]
    fn test_wire_encodings() {
        let sample = Sample {
            data: vec![1, 2, 3],
            maybe: None,
            timeout: Duration::from_secs(30),
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["data"], "AQID");
        assert!(json["maybe"].is_null());
        assert_eq!(json["timeout"], 30_000_000_000i64);
    }

    #[test]
    fn test_missing_bytes_read_as_empty() {
        let sample: Sample =
            serde_json::from_str(r#"{"data":null,"maybe":"","timeout":null}"#).unwrap();
        assert!(sample.data.is_empty());
        assert_eq!(sample.maybe, Some(vec![]));
        assert_eq!(sample.timeout, Duration::ZERO);
    }
}
