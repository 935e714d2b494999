//! Strict tagged-JSON serialization for checkpoint blobs.
//!
//! State blobs are self-describing JSON. Values JSON cannot represent
//! natively are wrapped in an extension envelope `{"__type": tag, "value":
//! string}` with three recognized tags:
//!
//! | Tag | Payload | Rust type |
//! |---|---|---|
//! | `decimal` | decimal string | [`rust_decimal::Decimal`] |
//! | `timestamp` | RFC 3339 string | [`chrono::DateTime<Utc>`] |
//! | `bytes` | hex string | `Vec<u8>` |
//!
//! There is deliberately no binary fallback: a value that does not encode
//! as strict JSON, or an envelope with an unknown tag or malformed payload,
//! fails the write with a loud [`CheckpointError::Unrepresentable`]. This
//! keeps the deserialization-attack surface at zero.

use crate::error::{CheckpointError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::str::FromStr;

/// Key marking an extension envelope
pub const TYPE_TAG: &str = "__type";

/// A decoded extension value
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedValue {
    /// High-precision decimal, stored as a string
    Decimal(Decimal),
    /// UTC timestamp, stored as RFC 3339
    Timestamp(DateTime<Utc>),
    /// Raw bytes, stored as hex
    Bytes(Vec<u8>),
}

/// Wrap a decimal in its extension envelope
pub fn tag_decimal(value: Decimal) -> Value {
    json!({ TYPE_TAG: "decimal", "value": value.to_string() })
}

/// Wrap a timestamp in its extension envelope
pub fn tag_timestamp(value: DateTime<Utc>) -> Value {
    json!({ TYPE_TAG: "timestamp", "value": value.to_rfc3339() })
}

/// Wrap raw bytes in their extension envelope
pub fn tag_bytes(value: &[u8]) -> Value {
    json!({ TYPE_TAG: "bytes", "value": hex::encode(value) })
}

/// Decode an extension envelope, if `value` is one
///
/// Returns `Ok(None)` for plain JSON values and an error for envelopes
/// carrying an unknown tag or a malformed payload.
pub fn decode_tagged(value: &Value) -> Result<Option<TaggedValue>> {
    let Some(obj) = value.as_object() else {
        return Ok(None);
    };
    let Some(tag) = obj.get(TYPE_TAG).and_then(Value::as_str) else {
        if obj.contains_key(TYPE_TAG) {
            return Err(CheckpointError::Unrepresentable(
                "__type tag must be a string".to_string(),
            ));
        }
        return Ok(None);
    };
    let payload = obj
        .get("value")
        .and_then(Value::as_str)
        .ok_or_else(|| CheckpointError::Unrepresentable(format!("tag '{}' missing string payload", tag)))?;

    match tag {
        "decimal" => {
            let decimal = Decimal::from_str(payload).map_err(|e| {
                CheckpointError::Unrepresentable(format!("invalid decimal '{}': {}", payload, e))
            })?;
            Ok(Some(TaggedValue::Decimal(decimal)))
        }
        "timestamp" => {
            let ts = DateTime::parse_from_rfc3339(payload).map_err(|e| {
                CheckpointError::Unrepresentable(format!("invalid timestamp '{}': {}", payload, e))
            })?;
            Ok(Some(TaggedValue::Timestamp(ts.with_timezone(&Utc))))
        }
        "bytes" => {
            let bytes = hex::decode(payload).map_err(|e| {
                CheckpointError::Unrepresentable(format!("invalid hex payload: {}", e))
            })?;
            Ok(Some(TaggedValue::Bytes(bytes)))
        }
        other => Err(CheckpointError::Unrepresentable(format!(
            "unknown extension tag '{}'",
            other
        ))),
    }
}

/// Validate a value tree for commit: every extension envelope must decode
fn validate_value(value: &Value) -> Result<()> {
    match value {
        Value::Object(obj) => {
            if decode_tagged(value)?.is_some() {
                return Ok(());
            }
            for nested in obj.values() {
                validate_value(nested)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                validate_value(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Encode a channel-value map into a state blob
///
/// Fails loudly if any value fails strict validation; nothing is written.
pub fn encode_state(values: &HashMap<String, Value>) -> Result<String> {
    for (channel, value) in values {
        validate_value(value).map_err(|e| {
            CheckpointError::Unrepresentable(format!("channel '{}': {}", channel, e))
        })?;
    }
    let map: Map<String, Value> = values
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(serde_json::to_string(&Value::Object(map))?)
}

/// Decode a state blob back into a channel-value map
pub fn decode_state(blob: &str) -> Result<HashMap<String, Value>> {
    let value: Value = serde_json::from_str(blob)?;
    let Value::Object(map) = value else {
        return Err(CheckpointError::Invalid(
            "state blob must be a JSON object".to_string(),
        ));
    };
    let values: HashMap<String, Value> = map.into_iter().collect();
    for (channel, value) in &values {
        validate_value(value).map_err(|e| {
            CheckpointError::Unrepresentable(format!("channel '{}': {}", channel, e))
        })?;
    }
    Ok(values)
}

/// Encode an arbitrary serializable document (metadata, writes) as JSON
pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON document
pub fn decode_json<T: serde::de::DeserializeOwned>(blob: &str) -> Result<T> {
    Ok(serde_json::from_str(blob)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decimal_roundtrip() {
        let decimal = Decimal::from_str("12345.678901234567890123456789").unwrap();
        let tagged = tag_decimal(decimal);
        match decode_tagged(&tagged).unwrap() {
            Some(TaggedValue::Decimal(d)) => assert_eq!(d, decimal),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = DateTime::parse_from_rfc3339("2025-06-01T12:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let tagged = tag_timestamp(ts);
        match decode_tagged(&tagged).unwrap() {
            Some(TaggedValue::Timestamp(t)) => assert_eq!(t, ts),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let bytes = vec![0u8, 1, 2, 254, 255];
        let tagged = tag_bytes(&bytes);
        match decode_tagged(&tagged).unwrap() {
            Some(TaggedValue::Bytes(b)) => assert_eq!(b, bytes),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let value = json!({ "__type": "pickle", "value": "gANjLg==" });
        assert!(decode_tagged(&value).is_err());
    }

    #[test]
    fn test_malformed_decimal_rejected() {
        let value = json!({ "__type": "decimal", "value": "not-a-number" });
        assert!(decode_tagged(&value).is_err());
    }

    #[test]
    fn test_plain_object_passes_through() {
        let value = json!({ "ticker": "AAPL", "nested": { "pe": 28.5 } });
        assert!(decode_tagged(&value).unwrap().is_none());
        let mut state = HashMap::new();
        state.insert("analysis".to_string(), value);
        let blob = encode_state(&state).unwrap();
        assert_eq!(decode_state(&blob).unwrap(), state);
    }

    #[test]
    fn test_nested_bad_tag_fails_encode() {
        let mut state = HashMap::new();
        state.insert(
            "report".to_string(),
            json!({ "sections": [{ "__type": "mystery", "value": "x" }] }),
        );
        let err = encode_state(&state).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    proptest! {
        #[test]
        fn prop_state_roundtrip(entries in proptest::collection::hash_map(
            "[a-z]{1,12}",
            prop_oneof![
                any::<i64>().prop_map(|n| json!(n)),
                any::<bool>().prop_map(|b| json!(b)),
                "[ -~]{0,32}".prop_map(|s| json!(s)),
                (any::<i64>(), 0u32..28).prop_map(|(m, s)| tag_decimal(Decimal::new(m, s))),
            ],
            0..8,
        )) {
            let blob = encode_state(&entries).unwrap();
            let decoded = decode_state(&blob).unwrap();
            prop_assert_eq!(decoded, entries);
        }
    }
}
