//! Payload encoding.
//!
//! The engine handles messages as `serde_json::Value` internally; a
//! serializer only decides how that value is laid out in storage.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, message: &JsonValue) -> Result<Vec<u8>, SerializationError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<JsonValue, SerializationError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SerializationError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Stores payloads as UTF-8 JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMessageSerializer;

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(&self, message: &JsonValue) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(message).map_err(|e| SerializationError::Encode(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<JsonValue, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode(e.to_string()))
    }
}

pub(crate) fn to_json<M: Serialize>(message: &M) -> Result<JsonValue, SerializationError> {
    serde_json::to_value(message).map_err(|e| SerializationError::Encode(e.to_string()))
}

pub(crate) fn from_json<M: DeserializeOwned>(value: &JsonValue) -> Result<M, SerializationError> {
    M::deserialize(value).map_err(|e| SerializationError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
    }

    #[test]
    fn typed_messages_pass_through_json_values() {
        let value = to_json(&OrderPlaced { order_id: 7 }).unwrap();
        let bytes = JsonMessageSerializer.serialize(&value).unwrap();
        let decoded: OrderPlaced = from_json(&JsonMessageSerializer.deserialize(&bytes).unwrap()).unwrap();

        assert_eq!(decoded, OrderPlaced { order_id: 7 });
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = JsonMessageSerializer.deserialize(b"\xff not json").unwrap_err();
        assert!(matches!(err, SerializationError::Decode(_)));
    }

    #[test]
    fn shape_mismatch_fails_to_decode() {
        let err = from_json::<OrderPlaced>(&serde_json::json!({"sku": "A-1"})).unwrap_err();
        assert!(matches!(err, SerializationError::Decode(_)));
    }
}
