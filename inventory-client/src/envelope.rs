//! Inventory message envelope.
//!
//! On the wire an envelope is a UTF-8 JSON object with two recognised
//! fields, `item_id` and `text`. Unknown fields are ignored.
//!
//! Decoding is split in two steps so the consumer can tell undecodable bytes
//! (rejected as invalid content) from well-formed JSON that fails validation:
//!
//! ```text
//! bytes → decode_content() → serde_json::Value → MessageEnvelope::from_value()
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{InvalidContentError, ValidationError};

/// The unit of work exchanged between sender and receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Correlation key for the item the message is about
    pub item_id: String,
    /// Message body
    pub text: String,
}

impl MessageEnvelope {
    /// Create a new envelope. Call [`validate`](Self::validate) before sending.
    pub fn new(item_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            text: text.into(),
        }
    }

    /// Check that both fields are non-empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.item_id.is_empty() {
            return Err(ValidationError::EmptyField("item_id"));
        }
        if self.text.is_empty() {
            return Err(ValidationError::EmptyField("text"));
        }
        Ok(())
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Build a validated envelope from decoded JSON content.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let object = value.as_object().ok_or(ValidationError::NotAnObject)?;
        let item_id = required_string(object, "item_id")?;
        let text = required_string(object, "text")?;

        Ok(Self::new(item_id, text))
    }
}

/// Decode raw delivery bytes into generic JSON.
pub fn decode_content(data: &[u8]) -> Result<Value, InvalidContentError> {
    Ok(serde_json::from_slice(data)?)
}

fn required_string<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) if s.is_empty() => Err(ValidationError::EmptyField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ValidationError::NotAString(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_accepts_populated_envelope() {
        let envelope = MessageEnvelope::new("macbook", "check availability");
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_item_id() {
        let envelope = MessageEnvelope::new("", "x");
        assert_eq!(
            envelope.validate(),
            Err(ValidationError::EmptyField("item_id"))
        );
    }

    #[test]
    fn test_validate_is_idempotent() {
        let envelopes = [
            MessageEnvelope::new("macbook", "ok"),
            MessageEnvelope::new("", "ok"),
            MessageEnvelope::new("macbook", ""),
        ];

        for envelope in &envelopes {
            assert_eq!(envelope.validate(), envelope.validate());
        }
    }

    #[test]
    fn test_encode_uses_wire_field_names() {
        let envelope = MessageEnvelope::new("macbook", "check availability");
        let json: Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

        assert_eq!(
            json,
            json!({"item_id": "macbook", "text": "check availability"})
        );
    }

    #[test]
    fn test_decode_after_encode_returns_same_envelope() {
        let envelope = MessageEnvelope::new("ipad", "restock \"pro\" ✓");
        let bytes = envelope.encode().unwrap();

        let decoded = MessageEnvelope::from_value(&decode_content(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_content_rejects_broken_json() {
        assert!(decode_content(b"{not json").is_err());
    }

    #[test]
    fn test_decode_content_rejects_invalid_utf8() {
        assert!(decode_content(&[0xff, 0xfe, 0x7b]).is_err());
    }

    #[test]
    fn test_from_value_missing_text() {
        let value = decode_content(br#"{"item_id":"macbook"}"#).unwrap();
        assert_eq!(
            MessageEnvelope::from_value(&value),
            Err(ValidationError::MissingField("text"))
        );
    }

    #[test]
    fn test_from_value_null_counts_as_missing() {
        let value = json!({"item_id": null, "text": "ok"});
        assert_eq!(
            MessageEnvelope::from_value(&value),
            Err(ValidationError::MissingField("item_id"))
        );
    }

    #[test]
    fn test_from_value_rejects_non_string_fields() {
        let value = json!({"item_id": 42, "text": "ok"});
        assert_eq!(
            MessageEnvelope::from_value(&value),
            Err(ValidationError::NotAString("item_id"))
        );
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        assert_eq!(
            MessageEnvelope::from_value(&json!(["macbook", "ok"])),
            Err(ValidationError::NotAnObject)
        );
        assert_eq!(
            MessageEnvelope::from_value(&json!("macbook")),
            Err(ValidationError::NotAnObject)
        );
    }

    #[test]
    fn test_from_value_ignores_extra_fields() {
        let value = json!({"item_id": "macbook", "text": "ok", "priority": 3});
        assert_eq!(
            MessageEnvelope::from_value(&value),
            Ok(MessageEnvelope::new("macbook", "ok"))
        );
    }
}
