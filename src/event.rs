//! Bus events and their typed metadata view.
//!
//! Events are opaque JSON documents. The only shape the engine requires is a
//! `meta` sub-record carrying routing and correlation fields; everything else
//! is matched structurally by rules. A payload that fails to decode is
//! reported as an [`EventError`] and skipped, never crashing a worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EventError;

/// Required metadata of every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    /// Topic the event was produced onto
    pub topic: String,
    /// Resource the change concerns
    pub uri: String,
    /// Correlation id inherited by every derived request
    pub request_id: String,
    /// Originating domain
    pub domain: String,
    /// Creation time; anchors retry delay computation
    pub dt: DateTime<Utc>,
    /// Optional unique event id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A decoded bus event: raw JSON plus the parsed `meta` view.
#[derive(Debug, Clone)]
pub struct Event {
    raw: Value,
    meta: EventMeta,
}

impl Event {
    /// Decode an event from a raw bus payload.
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        let raw: Value =
            serde_json::from_slice(payload).map_err(|e| EventError::DecodeFailed {
                details: e.to_string(),
            })?;
        Self::from_value(raw)
    }

    /// Wrap an already-parsed JSON value, validating its `meta` record.
    pub fn from_value(raw: Value) -> Result<Self, EventError> {
        let meta_value = raw.get("meta").ok_or_else(|| EventError::InvalidMeta {
            details: "no meta record".to_string(),
        })?;
        let meta: EventMeta =
            serde_json::from_value(meta_value.clone()).map_err(|e| EventError::InvalidMeta {
                details: e.to_string(),
            })?;
        Ok(Self { raw, meta })
    }

    pub fn meta(&self) -> &EventMeta {
        &self.meta
    }

    /// The full event document, as rules and templates see it.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The `topic:uri` token this event contributes to a triggered-by chain.
    pub fn chain_token(&self) -> String {
        format!("{}:{}", self.meta.topic, self.meta.uri)
    }

    /// Chain inherited from the event that produced this one, if any.
    pub fn triggered_by(&self) -> Option<&str> {
        self.raw.get("triggered_by").and_then(Value::as_str)
    }

    /// The inherited chain extended with this event's own token.
    pub fn extended_chain(&self) -> String {
        match self.triggered_by() {
            Some(parent) => format!("{},{}", parent, self.chain_token()),
            None => self.chain_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "meta": {
                "topic": "simple_test_rule",
                "uri": "/sample/uri",
                "request_id": "12345678-9101",
                "domain": "test.wiki.example",
                "dt": "2024-01-01T00:00:00Z"
            },
            "message": "test"
        })
    }

    #[test]
    fn test_decode_valid_event() {
        let bytes = serde_json::to_vec(&sample()).unwrap();
        let event = Event::decode(&bytes).unwrap();
        assert_eq!(event.meta().topic, "simple_test_rule");
        assert_eq!(event.meta().uri, "/sample/uri");
        assert_eq!(event.raw()["message"], json!("test"));
    }

    #[test]
    fn test_decode_non_json() {
        let result = Event::decode(b"non-parsable-json");
        assert!(matches!(result, Err(EventError::DecodeFailed { .. })));
    }

    #[test]
    fn test_decode_missing_meta() {
        let result = Event::from_value(json!({"message": "test"}));
        assert!(matches!(result, Err(EventError::InvalidMeta { .. })));
    }

    #[test]
    fn test_decode_incomplete_meta() {
        let result = Event::from_value(json!({
            "meta": {"topic": "t", "uri": "/x"}
        }));
        assert!(matches!(result, Err(EventError::InvalidMeta { .. })));
    }

    #[test]
    fn test_chain_token() {
        let event = Event::from_value(sample()).unwrap();
        assert_eq!(event.chain_token(), "simple_test_rule:/sample/uri");
        assert_eq!(event.extended_chain(), "simple_test_rule:/sample/uri");
    }

    #[test]
    fn test_inherited_chain_extension() {
        let mut value = sample();
        value["triggered_by"] = json!("test_dc.kafka_producing_rule:/sample/uri");
        let event = Event::from_value(value).unwrap();
        assert_eq!(
            event.extended_chain(),
            "test_dc.kafka_producing_rule:/sample/uri,simple_test_rule:/sample/uri"
        );
    }
}
