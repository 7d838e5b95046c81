//! Retry and error envelopes.
//!
//! Failures never leak as exceptions onto the bus; they travel as structured
//! envelopes on dedicated topics. Both envelope shapes validate against the
//! published JSON schemas before production — the service must never emit a
//! message a downstream consumer cannot parse.

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ExecutorError;
use crate::event::{Event, EventMeta};
use crate::registry::{error_topic_name, retry_topic_name};

const RETRY_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "change-prop/retry",
  "type": "object",
  "required": ["meta", "emitter_id", "retries_left", "original_event", "triggered_by"],
  "properties": {
    "meta": {
      "type": "object",
      "required": ["topic", "uri", "request_id", "domain", "dt"],
      "properties": {
        "topic": {"type": "string", "pattern": "^change-prop\\.retry\\..+"},
        "uri": {"type": "string", "minLength": 1},
        "request_id": {"type": "string", "minLength": 1},
        "domain": {"type": "string"},
        "dt": {"type": "string"},
        "id": {"type": "string"}
      }
    },
    "emitter_id": {"type": "string", "minLength": 1},
    "retries_left": {"type": "integer", "minimum": 0},
    "original_event": {"type": "object"},
    "triggered_by": {"type": "string", "minLength": 1}
  }
}"#;

const ERROR_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "change-prop/error",
  "type": "object",
  "required": ["meta", "emitter_id", "message", "event_str"],
  "properties": {
    "meta": {
      "type": "object",
      "required": ["topic", "uri", "request_id", "domain", "dt"],
      "properties": {
        "topic": {"type": "string", "const": "change-prop.error"},
        "uri": {"type": "string", "minLength": 1},
        "request_id": {"type": "string"},
        "domain": {"type": "string"},
        "dt": {"type": "string"},
        "id": {"type": "string"}
      }
    },
    "emitter_id": {"type": "string", "minLength": 1},
    "message": {"type": "string", "minLength": 1},
    "event_str": {"type": "string"},
    "triggered_by": {"type": "string"}
  }
}"#;

static RETRY_VALIDATOR: Lazy<jsonschema::Validator> = Lazy::new(|| {
    let schema: Value = serde_json::from_str(RETRY_SCHEMA).expect("retry schema parses");
    jsonschema::options()
        .with_draft(jsonschema::Draft::Draft7)
        .build(&schema)
        .expect("retry schema compiles")
});

static ERROR_VALIDATOR: Lazy<jsonschema::Validator> = Lazy::new(|| {
    let schema: Value = serde_json::from_str(ERROR_SCHEMA).expect("error schema parses");
    jsonschema::options()
        .with_draft(jsonschema::Draft::Draft7)
        .build(&schema)
        .expect("error schema compiles")
});

/// Message re-submitted onto a per-rule retry topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEnvelope {
    pub meta: EventMeta,
    pub emitter_id: String,
    pub retries_left: u32,
    pub original_event: Value,
    pub triggered_by: String,
}

impl RetryEnvelope {
    /// Build the envelope for one failed exec of `rule_name` over `event`.
    /// The chain gains the event's own token; `meta.dt` anchors the backoff
    /// delay at emission time.
    pub fn new(rule_name: &str, retries_left: u32, event: &Event, emitter_id: &str) -> Self {
        let source = event.meta();
        Self {
            meta: EventMeta {
                topic: retry_topic_name(rule_name),
                uri: source.uri.clone(),
                request_id: source.request_id.clone(),
                domain: source.domain.clone(),
                dt: Utc::now(),
                id: Some(ulid::Ulid::new().to_string()),
            },
            emitter_id: emitter_id.to_string(),
            retries_left,
            original_event: original_of(event),
            triggered_by: event.extended_chain(),
        }
    }

    /// Check against the published retry schema.
    pub fn validate(&self) -> Result<Value, ExecutorError> {
        let value = serde_json::to_value(self).map_err(|e| {
            ExecutorError::InvalidRetryEnvelope {
                details: e.to_string(),
            }
        })?;
        RETRY_VALIDATOR
            .validate(&value)
            .map_err(|e| ExecutorError::InvalidRetryEnvelope {
                details: e.to_string(),
            })?;
        Ok(value)
    }
}

/// On a nested retry, carry the original source event, not the envelope.
fn original_of(event: &Event) -> Value {
    event
        .raw()
        .get("original_event")
        .cloned()
        .unwrap_or_else(|| event.raw().clone())
}

/// Terminal-failure report produced onto `change-prop.error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub meta: EventMeta,
    pub emitter_id: String,
    pub message: String,
    pub event_str: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(event: &Event, emitter_id: &str, message: String) -> Self {
        let source = event.meta();
        Self {
            meta: EventMeta {
                topic: error_topic_name().to_string(),
                uri: source.uri.clone(),
                request_id: source.request_id.clone(),
                domain: source.domain.clone(),
                dt: Utc::now(),
                id: Some(ulid::Ulid::new().to_string()),
            },
            emitter_id: emitter_id.to_string(),
            message,
            event_str: event.raw().to_string(),
            triggered_by: event.triggered_by().map(str::to_string),
        }
    }

    /// Check against the published error schema.
    pub fn validate(&self) -> Result<Value, ExecutorError> {
        let value = serde_json::to_value(self).map_err(|e| {
            ExecutorError::InvalidErrorEnvelope {
                details: e.to_string(),
            }
        })?;
        ERROR_VALIDATOR
            .validate(&value)
            .map_err(|e| ExecutorError::InvalidErrorEnvelope {
                details: e.to_string(),
            })?;
        Ok(value)
    }
}
