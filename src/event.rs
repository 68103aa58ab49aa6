//! Event model consumed by peer forwarding
//!
//! Forwarding only needs three things from an event: its type, field lookup for
//! identification keys, and a stable JSON form for the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type used when none is specified
pub const DEFAULT_EVENT_TYPE: &str = "event";

/// A single telemetry event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_type: String,
    data: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Event {
            event_type: event_type.into(),
            data,
        }
    }

    /// Build an event from a JSON object. Non-object values are stored under `message`.
    pub fn from_value(event_type: impl Into<String>, value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("message".to_string(), other);
                map
            }
        };
        Event::new(event_type, data)
    }

    /// Parse the serialized form produced by [`Event::to_json`]
    pub fn from_json(event_type: impl Into<String>, json: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(json)?;
        Ok(Event::from_value(event_type, value))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.data)
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Look up a field. Keys may address nested objects with `/`, either as
    /// `a/b` or JSON-pointer style `/a/b`. Explicit `null` counts as missing.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut segments = key.trim_start_matches('/').split('/');
        let first = segments.next()?;
        let mut current = self.data.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    /// Field value rendered for partition hashing: strings verbatim, everything
    /// else in its JSON form.
    pub fn key_string(&self, key: &str) -> Option<String> {
        self.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }
}
