//! JSON wire format for forwarded batches
//!
//! ```json
//! {
//!   "events": [{"eventType": "event", "eventData": "{\"traceId\":\"abc\"}"}],
//!   "destinationPluginId": "aggregate",
//!   "destinationPipelineName": "traces"
//! }
//! ```

use crate::error::ForwardingFailure;
use crate::event::Event;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub event_type: String,
    /// The event's JSON form, as a string
    pub event_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingEnvelope {
    pub events: Vec<WireEvent>,
    pub destination_plugin_id: String,
    #[serde(default)]
    pub destination_pipeline_name: String,
}

impl ForwardingEnvelope {
    pub fn from_events(
        events: &[Event],
        destination_plugin_id: &str,
        destination_pipeline_name: &str,
    ) -> Result<Self, ForwardingFailure> {
        let events = events
            .iter()
            .map(|event| {
                Ok(WireEvent {
                    event_type: event.event_type().to_string(),
                    event_data: event
                        .to_json()
                        .map_err(|e| ForwardingFailure::Encoding(e.to_string()))?,
                })
            })
            .collect::<Result<Vec<_>, ForwardingFailure>>()?;

        Ok(ForwardingEnvelope {
            events,
            destination_plugin_id: destination_plugin_id.to_string(),
            destination_pipeline_name: destination_pipeline_name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ForwardingFailure> {
        serde_json::to_vec(self).map_err(|e| ForwardingFailure::Encoding(e.to_string()))
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Rebuild events; fails on the first event whose data is not valid JSON
    pub fn into_events(self) -> Result<Vec<Event>, serde_json::Error> {
        self.events
            .into_iter()
            .map(|wire| Event::from_json(wire.event_type, &wire.event_data))
            .collect()
    }
}
