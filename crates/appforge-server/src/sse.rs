//! SSE wire format.
//!
//! One frame per event:
//! ```text
//! event: <event_type>
//! id: <event_id>
//! data: <single-line JSON>
//!
//! ```
//! No comments, no multi-line data. The data object is the event's payload
//! with the envelope fields folded in, so clients need only parse `data`.

use serde_json::{Map, Value};

use appforge_contract::Event;

/// Render one stored event as an SSE frame.
pub fn event_frame(event: &Event) -> String {
    let mut data = Map::new();
    data.insert(
        "event_type".to_string(),
        Value::String(event.event_type.as_str().to_string()),
    );
    data.insert(
        "session_id".to_string(),
        Value::String(event.session_id.clone()),
    );
    data.insert("timestamp".to_string(), serde_json::json!(event.timestamp));
    if let Value::Object(payload) = &event.data {
        for (key, value) in payload {
            data.insert(key.clone(), value.clone());
        }
    }
    if let Some(agent) = &event.agent_name {
        data.insert("agent_name".to_string(), Value::String(agent.clone()));
    }
    if !event.namespace.is_empty() {
        data.insert(
            "namespace".to_string(),
            serde_json::json!(event.namespace),
        );
    }
    if let Some(trace_id) = &event.trace_id {
        data.insert("trace_id".to_string(), Value::String(trace_id.clone()));
    }
    if let Some(message_id) = &event.message_id {
        data.insert("message_id".to_string(), Value::String(message_id.clone()));
    }

    let json = Value::Object(data).to_string();
    format!(
        "event: {}\nid: {}\ndata: {}\n\n",
        event.event_type, event.id, json
    )
}
