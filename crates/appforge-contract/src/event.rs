//! Streaming event model.
//!
//! The event taxonomy is closed: the eleven wire values below are the only
//! ones ever written, and consumers match on them exactly. Historical
//! producers stored prefixed values (`EventType.LLM_STREAM`); deserialisation
//! normalises both forms.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::clock::monotonic_now;
use crate::message::{gen_id, Role, ToolCall};

/// Canonical wire values for event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    AgentStart,
    NodeStart,
    LlmStream,
    MessageComplete,
    ToolStart,
    ToolEnd,
    NodeEnd,
    StageChange,
    Custom,
    AgentError,
    Finish,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentStart => "agent_start",
            EventType::NodeStart => "node_start",
            EventType::LlmStream => "llm_stream",
            EventType::MessageComplete => "message_complete",
            EventType::ToolStart => "tool_start",
            EventType::ToolEnd => "tool_end",
            EventType::NodeEnd => "node_end",
            EventType::StageChange => "stage_change",
            EventType::Custom => "custom",
            EventType::AgentError => "agent_error",
            EventType::Finish => "finish",
        }
    }

    /// Parse a wire value, accepting the legacy `EventType.LLM_STREAM` form.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalised = raw.strip_prefix("EventType.").unwrap_or(raw);
        let lowered = normalised.to_ascii_lowercase();
        match lowered.as_str() {
            "agent_start" => Some(EventType::AgentStart),
            "node_start" => Some(EventType::NodeStart),
            "llm_stream" => Some(EventType::LlmStream),
            "message_complete" => Some(EventType::MessageComplete),
            "tool_start" => Some(EventType::ToolStart),
            "tool_end" => Some(EventType::ToolEnd),
            "node_end" => Some(EventType::NodeEnd),
            "stage_change" => Some(EventType::StageChange),
            "custom" => Some(EventType::Custom),
            "agent_error" => Some(EventType::AgentError),
            "finish" => Some(EventType::Finish),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        EventType::parse(&raw).ok_or_else(|| D::Error::custom(format!("unknown event type: {raw}")))
    }
}

/// Terminal status carried by the `finish` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    Success,
    Failed,
    Timeout,
    Stopped,
}

impl FinishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishStatus::Success => "success",
            FinishStatus::Failed => "failed",
            FinishStatus::Timeout => "timeout",
            FinishStatus::Stopped => "stopped",
        }
    }
}

/// The finest-grained observable of a run. Append-only, TTL-expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: String,
    pub timestamp: f64,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Subgraph node path this event originated in; empty for the root graph.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace: Vec<String>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn new(session_id: impl Into<String>, event_type: EventType, data: Value) -> Self {
        Self {
            id: gen_id("evt"),
            session_id: session_id.into(),
            timestamp: monotonic_now(),
            event_type,
            agent_name: None,
            namespace: Vec::new(),
            data,
            message_id: None,
            trace_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_namespace(mut self, namespace: Vec<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Terminal status if this is a `finish` event.
    pub fn finish_status(&self) -> Option<FinishStatus> {
        if self.event_type != EventType::Finish {
            return None;
        }
        self.data
            .get("status")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

// ---------------------------------------------------------------------------
// Typed data payloads (schema per event type)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamContentType {
    Text,
    ToolCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStartData {
    pub prompt: String,
    pub framework: String,
    /// Message id of the user turn that started this run.
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStartData {
    pub node_name: String,
    #[serde(default)]
    pub namespace: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmStreamData {
    pub delta: String,
    pub content_type: StreamContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCompleteData {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStartData {
    pub tool_name: String,
    pub tool_call_id: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEndData {
    pub tool_name: String,
    pub tool_call_id: String,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndData {
    pub node_name: String,
    pub decision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageChangeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_stage: Option<String>,
    pub to_stage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomData {
    pub custom_type: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentErrorData {
    pub error: String,
    pub error_type: String,
    #[serde(default)]
    pub namespace: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishData {
    pub status: FinishStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn data_value<T: Serialize>(data: &T) -> Value {
    serde_json::to_value(data).unwrap_or(Value::Null)
}

impl Event {
    pub fn agent_start(session_id: &str, data: AgentStartData) -> Self {
        let message_id = data.message_id.clone();
        Event::new(session_id, EventType::AgentStart, data_value(&data)).with_message_id(message_id)
    }

    pub fn node_start(session_id: &str, data: NodeStartData) -> Self {
        let namespace = data.namespace.clone();
        let agent = data.node_name.clone();
        Event::new(session_id, EventType::NodeStart, data_value(&data))
            .with_agent(agent)
            .with_namespace(namespace)
    }

    pub fn llm_stream(session_id: &str, message_id: &str, data: LlmStreamData) -> Self {
        Event::new(session_id, EventType::LlmStream, data_value(&data)).with_message_id(message_id)
    }

    pub fn message_complete(session_id: &str, message_id: &str, data: MessageCompleteData) -> Self {
        Event::new(session_id, EventType::MessageComplete, data_value(&data))
            .with_message_id(message_id)
    }

    pub fn tool_start(session_id: &str, data: ToolStartData) -> Self {
        Event::new(session_id, EventType::ToolStart, data_value(&data))
    }

    pub fn tool_end(session_id: &str, data: ToolEndData) -> Self {
        Event::new(session_id, EventType::ToolEnd, data_value(&data))
    }

    pub fn node_end(session_id: &str, data: NodeEndData) -> Self {
        let agent = data.node_name.clone();
        Event::new(session_id, EventType::NodeEnd, data_value(&data)).with_agent(agent)
    }

    pub fn stage_change(session_id: &str, data: StageChangeData) -> Self {
        Event::new(session_id, EventType::StageChange, data_value(&data))
    }

    pub fn custom(session_id: &str, data: CustomData) -> Self {
        Event::new(session_id, EventType::Custom, data_value(&data))
    }

    pub fn agent_error(session_id: &str, data: AgentErrorData) -> Self {
        Event::new(session_id, EventType::AgentError, data_value(&data))
    }

    pub fn finish(session_id: &str, status: FinishStatus, reason: Option<String>) -> Self {
        Event::new(
            session_id,
            EventType::Finish,
            data_value(&FinishData { status, reason }),
        )
    }
}
