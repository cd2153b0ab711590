//! Conversational message model.
//!
//! Messages are append-only and form a forest through `parent_id`. The shape
//! stays close to the chat-completions wire format so history can be replayed
//! into the model without translation loss.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::monotonic_now;

/// Generate a prefixed unique id (`msg_…`, `sess_…`, `evt_…`).
pub fn gen_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }
}

/// A tool invocation recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// Typed part of a multimodal message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        tool_args: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_result: Value,
    },
    File {
        file_url: String,
    },
    Image {
        image_url: String,
    },
}

/// An immutable conversational unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_parts: Vec<ContentPart>,
    /// For `role = tool`: links back to the originating assistant tool_call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For `role = assistant`: tool invocations requested by the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: gen_id("msg"),
            session_id: session_id.into(),
            parent_id: None,
            role,
            agent_name: None,
            content: content.into(),
            content_parts: Vec::new(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            trace_id: None,
            timestamp: monotonic_now(),
            metadata: Map::new(),
        }
    }

    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, content)
    }

    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, content)
    }

    /// Tool result message answering `tool_call_id`.
    pub fn tool_result(
        session_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(session_id, Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_links_call_id() {
        let msg = Message::tool_result("sess_1", "call_1", "ok");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn serde_skips_empty_optionals() {
        let msg = Message::user("sess_1", "hello");
        let v = serde_json::to_value(&msg).unwrap();
        let obj = v.as_object().unwrap();
        assert!(!obj.contains_key("parent_id"));
        assert!(!obj.contains_key("tool_calls"));
        assert!(!obj.contains_key("metadata"));
    }

    #[test]
    fn round_trips_tool_calls() {
        let msg = Message::assistant("sess_1", "").with_tool_calls(vec![ToolCall::new(
            "call_1",
            "write_file",
            json!({"path": "a.txt"}),
        )]);
        let back: Message = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back.tool_calls, msg.tool_calls);
    }

    #[test]
    fn content_part_wire_tags() {
        let part = ContentPart::Text {
            text: "hi".to_string(),
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "text");
    }
}
