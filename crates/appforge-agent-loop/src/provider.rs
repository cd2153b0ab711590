//! Model provider seam.
//!
//! The loop talks to [`ChatStreamProvider`] rather than the genai client
//! directly so tests can script model turns. [`GenaiProvider`] is the
//! production implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use genai::chat::{
    ChatMessage, ChatOptions, ChatRequest, ChatStreamEvent, ContentPart, MessageContent,
    ToolResponse,
};
use thiserror::Error;

use appforge_contract::{Message, Role};

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Call could not be started or failed mid-stream. Retryable.
    #[error("model call failed: {0}")]
    Call(String),
}

pub type ChatEventStream = BoxStream<'static, Result<ChatStreamEvent, genai::Error>>;

#[async_trait]
pub trait ChatStreamProvider: Send + Sync {
    /// Start a streaming chat call and return the event stream.
    async fn exec_chat_stream(
        &self,
        model: &str,
        request: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<ChatEventStream, ProviderError>;

    /// Non-streaming call used by the summariser. Returns the response text.
    async fn exec_chat_text(&self, model: &str, request: ChatRequest)
        -> Result<String, ProviderError>;
}

/// Production provider over the genai client.
pub struct GenaiProvider {
    client: genai::Client,
}

impl GenaiProvider {
    pub fn new(client: genai::Client) -> Self {
        Self { client }
    }
}

impl Default for GenaiProvider {
    fn default() -> Self {
        Self::new(genai::Client::default())
    }
}

#[async_trait]
impl ChatStreamProvider for GenaiProvider {
    async fn exec_chat_stream(
        &self,
        model: &str,
        request: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<ChatEventStream, ProviderError> {
        let response = self
            .client
            .exec_chat_stream(model, request, options)
            .await
            .map_err(|e| ProviderError::Call(e.to_string()))?;
        Ok(Box::pin(response.stream))
    }

    async fn exec_chat_text(
        &self,
        model: &str,
        request: ChatRequest,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .exec_chat(model, request, None)
            .await
            .map_err(|e| ProviderError::Call(e.to_string()))?;
        Ok(response.first_text().unwrap_or_default().to_string())
    }
}

/// Convert stored messages into the chat wire shape, system prompt first.
pub fn to_chat_messages(system_prompt: &str, messages: &[Message]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(ChatMessage::system(system_prompt));
    }
    for msg in messages {
        match msg.role {
            Role::System => out.push(ChatMessage::system(&msg.content)),
            Role::User => out.push(ChatMessage::user(&msg.content)),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    out.push(ChatMessage::assistant(&msg.content));
                } else {
                    let mut content = MessageContent::from(msg.content.as_str());
                    for tc in &msg.tool_calls {
                        content.push(ContentPart::ToolCall(genai::chat::ToolCall {
                            call_id: tc.id.clone(),
                            fn_name: tc.name.clone(),
                            fn_arguments: tc.args.clone(),
                            thought_signatures: None,
                        }));
                    }
                    out.push(ChatMessage::assistant(content));
                }
            }
            Role::Tool => {
                let response = ToolResponse {
                    call_id: msg.tool_call_id.clone().unwrap_or_default(),
                    fn_name: None,
                    content: msg.content.clone(),
                };
                out.push(ChatMessage::from(response));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use appforge_contract::{Message, ToolCall};
    use serde_json::json;

    #[test]
    fn system_prompt_leads_the_conversation() {
        let messages = vec![Message::user("s1", "hello")];
        let chat = to_chat_messages("you are boss", &messages);
        assert_eq!(chat.len(), 2);
    }

    #[test]
    fn assistant_tool_calls_survive_conversion() {
        let messages = vec![
            Message::assistant("s1", "").with_tool_calls(vec![ToolCall::new(
                "call_1",
                "write_file",
                json!({"path": "a.txt", "content": "x"}),
            )]),
            Message::tool_result("s1", "call_1", "ok"),
        ];
        let chat = to_chat_messages("", &messages);
        assert_eq!(chat.len(), 2);
    }
}
