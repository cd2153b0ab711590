//! Context compression middleware.
//!
//! Pre-model hook that summarises older turns when the conversation grows
//! past its budgets. The cutoff never separates an assistant's tool_calls
//! from their matching tool results, and a failed summarisation falls back
//! to pass-through rather than dropping content.

use genai::chat::ChatRequest;

use appforge_contract::{Message, Role};

use crate::provider::ChatStreamProvider;

const DEFAULT_SUMMARY_PROMPT: &str = "Summarise the key information in the conversation below: \
important decisions, documents produced, and conclusions reached. Use short bullet points, one \
per line. Output only the summary.\n\nConversation:\n{messages}";

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| m.content.len() / 4 + 8)
        .sum()
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Summarise when the message count reaches this value.
    pub trigger_messages: Option<usize>,
    /// Summarise when the estimated token count reaches this value.
    pub trigger_tokens: Option<usize>,
    /// Keep the last N messages verbatim.
    pub keep_messages: usize,
    pub summary_model: String,
    pub summary_prompt: Option<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            trigger_messages: Some(50),
            trigger_tokens: Some(24_000),
            keep_messages: 20,
            summary_model: "gpt-4o-mini".to_string(),
            summary_prompt: None,
        }
    }
}

pub struct CompressionMiddleware {
    config: CompressionConfig,
}

impl CompressionMiddleware {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    fn should_summarise(&self, messages: &[Message]) -> bool {
        if let Some(count) = self.config.trigger_messages {
            if messages.len() >= count {
                return true;
            }
        }
        if let Some(tokens) = self.config.trigger_tokens {
            if estimate_tokens(messages) >= tokens {
                return true;
            }
        }
        false
    }

    /// Youngest index that keeps the retention target intact without cutting
    /// between an assistant's tool_calls and their tool results.
    pub fn cutoff_index(&self, messages: &[Message]) -> usize {
        if messages.len() <= self.config.keep_messages {
            return 0;
        }
        let target = messages.len() - self.config.keep_messages;
        safe_cutoff(messages, target)
    }

    /// Apply the middleware: pass-through below the trigger, otherwise
    /// replace the prefix with a single synthetic user message.
    pub async fn before_model(
        &self,
        provider: &dyn ChatStreamProvider,
        messages: Vec<Message>,
    ) -> Vec<Message> {
        if !self.should_summarise(&messages) {
            return messages;
        }
        let cutoff = self.cutoff_index(&messages);
        if cutoff == 0 {
            return messages;
        }
        let (prefix, suffix) = messages.split_at(cutoff);

        let transcript: String = prefix
            .iter()
            .map(|m| format!("{}: {}\n", m.role.as_str(), m.content))
            .collect();
        let prompt_template = self
            .config
            .summary_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SUMMARY_PROMPT);
        let prompt = prompt_template.replace("{messages}", &transcript);

        let request = ChatRequest::new(vec![genai::chat::ChatMessage::user(prompt)]);
        let summary = match provider
            .exec_chat_text(&self.config.summary_model, request)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) | Err(_) => {
                tracing::warn!("summarisation failed, passing messages through unchanged");
                return prefix.iter().chain(suffix.iter()).cloned().collect();
            }
        };

        let session_id = messages
            .first()
            .map(|m| m.session_id.clone())
            .unwrap_or_default();
        let mut digest = Message::user(
            session_id,
            format!("Here is a summary of the conversation to date:\n\n{summary}"),
        );
        digest
            .metadata
            .insert("source".to_string(), serde_json::json!("summarization"));

        let mut out = Vec::with_capacity(suffix.len() + 1);
        out.push(digest);
        out.extend(suffix.iter().cloned());
        out
    }
}

/// Back the cutoff up so no tool message is separated from the assistant
/// message that requested it.
fn safe_cutoff(messages: &[Message], cutoff: usize) -> usize {
    if cutoff >= messages.len() {
        return cutoff;
    }
    if messages[cutoff].role != Role::Tool {
        return cutoff;
    }
    // Collect the run of tool results at the cutoff, then find the
    // assistant that issued them.
    let mut tool_call_ids = Vec::new();
    let mut idx = cutoff;
    while idx < messages.len() && messages[idx].role == Role::Tool {
        if let Some(id) = &messages[idx].tool_call_id {
            tool_call_ids.push(id.clone());
        }
        idx += 1;
    }
    for i in (0..cutoff).rev() {
        let msg = &messages[i];
        if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
            let issued: Vec<&str> = msg.tool_calls.iter().map(|tc| tc.id.as_str()).collect();
            if tool_call_ids.iter().any(|id| issued.contains(&id.as_str())) {
                return i;
            }
        }
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatEventStream, ProviderError};
    use async_trait::async_trait;
    use genai::chat::ChatOptions;
    use serde_json::json;

    use appforge_contract::ToolCall;

    struct FixedSummary(&'static str);

    #[async_trait]
    impl ChatStreamProvider for FixedSummary {
        async fn exec_chat_stream(
            &self,
            _: &str,
            _: ChatRequest,
            _: Option<&ChatOptions>,
        ) -> Result<ChatEventStream, ProviderError> {
            Err(ProviderError::Call("not used".to_string()))
        }

        async fn exec_chat_text(&self, _: &str, _: ChatRequest) -> Result<String, ProviderError> {
            if self.0.is_empty() {
                Err(ProviderError::Call("summariser down".to_string()))
            } else {
                Ok(self.0.to_string())
            }
        }
    }

    fn user(content: &str) -> Message {
        Message::user("s1", content)
    }

    fn assistant_with_call(call_id: &str) -> Message {
        Message::assistant("s1", "calling").with_tool_calls(vec![ToolCall::new(
            call_id,
            "read_file",
            json!({"path": "a"}),
        )])
    }

    fn tool_msg(call_id: &str) -> Message {
        Message::tool_result("s1", call_id, "ok")
    }

    fn middleware(keep: usize, trigger: usize) -> CompressionMiddleware {
        CompressionMiddleware::new(CompressionConfig {
            trigger_messages: Some(trigger),
            trigger_tokens: None,
            keep_messages: keep,
            summary_model: "summary-model".to_string(),
            summary_prompt: None,
        })
    }

    #[tokio::test]
    async fn below_trigger_is_pass_through() {
        let mw = middleware(2, 10);
        let messages = vec![user("a"), user("b"), user("c")];
        let out = mw.before_model(&FixedSummary("digest"), messages.clone()).await;
        assert_eq!(out.len(), messages.len());
        assert_eq!(out[0].content, "a");
    }

    #[tokio::test]
    async fn compresses_prefix_into_one_digest() {
        let mw = middleware(2, 4);
        let messages = vec![user("a"), user("b"), user("c"), user("d")];
        let out = mw.before_model(&FixedSummary("the digest"), messages).await;
        assert_eq!(out.len(), 3);
        assert!(out[0].content.contains("the digest"));
        assert_eq!(out[1].content, "c");
        assert_eq!(out[2].content, "d");
    }

    #[tokio::test]
    async fn preserved_suffix_count_survives_compression() {
        let mw = middleware(3, 5);
        let messages: Vec<Message> = (0..9).map(|i| user(&format!("m{i}"))).collect();
        let out = mw.before_model(&FixedSummary("d"), messages).await;
        assert_eq!(out.len(), 3 + 1);
    }

    #[test]
    fn cutoff_backs_up_over_tool_pairs() {
        let messages = vec![
            user("start"),
            assistant_with_call("call_1"),
            tool_msg("call_1"),
            user("next"),
        ];
        // Naive cutoff at index 2 would split call_1 from its result.
        let mw = middleware(2, 1);
        assert_eq!(mw.cutoff_index(&messages), 1);
    }

    #[test]
    fn cutoff_unmoved_when_not_on_tool_message() {
        let messages = vec![user("a"), user("b"), user("c"), user("d")];
        let mw = middleware(2, 1);
        assert_eq!(mw.cutoff_index(&messages), 2);
    }

    #[tokio::test]
    async fn compressed_list_never_splits_tool_pairs() {
        let mw = middleware(2, 3);
        let messages = vec![
            user("start"),
            assistant_with_call("call_9"),
            tool_msg("call_9"),
            user("tail"),
        ];
        let out = mw.before_model(&FixedSummary("d"), messages).await;
        for (i, msg) in out.iter().enumerate() {
            if msg.role == Role::Tool {
                let id = msg.tool_call_id.as_deref().unwrap();
                let matched = out[..i].iter().any(|m| {
                    m.role == Role::Assistant && m.tool_calls.iter().any(|tc| tc.id == id)
                });
                assert!(matched, "tool message lost its assistant pair");
            }
        }
    }

    #[tokio::test]
    async fn summariser_failure_passes_through() {
        let mw = middleware(2, 4);
        let messages = vec![user("a"), user("b"), user("c"), user("d")];
        let out = mw.before_model(&FixedSummary(""), messages.clone()).await;
        assert_eq!(out.len(), messages.len());
        assert_eq!(out[0].content, "a");
    }

    #[test]
    fn token_trigger_fires() {
        let mw = CompressionMiddleware::new(CompressionConfig {
            trigger_messages: None,
            trigger_tokens: Some(10),
            keep_messages: 1,
            summary_model: "m".to_string(),
            summary_prompt: None,
        });
        let long = vec![user(&"x".repeat(200)), user("tail")];
        assert!(mw.should_summarise(&long));
        let short = vec![user("hi")];
        assert!(!mw.should_summarise(&short));
    }
}
