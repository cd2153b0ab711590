//! The tool-calling loop.
//!
//! One invocation applies the middleware, streams a model turn, executes
//! any requested tools, and repeats until the model answers without tool
//! calls or the round cap is reached. Events are yielded as they happen;
//! the caller owns persistence and wire translation.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use genai::chat::{ChatOptions, ChatRequest};
use tokio_util::sync::CancellationToken;

use appforge_contract::{
    gen_id, AgentContext, Message, ToolCall, ToolInvocation, ToolRegistry, ToolResult,
};

use crate::compression::CompressionMiddleware;
use crate::provider::{to_chat_messages, ChatStreamProvider};
use crate::streaming::{StreamCollector, StreamOutput, StreamResult};

/// A role: prompt, model, and the tool subset it may call.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub system_prompt: String,
    pub model: String,
    pub tools: Vec<String>,
    pub max_rounds: usize,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            model: model.into(),
            tools: Vec::new(),
            max_rounds: 10,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Clone)]
pub struct LoopConfig {
    pub llm_attempts: usize,
    pub llm_backoff_base: Duration,
    pub tool_timeout: Duration,
    pub compression: Option<Arc<CompressionMiddleware>>,
    pub cancellation: Option<CancellationToken>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            llm_attempts: 3,
            llm_backoff_base: Duration::from_millis(500),
            tool_timeout: Duration::from_secs(120),
            compression: None,
            cancellation: None,
        }
    }
}

/// Events yielded by one loop invocation.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// A model turn begins; all stream deltas until the matching
    /// `AssistantComplete` share this message id.
    StepStart { message_id: String },
    TextDelta { delta: String },
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        index: usize,
        id: String,
        args_delta: String,
    },
    /// Consolidated tool call, emitted once arguments are complete.
    ToolCallReady { call: ToolCall },
    /// The model turn finished; `tool_calls` is the consolidated list.
    AssistantComplete {
        message_id: String,
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    ToolStart { call: ToolCall },
    /// Tool finished; `message_id` is the id of the tool message the caller
    /// should persist for this result.
    ToolDone {
        call: ToolCall,
        result: ToolResult,
        message_id: String,
    },
    StepEnd,
    /// The loop is done; final assistant text of the last turn.
    Finished { text: String },
    /// The loop was cancelled cooperatively.
    Cancelled,
    /// Model failure after retries were exhausted.
    Error { message: String, error_type: String },
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.is_some_and(|t| t.is_cancelled())
}

async fn call_model_with_retry(
    provider: &Arc<dyn ChatStreamProvider>,
    model: &str,
    request: ChatRequest,
    options: &ChatOptions,
    config: &LoopConfig,
) -> Result<crate::provider::ChatEventStream, String> {
    let mut last_error = String::new();
    for attempt in 0..config.llm_attempts {
        if attempt > 0 {
            let delay = config.llm_backoff_base * 2u32.saturating_pow(attempt as u32 - 1);
            tokio::time::sleep(delay).await;
        }
        match provider
            .exec_chat_stream(model, request.clone(), Some(options))
            .await
        {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(model, attempt, error = %last_error, "model call failed");
            }
        }
    }
    Err(last_error)
}

fn build_request(
    agent: &AgentDefinition,
    registry: &ToolRegistry,
    messages: &[Message],
) -> ChatRequest {
    let chat_messages = to_chat_messages(&agent.system_prompt, messages);
    let tools: Vec<genai::chat::Tool> = registry
        .descriptors(&agent.tools)
        .into_iter()
        .map(|d| {
            genai::chat::Tool::new(d.name)
                .with_description(d.description)
                .with_schema(d.parameters)
        })
        .collect();
    let mut request = ChatRequest::new(chat_messages);
    if !tools.is_empty() {
        request = request.with_tools(tools);
    }
    request
}

async fn execute_tool(
    registry: &ToolRegistry,
    ctx: &AgentContext,
    call: &ToolCall,
    timeout: Duration,
) -> ToolResult {
    let Some(tool) = registry.get(&call.name) else {
        return ToolResult::error(&call.name, format!("unknown tool: {}", call.name));
    };
    if let Err(e) = tool.validate_args(&call.args) {
        return ToolResult::error(&call.name, e.to_string());
    }
    let invocation = ToolInvocation {
        ctx,
        tool_call_id: &call.id,
    };
    match tokio::time::timeout(timeout, tool.execute(call.args.clone(), &invocation)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => ToolResult::error(&call.name, e.to_string()),
        Err(_) => ToolResult::error(
            &call.name,
            format!("tool timed out after {}s", timeout.as_secs()),
        ),
    }
}

/// Drive one agent invocation over `messages`.
///
/// The message list is the node's working view (history plus instruction);
/// assistant and tool messages produced here are appended to it internally
/// so follow-up rounds see them, and surfaced to the caller through events.
pub fn run_agent_loop(
    provider: Arc<dyn ChatStreamProvider>,
    agent: AgentDefinition,
    registry: ToolRegistry,
    ctx: Arc<AgentContext>,
    mut messages: Vec<Message>,
    config: LoopConfig,
) -> impl Stream<Item = LoopEvent> + Send {
    stream! {
        let options = ChatOptions::default()
            .with_capture_usage(true)
            .with_capture_tool_calls(true);
        let cancellation = config.cancellation.clone();
        let mut last_text = String::new();

        for _round in 0..agent.max_rounds {
            if is_cancelled(cancellation.as_ref()) {
                yield LoopEvent::Cancelled;
                return;
            }

            let mut working = messages.clone();
            if let Some(compression) = config.compression.as_ref() {
                working = compression.before_model(provider.as_ref(), working).await;
            }

            let request = build_request(&agent, &registry, &working);
            let mut chat_stream = match call_model_with_retry(
                &provider,
                &agent.model,
                request,
                &options,
                &config,
            )
            .await
            {
                Ok(stream) => stream,
                Err(message) => {
                    yield LoopEvent::Error {
                        message,
                        error_type: "model_error".to_string(),
                    };
                    return;
                }
            };

            let message_id = gen_id("msg");
            yield LoopEvent::StepStart { message_id: message_id.clone() };

            let mut collector = StreamCollector::new();
            loop {
                let next_event = if let Some(token) = cancellation.as_ref() {
                    tokio::select! {
                        _ = token.cancelled() => {
                            yield LoopEvent::Cancelled;
                            return;
                        }
                        ev = chat_stream.next() => ev,
                    }
                } else {
                    chat_stream.next().await
                };
                let Some(event_result) = next_event else {
                    break;
                };
                match event_result {
                    Ok(event) => {
                        if let Some(output) = collector.process(event) {
                            match output {
                                StreamOutput::TextDelta(delta) => {
                                    yield LoopEvent::TextDelta { delta };
                                }
                                StreamOutput::ToolCallStart { index, id, name } => {
                                    yield LoopEvent::ToolCallStart { index, id, name };
                                }
                                StreamOutput::ToolCallDelta { index, id, args_delta } => {
                                    yield LoopEvent::ToolCallDelta { index, id, args_delta };
                                }
                            }
                        }
                    }
                    Err(e) => {
                        yield LoopEvent::Error {
                            message: e.to_string(),
                            error_type: "model_stream_error".to_string(),
                        };
                        return;
                    }
                }
            }

            let result: StreamResult = collector.finish();
            last_text = result.text.clone();

            for call in &result.tool_calls {
                yield LoopEvent::ToolCallReady { call: call.clone() };
            }

            yield LoopEvent::AssistantComplete {
                message_id: message_id.clone(),
                text: result.text.clone(),
                tool_calls: result.tool_calls.clone(),
            };

            let assistant = Message::assistant(&ctx.session_id, &result.text)
                .with_id(message_id.clone())
                .with_agent(&agent.name)
                .with_tool_calls(result.tool_calls.clone());
            messages.push(assistant);

            if !result.needs_tools() {
                yield LoopEvent::StepEnd;
                yield LoopEvent::Finished { text: last_text };
                return;
            }

            for call in &result.tool_calls {
                if is_cancelled(cancellation.as_ref()) {
                    yield LoopEvent::Cancelled;
                    return;
                }
                yield LoopEvent::ToolStart { call: call.clone() };
                let result = execute_tool(&registry, &ctx, call, config.tool_timeout).await;
                let tool_msg_id = gen_id("msg");
                messages.push(
                    Message::tool_result(&ctx.session_id, &call.id, &result.output)
                        .with_id(tool_msg_id.clone())
                        .with_agent(&agent.name),
                );
                yield LoopEvent::ToolDone {
                    call: call.clone(),
                    result,
                    message_id: tool_msg_id,
                };
            }

            yield LoopEvent::StepEnd;
        }

        // Round cap reached with tools still pending; surface what we have.
        yield LoopEvent::Finished { text: last_text };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatEventStream, ProviderError};
    use async_trait::async_trait;
    use genai::chat::{ChatStreamEvent, StreamChunk, ToolChunk};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Mutex;

    use appforge_contract::storage::{EventStore, MessageStore};
    use appforge_contract::{Tool, ToolDescriptor, ToolError};
    use appforge_store_adapters::MemoryStore;

    /// Scripted provider: each call pops the next canned turn.
    pub(crate) struct ScriptedProvider {
        turns: Mutex<Vec<Vec<ChatStreamEvent>>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(turns: Vec<Vec<ChatStreamEvent>>) -> Self {
            Self {
                turns: Mutex::new(turns),
            }
        }
    }

    #[async_trait]
    impl ChatStreamProvider for ScriptedProvider {
        async fn exec_chat_stream(
            &self,
            _model: &str,
            _request: ChatRequest,
            _options: Option<&ChatOptions>,
        ) -> Result<ChatEventStream, ProviderError> {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                return Err(ProviderError::Call("script exhausted".to_string()));
            }
            let turn = turns.remove(0);
            Ok(Box::pin(futures::stream::iter(
                turn.into_iter().map(Ok::<_, genai::Error>),
            )))
        }

        async fn exec_chat_text(
            &self,
            _model: &str,
            _request: ChatRequest,
        ) -> Result<String, ProviderError> {
            Ok("summary".to_string())
        }
    }

    pub(crate) fn text_turn(words: &[&str]) -> Vec<ChatStreamEvent> {
        words
            .iter()
            .map(|w| {
                ChatStreamEvent::Chunk(StreamChunk {
                    content: w.to_string(),
                })
            })
            .collect()
    }

    pub(crate) fn tool_turn(call_id: &str, name: &str, args: Value) -> Vec<ChatStreamEvent> {
        vec![ChatStreamEvent::ToolCallChunk(ToolChunk {
            tool_call: genai::chat::ToolCall {
                call_id: call_id.to_string(),
                fn_name: name.to_string(),
                fn_arguments: Value::String(args.to_string()),
                thought_signatures: None,
            },
        })]
    }

    struct RecordingTool {
        calls: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("record", "Record the given arguments")
        }

        async fn execute(
            &self,
            args: Value,
            _call: &ToolInvocation<'_>,
        ) -> Result<ToolResult, ToolError> {
            self.calls.lock().unwrap().push(args);
            Ok(ToolResult::success("record", "ok"))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("explode", "Always fails")
        }

        async fn execute(
            &self,
            _args: Value,
            _call: &ToolInvocation<'_>,
        ) -> Result<ToolResult, ToolError> {
            Err(ToolError::ExecutionFailed("boom".to_string()))
        }
    }

    fn test_ctx() -> Arc<AgentContext> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(AgentContext {
            session_id: "sess_test".to_string(),
            workspace_id: "ws_test".to_string(),
            workspace_path: PathBuf::from("/tmp"),
            events: store.clone() as Arc<dyn EventStore>,
            messages: store as Arc<dyn MessageStore>,
            trace_id: None,
            api_base: None,
            api_key: None,
        })
    }

    async fn collect(
        provider: ScriptedProvider,
        agent: AgentDefinition,
        registry: ToolRegistry,
    ) -> Vec<LoopEvent> {
        let events = run_agent_loop(
            Arc::new(provider),
            agent,
            registry,
            test_ctx(),
            vec![Message::user("sess_test", "go")],
            LoopConfig {
                llm_attempts: 1,
                ..Default::default()
            },
        );
        events.collect().await
    }

    #[tokio::test]
    async fn text_only_turn_finishes_in_one_round() {
        let provider = ScriptedProvider::new(vec![text_turn(&["hel", "lo"])]);
        let agent = AgentDefinition::new("boss", "prompt", "test-model");
        let events = collect(provider, agent, ToolRegistry::new()).await;

        assert!(matches!(events[0], LoopEvent::StepStart { .. }));
        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                LoopEvent::TextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["hel", "lo"]);
        assert!(matches!(
            events.last(),
            Some(LoopEvent::Finished { text }) if text == "hello"
        ));
    }

    #[tokio::test]
    async fn step_deltas_share_the_step_message_id() {
        let provider = ScriptedProvider::new(vec![text_turn(&["x"])]);
        let agent = AgentDefinition::new("boss", "prompt", "test-model");
        let events = collect(provider, agent, ToolRegistry::new()).await;

        let step_id = events
            .iter()
            .find_map(|e| match e {
                LoopEvent::StepStart { message_id } => Some(message_id.clone()),
                _ => None,
            })
            .unwrap();
        let complete_id = events
            .iter()
            .find_map(|e| match e {
                LoopEvent::AssistantComplete { message_id, .. } => Some(message_id.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(step_id, complete_id);
    }

    #[tokio::test]
    async fn tool_round_then_final_answer() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = ToolRegistry::new().with_tool(Arc::new(RecordingTool {
            calls: calls.clone(),
        }));
        let provider = ScriptedProvider::new(vec![
            tool_turn("call_1", "record", json!({"value": 42})),
            text_turn(&["done"]),
        ]);
        let agent =
            AgentDefinition::new("engineer", "prompt", "test-model").with_tools(vec!["record".to_string()]);
        let events = collect(provider, agent, registry).await;

        assert_eq!(calls.lock().unwrap().len(), 1);
        let tool_done = events
            .iter()
            .find_map(|e| match e {
                LoopEvent::ToolDone { result, message_id, .. } => {
                    Some((result.clone(), message_id.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert!(!tool_done.0.is_error());
        assert!(!tool_done.1.is_empty());
        // Two distinct steps, two distinct assistant message ids.
        let step_ids: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                LoopEvent::StepStart { message_id } => Some(message_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(step_ids.len(), 2);
        assert_ne!(step_ids[0], step_ids[1]);
    }

    #[tokio::test]
    async fn tool_failure_is_surfaced_not_fatal() {
        let registry = ToolRegistry::new().with_tool(Arc::new(FailingTool));
        let provider = ScriptedProvider::new(vec![
            tool_turn("call_1", "explode", json!({})),
            text_turn(&["recovered"]),
        ]);
        let agent =
            AgentDefinition::new("engineer", "prompt", "test-model").with_tools(vec!["explode".to_string()]);
        let events = collect(provider, agent, registry).await;

        let result = events
            .iter()
            .find_map(|e| match e {
                LoopEvent::ToolDone { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert!(result.is_error());
        assert!(matches!(
            events.last(),
            Some(LoopEvent::Finished { text }) if text == "recovered"
        ));
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let provider = ScriptedProvider::new(vec![
            tool_turn("call_1", "nonexistent", json!({})),
            text_turn(&["ok"]),
        ]);
        let agent = AgentDefinition::new("engineer", "prompt", "test-model")
            .with_tools(vec!["nonexistent".to_string()]);
        let events = collect(provider, agent, ToolRegistry::new()).await;
        let result = events
            .iter()
            .find_map(|e| match e {
                LoopEvent::ToolDone { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert!(result.is_error());
        assert!(result.output.contains("unknown tool"));
    }

    #[tokio::test]
    async fn provider_exhaustion_yields_error_event() {
        let provider = ScriptedProvider::new(vec![]);
        let agent = AgentDefinition::new("boss", "prompt", "test-model");
        let events = collect(provider, agent, ToolRegistry::new()).await;
        assert!(matches!(
            events.last(),
            Some(LoopEvent::Error { error_type, .. }) if error_type == "model_error"
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let token = CancellationToken::new();
        token.cancel();
        let provider = ScriptedProvider::new(vec![text_turn(&["never"])]);
        let agent = AgentDefinition::new("boss", "prompt", "test-model");
        let events: Vec<LoopEvent> = run_agent_loop(
            Arc::new(provider),
            agent,
            ToolRegistry::new(),
            test_ctx(),
            vec![Message::user("sess_test", "go")],
            LoopConfig {
                cancellation: Some(token),
                ..Default::default()
            },
        )
        .collect()
        .await;
        assert!(matches!(events.last(), Some(LoopEvent::Cancelled)));
    }
}
