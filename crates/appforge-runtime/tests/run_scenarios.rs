//! End-to-end runtime scenarios against the in-memory store and a scripted
//! model provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use genai::chat::{ChatOptions, ChatRequest, ChatStreamEvent, StreamChunk, ToolChunk};
use serde_json::{json, Value};

use appforge_agent_loop::{ChatStreamProvider, LoopConfig, ProviderError};
use appforge_contract::storage::{EventStore, MessageStore, StopSignals};
use appforge_contract::{EventType, FinishStatus, Framework, Message, Role};
use appforge_runtime::{run_session, RuntimeConfig, RuntimeDeps};
use appforge_store_adapters::MemoryStore;
use appforge_team::GraphConfig;

struct ScriptedProvider {
    turns: Mutex<Vec<Vec<ChatStreamEvent>>>,
    /// When the script is exhausted, park forever instead of erroring.
    hang_when_empty: bool,
}

impl ScriptedProvider {
    fn new(turns: Vec<Vec<ChatStreamEvent>>) -> Self {
        Self {
            turns: Mutex::new(turns),
            hang_when_empty: false,
        }
    }

    fn hanging() -> Self {
        Self {
            turns: Mutex::new(Vec::new()),
            hang_when_empty: true,
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
    ) -> Result<BoxStream<'static, Result<ChatStreamEvent, genai::Error>>, ProviderError> {
        let mut turns = self.turns.lock().unwrap();
        if turns.is_empty() {
            if self.hang_when_empty {
                return Ok(Box::pin(futures::stream::pending()));
            }
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

fn text(content: &str) -> ChatStreamEvent {
    ChatStreamEvent::Chunk(StreamChunk {
        content: content.to_string(),
    })
}

fn end_marker_turn(words: &[&str]) -> Vec<ChatStreamEvent> {
    let mut events: Vec<ChatStreamEvent> = words.iter().map(|w| text(w)).collect();
    events.push(text(
        "\n[WORKFLOW_DECISION]{\"next_action\": \"end\"}[/WORKFLOW_DECISION]",
    ));
    events
}

fn continue_marker_turn(words: &[&str]) -> Vec<ChatStreamEvent> {
    let mut events: Vec<ChatStreamEvent> = words.iter().map(|w| text(w)).collect();
    events.push(text(
        "\n[WORKFLOW_DECISION]{\"next_action\": \"continue\"}[/WORKFLOW_DECISION]",
    ));
    events
}

fn tool_chunk(call_id: &str, name: &str, args: &str) -> ChatStreamEvent {
    ChatStreamEvent::ToolCallChunk(ToolChunk {
        tool_call: genai::chat::ToolCall {
            call_id: call_id.to_string(),
            fn_name: name.to_string(),
            fn_arguments: Value::String(args.to_string()),
            thought_signatures: None,
        },
    })
}

struct Harness {
    store: Arc<MemoryStore>,
    workspace: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            workspace: tempfile::tempdir().unwrap(),
        }
    }

    async fn seed_user(&self, session_id: &str, prompt: &str) -> Message {
        let msg = Message::user(session_id, prompt);
        self.store.append_message(&msg).await.unwrap();
        msg
    }

    fn config(&self, session_id: &str) -> RuntimeConfig {
        let mut config = RuntimeConfig::new(session_id, "ws_test", Framework::Nextjs);
        config.workspace_path = self.workspace.path().to_path_buf();
        config.stop_poll_interval = Duration::from_millis(10);
        config.graph = GraphConfig {
            model: "test-model".to_string(),
            max_transitions: 8,
            loop_config: LoopConfig {
                llm_attempts: 1,
                ..Default::default()
            },
        };
        config
    }

    fn deps(&self, provider: ScriptedProvider) -> RuntimeDeps {
        RuntimeDeps {
            events: self.store.clone(),
            messages: self.store.clone(),
            stop: self.store.clone(),
            provider: Arc::new(provider),
            registry: appforge_tools::team_registry(),
        }
    }
}

fn type_sequence(events: &[appforge_contract::Event]) -> Vec<EventType> {
    events.iter().map(|e| e.event_type).collect()
}

/// Assert `expected` appears as a subsequence of the stored event types.
fn assert_subsequence(events: &[appforge_contract::Event], expected: &[EventType]) {
    let types = type_sequence(events);
    let mut iter = types.iter();
    for want in expected {
        assert!(
            iter.any(|t| t == want),
            "expected {want:?} in order within {types:?}"
        );
    }
}

fn assert_universal_invariants(events: &[appforge_contract::Event]) {
    // Non-decreasing timestamps, at most one finish.
    let mut last_ts = f64::MIN;
    for event in events {
        assert!(event.timestamp >= last_ts, "timestamps must not decrease");
        last_ts = event.timestamp;
    }
    let finishes = events
        .iter()
        .filter(|e| e.event_type == EventType::Finish)
        .count();
    assert!(finishes <= 1, "at most one finish, got {finishes}");

    // llm_stream runs close with a message_complete carrying the same id.
    for (stream_pos, event) in events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.event_type == EventType::LlmStream)
    {
        let id = event
            .message_id
            .as_deref()
            .expect("llm_stream without message_id");
        let closing = events.iter().enumerate().any(|(i, e)| {
            i > stream_pos
                && e.event_type == EventType::MessageComplete
                && e.message_id.as_deref() == Some(id)
        });
        assert!(closing, "llm_stream {id} never closed by message_complete");
    }
}

#[tokio::test]
async fn scenario_single_turn_happy_path() {
    let harness = Harness::new();
    let session = "sess_happy";
    harness.seed_user(session, "hello").await;

    let provider = ScriptedProvider::new(vec![end_marker_turn(&["I ", "can ", "help"])]);
    let status = run_session(harness.deps(provider), harness.config(session)).await;
    assert_eq!(status, FinishStatus::Success);

    let events = harness.store.events_snapshot(session).await;
    assert_universal_invariants(&events);
    assert_subsequence(
        &events,
        &[
            EventType::AgentStart,
            EventType::NodeStart,
            EventType::LlmStream,
            EventType::MessageComplete,
            EventType::NodeEnd,
            EventType::Finish,
        ],
    );

    // All llm_stream events share one message id, closed by the complete.
    let stream_ids: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == EventType::LlmStream)
        .map(|e| e.message_id.as_deref().unwrap())
        .collect();
    assert!(!stream_ids.is_empty());
    assert!(stream_ids.windows(2).all(|w| w[0] == w[1]));

    let node_end = events
        .iter()
        .find(|e| e.event_type == EventType::NodeEnd)
        .unwrap();
    assert_eq!(node_end.data["node_name"], "boss");
    assert_eq!(node_end.data["decision"], "end");

    let finish = events
        .iter()
        .find(|e| e.event_type == EventType::Finish)
        .unwrap();
    assert_eq!(finish.data["status"], "success");

    // History: user turn then the assistant message.
    let history = harness.store.messages_snapshot(session).await;
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "hello");
    let assistant = history.iter().find(|m| m.role == Role::Assistant).unwrap();
    assert!(assistant.content.contains("I can help"));
    assert_eq!(assistant.agent_name.as_deref(), Some("boss"));
}

#[tokio::test]
async fn scenario_multi_node_routing() {
    let harness = Harness::new();
    let session = "sess_route";
    harness.seed_user(session, "build it").await;

    let provider = ScriptedProvider::new(vec![
        continue_marker_turn(&["requirements ", "written"]),
        end_marker_turn(&["prd ", "written"]),
    ]);
    let status = run_session(harness.deps(provider), harness.config(session)).await;
    assert_eq!(status, FinishStatus::Success);

    let events = harness.store.events_snapshot(session).await;
    assert_universal_invariants(&events);

    let node_starts: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == EventType::NodeStart)
        .map(|e| e.data["node_name"].as_str().unwrap())
        .collect();
    assert_eq!(node_starts, vec!["boss", "product_manager"]);

    // node_end(boss) precedes node_start(product_manager).
    let boss_end = events
        .iter()
        .position(|e| e.event_type == EventType::NodeEnd && e.data["node_name"] == "boss")
        .unwrap();
    let pm_start = events
        .iter()
        .position(|e| e.event_type == EventType::NodeStart && e.data["node_name"] == "product_manager")
        .unwrap();
    assert!(boss_end < pm_start);

    // Two distinct assistant message ids, each with its own stream run.
    let complete_ids: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == EventType::MessageComplete)
        .filter(|e| e.data["role"] == "assistant")
        .map(|e| e.message_id.as_deref().unwrap())
        .collect();
    assert_eq!(complete_ids.len(), 2);
    assert_ne!(complete_ids[0], complete_ids[1]);

    // Stage changed requirement -> design when PM ran.
    let stage = events
        .iter()
        .find(|e| e.event_type == EventType::StageChange)
        .unwrap();
    assert_eq!(stage.data["from_stage"], "requirement");
    assert_eq!(stage.data["to_stage"], "design");
}

#[tokio::test]
async fn scenario_tool_call_writes_workspace_file() {
    let harness = Harness::new();
    let session = "sess_tool";
    harness.seed_user(session, "write a file").await;

    let provider = ScriptedProvider::new(vec![
        // Name first, then streamed argument fragments.
        vec![
            tool_chunk("t1", "write_file", ""),
            tool_chunk("t1", "", r#"{"path": "a.txt","#),
            tool_chunk("t1", "", r#"{"path": "a.txt", "content": "x"}"#),
        ],
        end_marker_turn(&["file written"]),
    ]);
    let status = run_session(harness.deps(provider), harness.config(session)).await;
    assert_eq!(status, FinishStatus::Success);

    let events = harness.store.events_snapshot(session).await;
    assert_universal_invariants(&events);

    // Streamed tool-call fragments: index 0, name on the first, id always.
    let tool_streams: Vec<&appforge_contract::Event> = events
        .iter()
        .filter(|e| {
            e.event_type == EventType::LlmStream && e.data["content_type"] == "tool_call"
        })
        .collect();
    assert!(!tool_streams.is_empty());
    assert_eq!(tool_streams[0].data["tool_call_index"], 0);
    assert_eq!(tool_streams[0].data["tool_call_name"], "write_file");
    assert_eq!(tool_streams[0].data["tool_call_id"], "t1");
    assert!(tool_streams[1..]
        .iter()
        .all(|e| e.data["tool_call_id"] == "t1"));

    // Consolidated tool_calls on the assistant message_complete.
    let assistant_complete = events
        .iter()
        .find(|e| e.event_type == EventType::MessageComplete && e.data["role"] == "assistant")
        .unwrap();
    assert_eq!(assistant_complete.data["tool_calls"][0]["id"], "t1");
    assert_eq!(
        assistant_complete.data["tool_calls"][0]["name"],
        "write_file"
    );

    assert_subsequence(
        &events,
        &[
            EventType::ToolStart,
            EventType::ToolEnd,
            EventType::MessageComplete,
        ],
    );
    let tool_end = events
        .iter()
        .find(|e| e.event_type == EventType::ToolEnd)
        .unwrap();
    assert_eq!(tool_end.data["tool_call_id"], "t1");
    assert!(tool_end.data.get("error").is_none());

    // Tool-role message_complete linked by tool_call_id.
    let tool_complete = events
        .iter()
        .find(|e| e.event_type == EventType::MessageComplete && e.data["role"] == "tool")
        .unwrap();
    assert_eq!(tool_complete.data["tool_call_id"], "t1");

    // The workspace actually contains the file.
    let written = std::fs::read_to_string(harness.workspace.path().join("a.txt")).unwrap();
    assert_eq!(written, "x");

    // Tool message timestamped after the assistant message (property 3).
    let history = harness.store.messages_snapshot(session).await;
    let assistant_pos = history
        .iter()
        .position(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
        .unwrap();
    let tool_pos = history
        .iter()
        .position(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some("t1"))
        .unwrap();
    assert!(tool_pos > assistant_pos);
}

#[tokio::test]
async fn run_without_user_turn_stops_before_any_node() {
    let harness = Harness::new();
    let session = "sess_nouser";
    // No messages at all.
    let provider = ScriptedProvider::new(vec![end_marker_turn(&["should not run"])]);
    let status = run_session(harness.deps(provider), harness.config(session)).await;
    assert_eq!(status, FinishStatus::Stopped);

    let events = harness.store.events_snapshot(session).await;
    assert!(events.iter().all(|e| e.event_type != EventType::NodeStart));
    let finish = events
        .iter()
        .find(|e| e.event_type == EventType::Finish)
        .unwrap();
    assert_eq!(finish.data["status"], "stopped");
    assert_eq!(finish.data["reason"], "no-user-turn");
}

#[tokio::test]
async fn run_with_assistant_as_last_message_is_skipped() {
    let harness = Harness::new();
    let session = "sess_lastassist";
    harness.seed_user(session, "hi").await;
    let assistant = Message::assistant(session, "already answered");
    harness.store.append_message(&assistant).await.unwrap();

    let provider = ScriptedProvider::new(vec![]);
    let status = run_session(harness.deps(provider), harness.config(session)).await;
    assert_eq!(status, FinishStatus::Stopped);
    let events = harness.store.events_snapshot(session).await;
    assert!(events.iter().all(|e| e.event_type != EventType::AgentStart));
}

#[tokio::test]
async fn model_failure_emits_agent_error_then_failed_finish() {
    let harness = Harness::new();
    let session = "sess_fail";
    harness.seed_user(session, "hello").await;

    let provider = ScriptedProvider::new(vec![]);
    let status = run_session(harness.deps(provider), harness.config(session)).await;
    assert_eq!(status, FinishStatus::Failed);

    let events = harness.store.events_snapshot(session).await;
    assert_universal_invariants(&events);
    assert_subsequence(&events, &[EventType::AgentError, EventType::Finish]);
    let finish = events
        .iter()
        .find(|e| e.event_type == EventType::Finish)
        .unwrap();
    assert_eq!(finish.data["status"], "failed");
}

#[tokio::test]
async fn stop_request_cancels_the_run_within_grace() {
    let harness = Harness::new();
    let session = "sess_stop";
    harness.seed_user(session, "long job").await;

    let deps = harness.deps(ScriptedProvider::hanging());
    let stop_handle = harness.store.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_handle.request_stop(session).await.unwrap();
    });

    let status = tokio::time::timeout(
        Duration::from_secs(5),
        run_session(deps, harness.config(session)),
    )
    .await
    .expect("stop must end the run within the grace period");
    assert_eq!(status, FinishStatus::Stopped);
    stopper.await.unwrap();

    let events = harness.store.events_snapshot(session).await;
    let finish = events
        .iter()
        .find(|e| e.event_type == EventType::Finish)
        .unwrap();
    assert_eq!(finish.data["status"], "stopped");

    // Stop signal is cleared so a follow-up generate is accepted.
    assert!(!harness.store.is_stop_requested(session).await.unwrap());
}

#[tokio::test]
async fn events_since_watermark_returns_exactly_later_events() {
    let harness = Harness::new();
    let session = "sess_resume";
    harness.seed_user(session, "hello").await;

    let provider = ScriptedProvider::new(vec![end_marker_turn(&["a", "b", "c"])]);
    run_session(harness.deps(provider), harness.config(session)).await;

    let all = harness.store.events_snapshot(session).await;
    assert!(all.len() >= 4);
    let tau = all[2].timestamp;
    let resumed = harness
        .store
        .events_since(session, Some(tau), 1000)
        .await
        .unwrap();
    let expected: Vec<&str> = all
        .iter()
        .filter(|e| e.timestamp > tau)
        .map(|e| e.id.as_str())
        .collect();
    let got: Vec<&str> = resumed.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(got, expected);
}
