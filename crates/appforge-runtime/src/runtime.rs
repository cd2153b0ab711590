use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use appforge_agent_loop::{ChatStreamProvider, LoopEvent};
use appforge_contract::event::{
    AgentErrorData, AgentStartData, CustomData, LlmStreamData, MessageCompleteData, NodeEndData,
    NodeStartData, StageChangeData, StreamContentType, ToolEndData, ToolStartData,
};
use appforge_contract::storage::{EventStore, MessageStore, SortOrder, StopSignals, StoreError};
use appforge_contract::{
    with_context, AgentContext, Event, FinishStatus, Framework, Message, Role, TeamState,
    ToolRegistry,
};
use appforge_team::{GraphConfig, GraphItem, TeamGraph};

#[derive(Clone)]
pub struct RuntimeConfig {
    pub session_id: String,
    pub workspace_id: String,
    pub workspace_path: PathBuf,
    pub framework: Framework,
    pub trace_id: Option<String>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    /// Prior messages preloaded into the initial Team State.
    pub history_limit: usize,
    /// How often the stop-signal registry is polled.
    pub stop_poll_interval: Duration,
    pub graph: GraphConfig,
}

impl RuntimeConfig {
    pub fn new(session_id: impl Into<String>, workspace_id: impl Into<String>, framework: Framework) -> Self {
        Self {
            session_id: session_id.into(),
            workspace_id: workspace_id.into(),
            workspace_path: PathBuf::from("/workspace"),
            framework,
            trace_id: None,
            api_base: None,
            api_key: None,
            history_limit: 100,
            stop_poll_interval: Duration::from_secs(1),
            graph: GraphConfig::default(),
        }
    }
}

pub struct RuntimeDeps {
    pub events: Arc<dyn EventStore>,
    pub messages: Arc<dyn MessageStore>,
    pub stop: Arc<dyn StopSignals>,
    pub provider: Arc<dyn ChatStreamProvider>,
    pub registry: ToolRegistry,
}

const APPEND_ATTEMPTS: usize = 3;
const APPEND_BACKOFF: Duration = Duration::from_millis(200);

/// Event/message writer with bounded retry on persistence failures.
struct Emitter {
    events: Arc<dyn EventStore>,
    messages: Arc<dyn MessageStore>,
    trace_id: Option<String>,
}

impl Emitter {
    async fn emit(&self, mut event: Event) -> Result<(), StoreError> {
        event.trace_id = self.trace_id.clone();
        let mut last = None;
        for attempt in 0..APPEND_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(APPEND_BACKOFF * attempt as u32).await;
            }
            match self.events.append_event(&event).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, event_type = %event.event_type, "event append failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| StoreError::Persistence("append failed".to_string())))
    }

    async fn persist(&self, mut message: Message) -> Result<(), StoreError> {
        message.trace_id = self.trace_id.clone();
        let mut last = None;
        for attempt in 0..APPEND_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(APPEND_BACKOFF * attempt as u32).await;
            }
            match self.messages.append_message(&message).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "message append failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| StoreError::Persistence("append failed".to_string())))
    }
}

/// State of the assistant message currently streaming.
struct OpenMessage {
    id: String,
    node: String,
}

/// Execute one run end-to-end and return its terminal status.
///
/// Exactly one `finish` event is appended on every path out of here.
pub async fn run_session(deps: RuntimeDeps, config: RuntimeConfig) -> FinishStatus {
    let session_id = config.session_id.clone();
    let emitter = Emitter {
        events: deps.events.clone(),
        messages: deps.messages.clone(),
        trace_id: config.trace_id.clone(),
    };

    let (status, reason) = match drive(&deps, &config, &emitter).await {
        Outcome::NoUserTurn => (FinishStatus::Stopped, Some("no-user-turn".to_string())),
        Outcome::Completed(FinishStatus::Stopped) => {
            (FinishStatus::Stopped, Some("stop-requested".to_string()))
        }
        Outcome::Completed(status) => (status, None),
    };
    // Best-effort: losing the finish event would strand the orchestrator
    // until its own synthesis kicks in.
    if let Err(e) = emitter
        .emit(Event::finish(&session_id, status, reason))
        .await
    {
        error!(error = %e, "failed to append finish event");
    }
    let _ = deps.stop.clear(&session_id).await;
    info!(session_id = %session_id, status = status.as_str(), "run finished");
    status
}

enum Outcome {
    /// The last stored message was not a user turn; no node ran.
    NoUserTurn,
    Completed(FinishStatus),
}

/// Inner drive loop; the caller appends the sole terminal `finish`.
async fn drive(deps: &RuntimeDeps, config: &RuntimeConfig, emitter: &Emitter) -> Outcome {
    let session_id = &config.session_id;

    // Input resolution: the prompt must already be durably recorded.
    let last = match deps.messages.last_message(session_id).await {
        Ok(last) => last,
        Err(e) => {
            error!(error = %e, "cannot read last message");
            return Outcome::Completed(FinishStatus::Failed);
        }
    };
    let Some(user_msg) = last.filter(|m| m.role == Role::User) else {
        info!("last stored message is not a user turn, skipping run");
        return Outcome::NoUserTurn;
    };
    let prompt = user_msg.content.clone();

    let history = match deps
        .messages
        .list_messages(session_id, config.history_limit, SortOrder::Asc)
        .await
    {
        Ok(history) => history,
        Err(e) => {
            error!(error = %e, "cannot load history");
            return Outcome::Completed(FinishStatus::Failed);
        }
    };

    if emitter
        .emit(
            Event::agent_start(
                session_id,
                AgentStartData {
                    prompt: prompt.clone(),
                    framework: config.framework.as_str().to_string(),
                    message_id: user_msg.id.clone(),
                },
            )
            .with_agent("team"),
        )
        .await
        .is_err()
    {
        return Outcome::Completed(FinishStatus::Failed);
    }

    // Stop watcher cancels the loop token; the graph unwinds cooperatively.
    let cancel = CancellationToken::new();
    let watcher = {
        let stop = deps.stop.clone();
        let session_id = session_id.clone();
        let token = cancel.clone();
        let interval = config.stop_poll_interval;
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    return;
                }
                match stop.is_stop_requested(&session_id).await {
                    Ok(true) => {
                        info!("stop requested, cancelling run");
                        token.cancel();
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "stop-signal poll failed"),
                }
                tokio::time::sleep(interval).await;
            }
        })
    };

    let ctx = Arc::new(AgentContext {
        session_id: session_id.clone(),
        workspace_id: config.workspace_id.clone(),
        workspace_path: config.workspace_path.clone(),
        events: deps.events.clone(),
        messages: deps.messages.clone(),
        trace_id: config.trace_id.clone(),
        api_base: config.api_base.clone(),
        api_key: config.api_key.clone(),
    });
    appforge_contract::context::install_global_fallback(ctx.clone());

    let mut graph_config = config.graph.clone();
    graph_config.loop_config.cancellation = Some(cancel.clone());
    let graph = TeamGraph::new(deps.provider.clone(), deps.registry.clone(), graph_config);
    let state = TeamState::new(&config.workspace_id, config.framework).with_history(history);

    let status = with_context(
        ctx.clone(),
        translate_stream(graph.run(ctx.clone(), state), emitter, config, &user_msg.id),
    )
    .await;

    cancel.cancel();
    watcher.abort();
    appforge_contract::context::clear_global_fallback();
    Outcome::Completed(status)
}

/// Translate the orchestrator's stream into the persisted event taxonomy.
async fn translate_stream(
    graph_stream: impl futures::Stream<Item = GraphItem> + Send,
    emitter: &Emitter,
    config: &RuntimeConfig,
    user_message_id: &str,
) -> FinishStatus {
    let session_id = &config.session_id;
    let mut stream = Box::pin(graph_stream);

    // Parent chain for the message forest, rooted at the user turn.
    let mut parent_id = user_message_id.to_string();
    let mut open: Option<OpenMessage> = None;
    let mut failed = false;
    let mut stopped = false;

    while let Some(item) = stream.next().await {
        let result: Result<(), StoreError> = match item {
            GraphItem::NodeStart { node } => {
                emitter
                    .emit(Event::node_start(
                        session_id,
                        NodeStartData {
                            node_name: node.as_str().to_string(),
                            namespace: Vec::new(),
                        },
                    ))
                    .await
            }
            GraphItem::Loop { node, event } => match event {
                LoopEvent::StepStart { message_id } => {
                    // Message-id discipline: a new step means a new logical
                    // assistant message. The prior one was closed by its
                    // AssistantComplete.
                    open = Some(OpenMessage {
                        id: message_id,
                        node: node.as_str().to_string(),
                    });
                    Ok(())
                }
                LoopEvent::TextDelta { delta } => {
                    if let Some(open) = &open {
                        emitter
                            .emit(
                                Event::llm_stream(
                                    session_id,
                                    &open.id,
                                    LlmStreamData {
                                        delta,
                                        content_type: StreamContentType::Text,
                                        tool_call_index: None,
                                        tool_call_name: None,
                                        tool_call_id: None,
                                    },
                                )
                                .with_agent(open.node.clone()),
                            )
                            .await
                    } else {
                        Ok(())
                    }
                }
                LoopEvent::ToolCallStart { index, id, name } => {
                    if let Some(open) = &open {
                        emitter
                            .emit(
                                Event::llm_stream(
                                    session_id,
                                    &open.id,
                                    LlmStreamData {
                                        delta: name.clone(),
                                        content_type: StreamContentType::ToolCall,
                                        tool_call_index: Some(index),
                                        tool_call_name: Some(name),
                                        tool_call_id: Some(id),
                                    },
                                )
                                .with_agent(open.node.clone()),
                            )
                            .await
                    } else {
                        Ok(())
                    }
                }
                LoopEvent::ToolCallDelta {
                    index,
                    id,
                    args_delta,
                } => {
                    if let Some(open) = &open {
                        emitter
                            .emit(
                                Event::llm_stream(
                                    session_id,
                                    &open.id,
                                    LlmStreamData {
                                        delta: args_delta,
                                        content_type: StreamContentType::ToolCall,
                                        tool_call_index: Some(index),
                                        tool_call_name: None,
                                        tool_call_id: Some(id),
                                    },
                                )
                                .with_agent(open.node.clone()),
                            )
                            .await
                    } else {
                        Ok(())
                    }
                }
                LoopEvent::ToolCallReady { .. } => Ok(()),
                LoopEvent::AssistantComplete {
                    message_id,
                    text,
                    tool_calls,
                } => {
                    let node = open
                        .take()
                        .map(|o| o.node)
                        .unwrap_or_else(|| "team".to_string());
                    let message = Message::assistant(session_id, &text)
                        .with_id(message_id.clone())
                        .with_agent(node.clone())
                        .with_parent(parent_id.clone())
                        .with_tool_calls(tool_calls.clone());
                    parent_id = message_id.clone();
                    match emitter.persist(message).await {
                        Ok(()) => {
                            emitter
                                .emit(
                                    Event::message_complete(
                                        session_id,
                                        &message_id,
                                        MessageCompleteData {
                                            role: Role::Assistant,
                                            content: text,
                                            agent_name: Some(node.clone()),
                                            tool_calls,
                                            tool_call_id: None,
                                        },
                                    )
                                    .with_agent(node),
                                )
                                .await
                        }
                        Err(e) => Err(e),
                    }
                }
                LoopEvent::ToolStart { call } => {
                    emitter
                        .emit(
                            Event::tool_start(
                                session_id,
                                ToolStartData {
                                    tool_name: call.name.clone(),
                                    tool_call_id: call.id.clone(),
                                    args: call.args.clone(),
                                },
                            )
                            .with_agent(node.as_str()),
                        )
                        .await
                }
                LoopEvent::ToolDone {
                    call,
                    result,
                    message_id,
                } => {
                    let error = result.error_message().map(|s| s.to_string());
                    let emit_end = emitter
                        .emit(
                            Event::tool_end(
                                session_id,
                                ToolEndData {
                                    tool_name: call.name.clone(),
                                    tool_call_id: call.id.clone(),
                                    result: serde_json::json!(result.output.clone()),
                                    error,
                                },
                            )
                            .with_agent(node.as_str()),
                        )
                        .await;
                    if emit_end.is_err() {
                        emit_end
                    } else {
                        // The tool result is also a first-class message.
                        let message =
                            Message::tool_result(session_id, &call.id, &result.output)
                                .with_id(message_id.clone())
                                .with_agent(node.as_str())
                                .with_parent(parent_id.clone());
                        parent_id = message_id.clone();
                        match emitter.persist(message).await {
                            Ok(()) => {
                                emitter
                                    .emit(
                                        Event::message_complete(
                                            session_id,
                                            &message_id,
                                            MessageCompleteData {
                                                role: Role::Tool,
                                                content: result.output.clone(),
                                                agent_name: Some(node.as_str().to_string()),
                                                tool_calls: Vec::new(),
                                                tool_call_id: Some(call.id.clone()),
                                            },
                                        )
                                        .with_agent(node.as_str()),
                                    )
                                    .await
                            }
                            Err(e) => Err(e),
                        }
                    }
                }
                LoopEvent::StepEnd
                | LoopEvent::Finished { .. }
                | LoopEvent::Cancelled
                | LoopEvent::Error { .. } => Ok(()),
            },
            GraphItem::NodeEnd { node, decision } => {
                emitter
                    .emit(Event::node_end(
                        session_id,
                        NodeEndData {
                            node_name: node.as_str().to_string(),
                            decision: decision.next_action,
                        },
                    ))
                    .await
            }
            GraphItem::StageChange { from, to } => {
                emitter
                    .emit(Event::stage_change(
                        session_id,
                        StageChangeData {
                            from_stage: Some(from.as_str().to_string()),
                            to_stage: to.as_str().to_string(),
                        },
                    ))
                    .await
            }
            GraphItem::RoutingWarning { node, action } => {
                emitter
                    .emit(Event::custom(
                        session_id,
                        CustomData {
                            custom_type: "routing_warning".to_string(),
                            payload: serde_json::json!({
                                "node": node.as_str(),
                                "action": action,
                            }),
                        },
                    ))
                    .await
            }
            GraphItem::NodeError {
                node,
                message,
                error_type,
            } => {
                failed = true;
                emitter
                    .emit(
                        Event::agent_error(
                            session_id,
                            AgentErrorData {
                                error: message,
                                error_type,
                                namespace: Vec::new(),
                            },
                        )
                        .with_agent(node.as_str()),
                    )
                    .await
            }
            GraphItem::Cancelled => {
                stopped = true;
                Ok(())
            }
            GraphItem::Completed { state } => {
                emitter
                    .emit(Event::custom(
                        session_id,
                        CustomData {
                            custom_type: "agent_end".to_string(),
                            payload: serde_json::json!({
                                "status": if failed { "failed" } else { "success" },
                                "stage": state.stage.as_str(),
                            }),
                        },
                    ))
                    .await
            }
        };

        if let Err(e) = result {
            error!(error = %e, "persistence failed after retries");
            return FinishStatus::Failed;
        }
    }

    if stopped {
        FinishStatus::Stopped
    } else if failed {
        FinishStatus::Failed
    } else {
        FinishStatus::Success
    }
}
