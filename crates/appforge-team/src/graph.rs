//! Streaming graph orchestration.
//!
//! The graph owns no node state beyond the Team State blackboard. Each step
//! runs one node's agent loop to completion, parses the node's decision,
//! and routes. The produced stream interleaves per-node state updates with
//! the raw loop events so the runtime can translate everything into
//! persisted events.

use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tracing::{info, warn};

use appforge_agent_loop::{run_agent_loop, ChatStreamProvider, LoopConfig, LoopEvent};
use appforge_contract::{
    AgentContext, Decision, Message, Stage, TeamState, ToolRegistry,
};

use crate::decision_parse::parse_decision;
use crate::roles::{agent_for, default_task_prompt, node_stage, NodeName};
use crate::routing::{resolve_route, Route};

#[derive(Clone)]
pub struct GraphConfig {
    /// Model used by every role.
    pub model: String,
    /// Hard cap on node transitions; prevents runaway loops.
    pub max_transitions: u32,
    pub loop_config: LoopConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_transitions: 24,
            loop_config: LoopConfig::default(),
        }
    }
}

/// One item of the orchestrator's stream.
#[derive(Debug, Clone)]
pub enum GraphItem {
    NodeStart {
        node: NodeName,
    },
    /// A raw agent-loop event attributed to its node.
    Loop {
        node: NodeName,
        event: LoopEvent,
    },
    NodeEnd {
        node: NodeName,
        decision: Decision,
    },
    StageChange {
        from: Stage,
        to: Stage,
    },
    /// The decision named an action this node cannot take; the linear
    /// successor was used.
    RoutingWarning {
        node: NodeName,
        action: String,
    },
    /// Unrecoverable node failure; the run routes to the terminal.
    NodeError {
        node: NodeName,
        message: String,
        error_type: String,
    },
    Cancelled,
    /// Terminal: the final Team State.
    Completed {
        state: Box<TeamState>,
    },
}

pub struct TeamGraph {
    provider: Arc<dyn ChatStreamProvider>,
    registry: ToolRegistry,
    config: GraphConfig,
}

impl TeamGraph {
    pub fn new(
        provider: Arc<dyn ChatStreamProvider>,
        registry: ToolRegistry,
        config: GraphConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            config,
        }
    }

    /// Drive the graph from the entry node until a terminal route.
    pub fn run(
        self,
        ctx: Arc<AgentContext>,
        mut state: TeamState,
    ) -> impl Stream<Item = GraphItem> + Send {
        stream! {
            let mut current = NodeName::Boss;

            loop {
                state.iterations += 1;
                if state.iterations > self.config.max_transitions {
                    warn!(
                        transitions = state.iterations,
                        "transition cap reached, terminating graph"
                    );
                    yield GraphItem::RoutingWarning {
                        node: current,
                        action: "max_transitions".to_string(),
                    };
                    break;
                }

                yield GraphItem::NodeStart { node: current };

                // The node's task: the hand-off instruction when one was
                // left, otherwise its default prompt.
                let instruction = state
                    .take_instruction()
                    .unwrap_or_else(|| default_task_prompt(current, state.framework));
                state.messages.push(
                    Message::user(&ctx.session_id, instruction).with_agent(current.as_str()),
                );

                let agent = agent_for(current, &self.config.model);
                let node_start_index = state.messages.len();
                let mut node_failed: Option<(String, String)> = None;
                let mut cancelled = false;

                {
                    let mut loop_stream = Box::pin(run_agent_loop(
                        self.provider.clone(),
                        agent,
                        self.registry.clone(),
                        ctx.clone(),
                        state.messages.clone(),
                        self.config.loop_config.clone(),
                    ));

                    while let Some(event) = loop_stream.next().await {
                        match &event {
                            LoopEvent::AssistantComplete {
                                message_id,
                                text,
                                tool_calls,
                            } => {
                                state.messages.push(
                                    Message::assistant(&ctx.session_id, text)
                                        .with_id(message_id.clone())
                                        .with_agent(current.as_str())
                                        .with_tool_calls(tool_calls.clone()),
                                );
                            }
                            LoopEvent::ToolDone {
                                call,
                                result,
                                message_id,
                            } => {
                                state.messages.push(
                                    Message::tool_result(&ctx.session_id, &call.id, &result.output)
                                        .with_id(message_id.clone())
                                        .with_agent(current.as_str()),
                                );
                            }
                            LoopEvent::Error { message, error_type } => {
                                node_failed = Some((message.clone(), error_type.clone()));
                            }
                            LoopEvent::Cancelled => {
                                cancelled = true;
                            }
                            _ => {}
                        }
                        yield GraphItem::Loop {
                            node: current,
                            event,
                        };
                    }
                }

                if cancelled {
                    yield GraphItem::Cancelled;
                    return;
                }
                if let Some((message, error_type)) = node_failed {
                    yield GraphItem::NodeError {
                        node: current,
                        message,
                        error_type,
                    };
                    break;
                }

                let node_messages = &state.messages[node_start_index..];
                let decision = parse_decision(node_messages)
                    .unwrap_or_else(|| Decision::new("continue"));
                info!(node = %current, action = %decision.next_action, "node finished");

                if let Some(stage) = node_stage(current) {
                    if stage != state.stage {
                        let from = state.stage;
                        state.stage = stage;
                        yield GraphItem::StageChange { from, to: stage };
                    }
                }

                state.next_instruction = decision.instruction_for_next.clone();
                state.last_decision = Some(decision.clone());

                let (route, known) = resolve_route(current, &decision.next_action);
                if !known {
                    yield GraphItem::RoutingWarning {
                        node: current,
                        action: decision.next_action.clone(),
                    };
                }

                yield GraphItem::NodeEnd {
                    node: current,
                    decision,
                };

                match route {
                    Route::Node(next) => current = next,
                    Route::Terminal => break,
                }
            }

            if state.stage != Stage::Completed {
                let from = state.stage;
                state.stage = Stage::Completed;
                yield GraphItem::StageChange {
                    from,
                    to: Stage::Completed,
                };
            }
            yield GraphItem::Completed {
                state: Box::new(state),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appforge_agent_loop::{ChatStreamProvider, ProviderError};
    use appforge_contract::storage::{EventStore, MessageStore};
    use appforge_contract::Framework;
    use appforge_store_adapters::MemoryStore;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use genai::chat::{ChatOptions, ChatRequest, ChatStreamEvent, StreamChunk, ToolChunk};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct ScriptedProvider {
        turns: Mutex<Vec<Vec<ChatStreamEvent>>>,
    }

    impl ScriptedProvider {
        fn new(turns: Vec<Vec<ChatStreamEvent>>) -> Self {
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
        ) -> Result<BoxStream<'static, Result<ChatStreamEvent, genai::Error>>, ProviderError>
        {
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

    fn text(words: &str) -> ChatStreamEvent {
        ChatStreamEvent::Chunk(StreamChunk {
            content: words.to_string(),
        })
    }

    fn decision_call(call_id: &str, action: &str) -> ChatStreamEvent {
        ChatStreamEvent::ToolCallChunk(ToolChunk {
            tool_call: genai::chat::ToolCall {
                call_id: call_id.to_string(),
                fn_name: "workflow_decision".to_string(),
                fn_arguments: Value::String(json!({"next_action": action}).to_string()),
                thought_signatures: None,
            },
        })
    }

    /// One node turn: text + decision tool call, then a closing text turn
    /// (the loop calls the model again after the tool result).
    fn node_turns(call_id: &str, output: &str, action: &str) -> Vec<Vec<ChatStreamEvent>> {
        vec![
            vec![text(output), decision_call(call_id, action)],
            vec![text("handing off")],
        ]
    }

    fn test_ctx() -> Arc<AgentContext> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(AgentContext {
            session_id: "sess_graph".to_string(),
            workspace_id: "ws".to_string(),
            workspace_path: PathBuf::from("/tmp"),
            events: store.clone() as Arc<dyn EventStore>,
            messages: store as Arc<dyn MessageStore>,
            trace_id: None,
            api_base: None,
            api_key: None,
        })
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new().with_tool(Arc::new(appforge_tools_stub::DecisionStub))
    }

    // Local stand-in so this crate's tests need no tool implementations.
    mod appforge_tools_stub {
        use appforge_contract::{
            Tool, ToolDescriptor, ToolError, ToolInvocation, ToolResult,
        };
        use async_trait::async_trait;
        use serde_json::Value;

        pub struct DecisionStub;

        #[async_trait]
        impl Tool for DecisionStub {
            fn descriptor(&self) -> ToolDescriptor {
                ToolDescriptor::new("workflow_decision", "Record the next workflow action")
            }

            async fn execute(
                &self,
                args: Value,
                _call: &ToolInvocation<'_>,
            ) -> Result<ToolResult, ToolError> {
                let action = args
                    .get("next_action")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?");
                Ok(ToolResult::success(
                    "workflow_decision",
                    format!("workflow decision recorded: {action}"),
                ))
            }
        }
    }

    async fn run_graph(turns: Vec<Vec<ChatStreamEvent>>) -> Vec<GraphItem> {
        let provider = Arc::new(ScriptedProvider::new(turns));
        let graph = TeamGraph::new(
            provider,
            registry(),
            GraphConfig {
                model: "test-model".to_string(),
                max_transitions: 8,
                loop_config: LoopConfig {
                    llm_attempts: 1,
                    ..Default::default()
                },
            },
        );
        let state = TeamState::new("ws", Framework::Nextjs)
            .with_history(vec![Message::user("sess_graph", "build a todo app")]);
        graph.run(test_ctx(), state).collect().await
    }

    fn node_sequence(items: &[GraphItem]) -> Vec<(NodeName, String)> {
        items
            .iter()
            .filter_map(|item| match item {
                GraphItem::NodeEnd { node, decision } => {
                    Some((*node, decision.next_action.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn boss_end_short_circuits() {
        let items = run_graph(node_turns("c1", "needs clarification", "end")).await;
        let sequence = node_sequence(&items);
        assert_eq!(sequence, vec![(NodeName::Boss, "end".to_string())]);
        assert!(matches!(items.last(), Some(GraphItem::Completed { .. })));
    }

    #[tokio::test]
    async fn full_pipeline_runs_all_six_roles() {
        let mut turns = Vec::new();
        turns.extend(node_turns("c1", "requirements done", "continue"));
        turns.extend(node_turns("c2", "prd done", "continue"));
        turns.extend(node_turns("c3", "design done", "continue"));
        turns.extend(node_turns("c4", "tasks done", "continue"));
        turns.extend(node_turns("c5", "code done", "continue"));
        turns.extend(node_turns("c6", "tests pass", "continue"));
        let items = run_graph(turns).await;

        let sequence: Vec<NodeName> = node_sequence(&items).iter().map(|(n, _)| *n).collect();
        assert_eq!(
            sequence,
            vec![
                NodeName::Boss,
                NodeName::ProductManager,
                NodeName::Architect,
                NodeName::ProjectManager,
                NodeName::Engineer,
                NodeName::Qa,
            ]
        );

        let stages: Vec<(Stage, Stage)> = items
            .iter()
            .filter_map(|i| match i {
                GraphItem::StageChange { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                (Stage::Requirement, Stage::Design),
                (Stage::Design, Stage::Development),
                (Stage::Development, Stage::Testing),
                (Stage::Testing, Stage::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn qa_backtracks_to_engineer() {
        let mut turns = Vec::new();
        turns.extend(node_turns("c1", "reqs", "continue"));
        turns.extend(node_turns("c2", "prd", "continue"));
        turns.extend(node_turns("c3", "design", "continue"));
        turns.extend(node_turns("c4", "tasks", "continue"));
        turns.extend(node_turns("c5", "code", "continue"));
        turns.extend(node_turns("c6", "tests FAILED", "back_to_engineer"));
        turns.extend(node_turns("c7", "fixed", "continue"));
        turns.extend(node_turns("c8", "tests pass", "continue"));
        let items = run_graph(turns).await;

        let sequence: Vec<NodeName> = node_sequence(&items).iter().map(|(n, _)| *n).collect();
        assert_eq!(
            &sequence[4..],
            &[
                NodeName::Engineer,
                NodeName::Qa,
                NodeName::Engineer,
                NodeName::Qa
            ]
        );
    }

    #[tokio::test]
    async fn unknown_action_warns_and_continues() {
        let mut turns = Vec::new();
        turns.extend(node_turns("c1", "reqs", "back_to_qa"));
        turns.extend(node_turns("c2", "prd", "end"));
        let items = run_graph(turns).await;

        assert!(items.iter().any(|i| matches!(
            i,
            GraphItem::RoutingWarning { node: NodeName::Boss, action } if action == "back_to_qa"
        )));
        let sequence: Vec<NodeName> = node_sequence(&items).iter().map(|(n, _)| *n).collect();
        assert_eq!(sequence, vec![NodeName::Boss, NodeName::ProductManager]);
    }

    #[tokio::test]
    async fn missing_decision_defaults_to_continue() {
        let mut turns = vec![vec![text("no decision here")]];
        turns.extend(node_turns("c2", "prd", "end"));
        let items = run_graph(turns).await;
        let sequence = node_sequence(&items);
        assert_eq!(sequence[0], (NodeName::Boss, "continue".to_string()));
    }

    #[tokio::test]
    async fn transition_cap_stops_infinite_loop() {
        // Engineer loops on itself forever via continue_development.
        let mut turns = Vec::new();
        turns.extend(node_turns("c1", "reqs", "continue"));
        turns.extend(node_turns("c2", "prd", "continue"));
        turns.extend(node_turns("c3", "design", "continue"));
        turns.extend(node_turns("c4", "tasks", "continue"));
        for i in 0..20 {
            turns.extend(node_turns(
                &format!("e{i}"),
                "more work",
                "continue_development",
            ));
        }
        let items = run_graph(turns).await;
        assert!(items.iter().any(|i| matches!(
            i,
            GraphItem::RoutingWarning { action, .. } if action == "max_transitions"
        )));
        assert!(matches!(items.last(), Some(GraphItem::Completed { .. })));
        assert!(node_sequence(&items).len() <= 8);
    }

    #[tokio::test]
    async fn model_failure_surfaces_node_error() {
        let items = run_graph(vec![]).await;
        assert!(items.iter().any(|i| matches!(
            i,
            GraphItem::NodeError { node: NodeName::Boss, error_type, .. }
                if error_type == "model_error"
        )));
        // Run still terminates with a Completed item for state handoff.
        assert!(matches!(items.last(), Some(GraphItem::Completed { .. })));
    }

    #[tokio::test]
    async fn instruction_hand_off_reaches_next_node() {
        let mut turns = Vec::new();
        // Boss leaves an instruction for PM via the decision.
        turns.push(vec![
            text("reqs"),
            ChatStreamEvent::ToolCallChunk(ToolChunk {
                tool_call: genai::chat::ToolCall {
                    call_id: "c1".to_string(),
                    fn_name: "workflow_decision".to_string(),
                    fn_arguments: Value::String(
                        json!({
                            "next_action": "continue",
                            "instruction_for_next": "focus the PRD on the checkout flow"
                        })
                        .to_string(),
                    ),
                    thought_signatures: None,
                },
            }),
        ]);
        turns.push(vec![text("ok")]);
        turns.extend(node_turns("c2", "prd", "end"));
        let items = run_graph(turns).await;

        let state = items
            .iter()
            .find_map(|i| match i {
                GraphItem::Completed { state } => Some(state.clone()),
                _ => None,
            })
            .unwrap();
        // PM's task message is the Boss's instruction, not the default.
        let pm_task = state
            .messages
            .iter()
            .find(|m| {
                m.agent_name.as_deref() == Some("product_manager")
                    && m.role == appforge_contract::Role::User
            })
            .unwrap();
        assert!(pm_task.content.contains("checkout flow"));
    }
}
