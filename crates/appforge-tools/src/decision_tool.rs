//! Workflow-decision sentinel tool.
//!
//! Its only effect is recording the agent's next-action choice in the
//! assistant message's tool_calls; the graph orchestrator reads it from
//! there. The result text is a bare confirmation.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use appforge_contract::{ToolError, ToolInvocation, ToolResult, TypedTool};

pub const WORKFLOW_DECISION_TOOL: &str = "workflow_decision";

pub struct WorkflowDecisionTool;

#[derive(Deserialize, JsonSchema)]
pub struct WorkflowDecisionArgs {
    /// One of: continue, end, back_to_boss, back_to_pm, back_to_architect,
    /// back_to_engineer, continue_development.
    pub next_action: String,
    /// Why this decision was made.
    #[serde(default)]
    pub reason: Option<String>,
    /// Concrete task for the next node; required when backtracking or
    /// looping so the next agent knows what to fix.
    #[serde(default)]
    pub instruction_for_next: Option<String>,
}

#[async_trait]
impl TypedTool for WorkflowDecisionTool {
    type Args = WorkflowDecisionArgs;

    fn name(&self) -> &str {
        WORKFLOW_DECISION_TOOL
    }

    fn description(&self) -> &str {
        "Tell the workflow what to do next: continue to the next stage, loop, \
         back-track to an earlier role (with instruction_for_next describing what to fix), \
         or end the run"
    }

    async fn execute(
        &self,
        args: WorkflowDecisionArgs,
        _call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        let mut confirmation = format!("workflow decision recorded: {}", args.next_action);
        if let Some(reason) = args.reason.filter(|r| !r.is_empty()) {
            confirmation.push_str(&format!(" ({reason})"));
        }
        Ok(ToolResult::success(WORKFLOW_DECISION_TOOL, confirmation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appforge_contract::storage::{EventStore, MessageStore};
    use appforge_contract::{AgentContext, Tool};
    use appforge_store_adapters::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn records_and_confirms() {
        let store = Arc::new(MemoryStore::new());
        let ctx = AgentContext {
            session_id: "s".to_string(),
            workspace_id: "w".to_string(),
            workspace_path: "/tmp".into(),
            events: store.clone() as Arc<dyn EventStore>,
            messages: store as Arc<dyn MessageStore>,
            trace_id: None,
            api_base: None,
            api_key: None,
        };
        let invocation = ToolInvocation {
            ctx: &ctx,
            tool_call_id: "call_1",
        };
        let tool: &dyn Tool = &WorkflowDecisionTool;
        let result = tool
            .execute(
                json!({"next_action": "back_to_engineer", "reason": "tests fail"}),
                &invocation,
            )
            .await
            .unwrap();
        assert!(result.output.contains("back_to_engineer"));
        assert!(result.output.contains("tests fail"));
    }
}
