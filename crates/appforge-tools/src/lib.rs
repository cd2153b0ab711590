//! Tools visible to the agent team.
//!
//! Three groups: workspace file I/O (sandboxed under the workspace root),
//! container-exec and dev-server control (protocol-peer callbacks into the
//! gateway), and the workflow-decision sentinel consumed by the graph
//! orchestrator.

mod decision_tool;
mod dev_server;
mod exec;
mod paths;
mod workspace;

pub use decision_tool::{WorkflowDecisionTool, WORKFLOW_DECISION_TOOL};
pub use dev_server::{DevServerStartTool, DevServerStatusTool, DevServerStopTool};
pub use exec::{ExecCommandTool, DENIED_COMMAND_PATTERNS, MAX_OUTPUT_BYTES};
pub use paths::{secure_join, PathError};
pub use workspace::{
    DeleteFileTool, GrepFilesTool, ListFilesTool, MakeDirTool, ReadFileTool, WriteFileTool,
};

use appforge_contract::ToolRegistry;
use std::sync::Arc;

/// The full registry the team runs with.
pub fn team_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(ListFilesTool));
    registry.register(Arc::new(DeleteFileTool));
    registry.register(Arc::new(MakeDirTool));
    registry.register(Arc::new(GrepFilesTool));
    registry.register(Arc::new(ExecCommandTool::default()));
    registry.register(Arc::new(DevServerStartTool::default()));
    registry.register(Arc::new(DevServerStatusTool::default()));
    registry.register(Arc::new(DevServerStopTool::default()));
    registry.register(Arc::new(WorkflowDecisionTool));
    registry
}
