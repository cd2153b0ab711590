//! Shared contract for the agent execution core.
//!
//! This crate holds everything the other crates agree on: the session /
//! message / event data model, the closed event taxonomy, the storage
//! traits the gateway and the runtime both talk to, the tool contract, and
//! the propagating [`AgentContext`].

pub mod clock;
pub mod context;
pub mod decision;
pub mod event;
pub mod message;
pub mod session;
pub mod storage;
pub mod team;
pub mod tool;

pub use context::{current_context, with_context, AgentContext, ContextError};
pub use decision::Decision;
pub use event::{Event, EventType, FinishStatus};
pub use message::{gen_id, ContentPart, Message, Role, ToolCall};
pub use session::{Framework, Session};
pub use storage::{EventStore, MessageStore, SessionStore, SortOrder, StopSignals, StoreError};
pub use team::{Stage, TeamState};
pub use tool::{
    Tool, ToolDescriptor, ToolError, ToolInvocation, ToolRegistry, ToolResult, ToolStatus,
    TypedTool,
};
