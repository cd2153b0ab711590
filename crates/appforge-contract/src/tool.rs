//! Tool contract for agent actions.
//!
//! Tools are named functions with a JSON-schema argument shape. Execution
//! failures are returned as error-marked results so the model observes them;
//! [`ToolError`] is reserved for argument and wiring problems.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::context::AgentContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Error,
}

/// Result of one tool execution, rendered to the model as a string.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_name: String,
    pub status: ToolStatus,
    pub output: String,
}

impl ToolResult {
    pub fn success(tool_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Success,
            output: output.into(),
        }
    }

    /// Error surfaced to the LLM rather than thrown.
    pub fn error(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Error,
            output: format!("error: {}", message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    /// The error text without the marker, if this is an error result.
    pub fn error_message(&self) -> Option<&str> {
        self.is_error()
            .then(|| self.output.strip_prefix("error: ").unwrap_or(&self.output))
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Tool metadata presented to the model.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema for the argument object.
    pub parameters: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }
}

/// Per-call execution context handed to tools.
pub struct ToolInvocation<'a> {
    pub ctx: &'a AgentContext,
    /// The originating tool_call id; usable as an idempotency key.
    pub tool_call_id: &'a str,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Validate arguments against the descriptor schema before execution.
    fn validate_args(&self, args: &Value) -> Result<(), ToolError> {
        validate_against_schema(&self.descriptor().parameters, args)
    }

    async fn execute(
        &self,
        args: Value,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError>;
}

/// Validate a JSON value against a JSON Schema, collecting all violations.
pub fn validate_against_schema(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| ToolError::Internal(format!("invalid tool schema: {e}")))?;
    if validator.is_valid(args) {
        return Ok(());
    }
    let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    Err(ToolError::InvalidArguments(errors.join("; ")))
}

// ---------------------------------------------------------------------------
// TypedTool – strongly-typed tool with automatic schema generation
// ---------------------------------------------------------------------------

/// Variant of [`Tool`] with a fixed argument shape. A blanket impl provides
/// [`Tool`]; deserialisation replaces schema validation.
#[async_trait]
pub trait TypedTool: Send + Sync {
    type Args: for<'de> Deserialize<'de> + JsonSchema + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(
        &self,
        args: Self::Args,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError>;
}

fn typed_tool_schema<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

#[async_trait]
impl<T: TypedTool> Tool for T {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(self.name(), self.description())
            .with_parameters(typed_tool_schema::<T::Args>())
    }

    fn validate_args(&self, _args: &Value) -> Result<(), ToolError> {
        Ok(())
    }

    async fn execute(
        &self,
        args: Value,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        let typed: T::Args = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        TypedTool::execute(self, typed, call).await
    }
}

/// Named tool set visible to agents. Roles select subsets by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.descriptor().name, tool);
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors for a named subset, in the order requested. Unknown names
    /// are skipped.
    pub fn descriptors(&self, subset: &[String]) -> Vec<ToolDescriptor> {
        subset
            .iter()
            .filter_map(|name| self.tools.get(name).map(|t| t.descriptor()))
            .collect()
    }
}
