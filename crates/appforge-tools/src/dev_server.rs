//! Dev-server lifecycle tools.
//!
//! The long-running dev server lives in the dev container; these tools call
//! the gateway's internal endpoints, which implement the detach contract:
//! start writes `.dev-server.{pid,log,cmd}` under the workspace, status
//! checks PID liveness and tails the log, stop sends TERM then KILL after a
//! grace window.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use appforge_contract::{ToolError, ToolInvocation, ToolResult, TypedTool};

use crate::exec::command_denied;

async fn call_gateway(
    client: &reqwest::Client,
    call: &ToolInvocation<'_>,
    tool_name: &str,
    action: &str,
    body: serde_json::Value,
) -> Result<ToolResult, ToolError> {
    let (Some(api_base), Some(api_key)) = (&call.ctx.api_base, &call.ctx.api_key) else {
        return Ok(ToolResult::error(
            tool_name,
            "no gateway configured for dev-server control in this run mode",
        ));
    };
    let url = format!(
        "{}/internal/apps/{}/dev-server/{action}",
        api_base.trim_end_matches('/'),
        call.ctx.session_id
    );
    let response = client
        .post(&url)
        .header("X-API-Key", api_key)
        .json(&body)
        .send()
        .await;
    let response = match response {
        Ok(r) => r,
        Err(e) => return Ok(ToolResult::error(tool_name, format!("request failed: {e}"))),
    };
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(ToolResult::success(tool_name, text))
    } else {
        Ok(ToolResult::error(tool_name, format!("{status}: {text}")))
    }
}

pub struct DevServerStartTool {
    client: reqwest::Client,
}

impl Default for DevServerStartTool {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct DevServerStartArgs {
    /// Command that starts the dev server, e.g. "npm run dev".
    pub command: String,
}

#[async_trait]
impl TypedTool for DevServerStartTool {
    type Args = DevServerStartArgs;

    fn name(&self) -> &str {
        "dev_server_start"
    }

    fn description(&self) -> &str {
        "Start a long-running dev server inside the dev container (detached, logs captured)"
    }

    async fn execute(
        &self,
        args: DevServerStartArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        if let Some(pattern) = command_denied(&args.command) {
            return Ok(ToolResult::error(
                "dev_server_start",
                format!("command rejected by policy (matched {pattern:?})"),
            ));
        }
        call_gateway(
            &self.client,
            call,
            "dev_server_start",
            "start",
            serde_json::json!({"command": args.command}),
        )
        .await
    }
}

pub struct DevServerStatusTool {
    client: reqwest::Client,
}

impl Default for DevServerStatusTool {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct DevServerStatusArgs {
    /// Number of log lines to tail (default 50).
    #[serde(default)]
    pub log_lines: Option<usize>,
}

#[async_trait]
impl TypedTool for DevServerStatusTool {
    type Args = DevServerStatusArgs;

    fn name(&self) -> &str {
        "dev_server_status"
    }

    fn description(&self) -> &str {
        "Check whether the dev server is running and tail its log"
    }

    async fn execute(
        &self,
        args: DevServerStatusArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        call_gateway(
            &self.client,
            call,
            "dev_server_status",
            "status",
            serde_json::json!({"log_lines": args.log_lines.unwrap_or(50)}),
        )
        .await
    }
}

pub struct DevServerStopTool {
    client: reqwest::Client,
}

impl Default for DevServerStopTool {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct DevServerStopArgs {}

#[async_trait]
impl TypedTool for DevServerStopTool {
    type Args = DevServerStopArgs;

    fn name(&self) -> &str {
        "dev_server_stop"
    }

    fn description(&self) -> &str {
        "Stop the running dev server (TERM, then KILL after a grace window)"
    }

    async fn execute(
        &self,
        _args: DevServerStopArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        call_gateway(
            &self.client,
            call,
            "dev_server_stop",
            "stop",
            serde_json::json!({}),
        )
        .await
    }
}
