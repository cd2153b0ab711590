//! Container exec tool.
//!
//! Commands run inside the session's dev container, not in the agent
//! container: the tool calls back into the gateway's internal endpoint with
//! the protocol-peer key, and the gateway performs the exec. A deny-list
//! rejects destructive patterns before anything leaves the agent.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use appforge_contract::{ToolError, ToolInvocation, ToolResult, TypedTool};

/// Substring patterns rejected outright.
pub const DENIED_COMMAND_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "mkfs",
    "dd if=",
    ":(){",
    "shutdown",
    "reboot",
    "halt -f",
    "> /dev/sda",
];

/// Combined stdout+stderr cap returned to the model.
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub(crate) fn command_denied(command: &str) -> Option<&'static str> {
    DENIED_COMMAND_PATTERNS
        .iter()
        .find(|p| command.contains(*p))
        .copied()
}

pub(crate) fn truncate_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut end = limit;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n… output truncated ({} bytes total)", &output[..end], output.len())
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i64,
}

pub struct ExecCommandTool {
    client: reqwest::Client,
}

impl Default for ExecCommandTool {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct ExecCommandArgs {
    /// Shell command to run inside the dev container, with the workspace
    /// root as working directory.
    pub command: String,
    /// Wall-clock limit in seconds (default 120).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[async_trait]
impl TypedTool for ExecCommandTool {
    type Args = ExecCommandArgs;

    fn name(&self) -> &str {
        "exec_command"
    }

    fn description(&self) -> &str {
        "Run a shell command inside the app's dev container (working directory = workspace root)"
    }

    async fn execute(
        &self,
        args: ExecCommandArgs,
        call: &ToolInvocation<'_>,
    ) -> Result<ToolResult, ToolError> {
        if let Some(pattern) = command_denied(&args.command) {
            return Ok(ToolResult::error(
                "exec_command",
                format!("command rejected by policy (matched {pattern:?})"),
            ));
        }
        let (Some(api_base), Some(api_key)) = (&call.ctx.api_base, &call.ctx.api_key) else {
            return Ok(ToolResult::error(
                "exec_command",
                "no gateway configured for container exec in this run mode",
            ));
        };
        let timeout = args.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let url = format!(
            "{}/internal/apps/{}/exec",
            api_base.trim_end_matches('/'),
            call.ctx.session_id
        );
        let response = self
            .client
            .post(&url)
            .header("X-API-Key", api_key)
            .json(&serde_json::json!({
                "command": args.command,
                "timeout_secs": timeout,
            }))
            .timeout(std::time::Duration::from_secs(timeout + 10))
            .send()
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::error("exec_command", format!("exec request failed: {e}"))),
        };
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Ok(ToolResult::error(
                "exec_command",
                format!("exec returned {status}: {body}"),
            ));
        }
        let parsed: ExecResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error("exec_command", format!("bad exec response: {e}"))),
        };
        let mut output = parsed.stdout;
        if !parsed.stderr.is_empty() {
            output.push_str("\n--- stderr ---\n");
            output.push_str(&parsed.stderr);
        }
        let output = truncate_output(&output, MAX_OUTPUT_BYTES);
        if parsed.exit_code == 0 {
            Ok(ToolResult::success("exec_command", output))
        } else {
            Ok(ToolResult::error(
                "exec_command",
                format!("exit code {}\n{output}", parsed.exit_code),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_list_catches_destructive_commands() {
        assert!(command_denied("rm -rf / --no-preserve-root").is_some());
        assert!(command_denied(":(){ :|:& };:").is_some());
        assert!(command_denied("dd if=/dev/zero of=/dev/sda").is_some());
        assert!(command_denied("npm run build").is_none());
        assert!(command_denied("rm -rf node_modules").is_none());
    }

    #[test]
    fn truncation_keeps_prefix_and_notes_total() {
        let long = "a".repeat(100);
        let truncated = truncate_output(&long, 10);
        assert!(truncated.starts_with("aaaaaaaaaa"));
        assert!(truncated.contains("100 bytes total"));
        assert_eq!(truncate_output("short", 10), "short");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld".repeat(10);
        let truncated = truncate_output(&s, 7);
        assert!(truncated.contains("truncated"));
    }
}
