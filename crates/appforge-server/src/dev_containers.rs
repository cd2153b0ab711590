//! Protocol-peer endpoints for the agent container.
//!
//! The agent container cannot reach the Docker socket; it calls back here
//! with `X-API-Key == session_id` and this module performs the exec against
//! the session's dev container. Dev-server lifecycle follows the detach
//! contract: `.dev-server.{pid,log,cmd}` under the workspace root.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::auth::require_peer_key;
use crate::error::ApiError;
use crate::state::AppState;

const WORKSPACE_ROOT: &str = "/workspace";
const PID_FILE: &str = "/workspace/.dev-server.pid";
const LOG_FILE: &str = "/workspace/.dev-server.log";
const CMD_FILE: &str = "/workspace/.dev-server.cmd";
const STOP_GRACE_SECS: u32 = 5;
const MAX_EXEC_OUTPUT: usize = 64 * 1024;

pub struct DevContainers {
    docker: Docker,
}

pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

fn dev_container_name(session_id: &str) -> String {
    format!("appforge-dev-{session_id}")
}

impl DevContainers {
    pub fn connect() -> Result<Self, String> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| e.to_string())?;
        Ok(Self { docker })
    }

    /// Run a shell command in the session's dev container, confined to the
    /// workspace root.
    pub async fn exec_in_dev(
        &self,
        session_id: &str,
        command: &str,
        timeout_secs: u64,
    ) -> Result<ExecOutcome, ApiError> {
        let container = dev_container_name(session_id);
        let exec = self
            .docker
            .create_exec(
                &container,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", command]),
                    working_dir: Some(WORKSPACE_ROOT),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ApiError::DevContainer(e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ApiError::DevContainer(e.to_string()))?;

        if let StartExecResults::Attached { mut output, .. } = started {
            let drain = async {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            if stdout.len() < MAX_EXEC_OUTPUT {
                                stdout.push_str(&String::from_utf8_lossy(&message));
                            }
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            if stderr.len() < MAX_EXEC_OUTPUT {
                                stderr.push_str(&String::from_utf8_lossy(&message));
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            stderr.push_str(&format!("\n[exec stream error: {e}]"));
                            break;
                        }
                    }
                }
            };
            if tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), drain)
                .await
                .is_err()
            {
                return Ok(ExecOutcome {
                    stdout,
                    stderr: format!("{stderr}\n[command timed out after {timeout_secs}s]"),
                    exit_code: 124,
                });
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ApiError::DevContainer(e.to_string()))?;
        Ok(ExecOutcome {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }
}

fn dev(state: &AppState) -> Result<Arc<DevContainers>, ApiError> {
    state
        .dev
        .clone()
        .ok_or_else(|| ApiError::DevContainer("no container engine configured".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub async fn exec(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExecRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_peer_key(&headers, &sid)?;
    let dev = dev(&state)?;
    let timeout = body.timeout_secs.unwrap_or(120).min(600);
    let outcome = dev.exec_in_dev(&sid, &body.command, timeout).await?;
    Ok(Json(json!({
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "exit_code": outcome.exit_code,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DevServerStartRequest {
    pub command: String,
}

pub async fn dev_server_start(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<DevServerStartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_peer_key(&headers, &sid)?;
    let dev = dev(&state)?;
    // Detach pattern: background the server, record PID, redirect logs.
    let script = format!(
        "if [ -f {PID_FILE} ] && kill -0 \"$(cat {PID_FILE})\" 2>/dev/null; then \
           echo 'dev server already running (pid '\"$(cat {PID_FILE})\"')'; exit 0; fi; \
         printf '%s' {cmd_quoted} > {CMD_FILE}; \
         nohup sh -c {cmd_quoted} > {LOG_FILE} 2>&1 & \
         echo $! > {PID_FILE}; \
         echo 'started (pid '\"$(cat {PID_FILE})\"')'",
        cmd_quoted = shell_quote(&body.command),
    );
    let outcome = dev.exec_in_dev(&sid, &script, 30).await?;
    Ok(Json(json!({
        "output": outcome.stdout.trim(),
        "exit_code": outcome.exit_code,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DevServerStatusRequest {
    #[serde(default)]
    pub log_lines: Option<usize>,
}

pub async fn dev_server_status(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<DevServerStatusRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_peer_key(&headers, &sid)?;
    let dev = dev(&state)?;
    let lines = body.log_lines.unwrap_or(50).min(500);
    let script = format!(
        "if [ -f {PID_FILE} ] && kill -0 \"$(cat {PID_FILE})\" 2>/dev/null; then \
           echo 'running (pid '\"$(cat {PID_FILE})\"', cmd '\"$(cat {CMD_FILE} 2>/dev/null)\"')'; \
         else echo 'not running'; fi; \
         echo '--- log tail ---'; tail -n {lines} {LOG_FILE} 2>/dev/null || echo '(no log)'"
    );
    let outcome = dev.exec_in_dev(&sid, &script, 30).await?;
    Ok(Json(json!({ "output": outcome.stdout })))
}

pub async fn dev_server_stop(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_peer_key(&headers, &sid)?;
    let dev = dev(&state)?;
    // TERM first; KILL whatever survives the grace window.
    let script = format!(
        "if [ ! -f {PID_FILE} ]; then echo 'not running'; exit 0; fi; \
         pid=$(cat {PID_FILE}); \
         kill \"$pid\" 2>/dev/null; \
         for _ in $(seq {STOP_GRACE_SECS}); do \
           kill -0 \"$pid\" 2>/dev/null || break; sleep 1; done; \
         kill -9 \"$pid\" 2>/dev/null; \
         rm -f {PID_FILE}; echo 'stopped'"
    );
    let outcome = dev.exec_in_dev(&sid, &script, 30).await?;
    Ok(Json(json!({ "output": outcome.stdout.trim() })))
}

/// Single-quote a string for `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
