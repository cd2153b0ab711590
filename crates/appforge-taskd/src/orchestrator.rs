//! Per-task container orchestration.
//!
//! The orchestrator never interprets agent output; it observes container
//! liveness and store state. Terminal rules: a real `finish` event wins;
//! container exit without one synthesises `finish{failed}`; wall-clock
//! overrun synthesises `finish{timeout}`; an explicit stop synthesises
//! `finish{stopped}` after the grace window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use appforge_contract::storage::{EventStore, SessionStore, StopSignals};
use appforge_contract::{Event, FinishStatus};

use crate::broker::GenerateTask;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("container error: {0}")]
    Container(String),

    #[error("store error: {0}")]
    Store(#[from] appforge_contract::StoreError),
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// Host path of the workspace directory (not a path inside this
    /// process's own container).
    pub host_workspace_path: String,
    pub container_workspace_root: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited(i64),
    /// Not found (auto-removed or never created).
    Gone,
}

/// Seam over the container engine; the production impl is bollard-backed.
#[async_trait]
pub trait ContainerControl: Send + Sync {
    /// Force-remove a container by name if it exists. Idempotent.
    async fn remove_existing(&self, name: &str) -> Result<(), TaskError>;

    /// Create and start, returning the container id.
    async fn start(&self, spec: &ContainerSpec) -> Result<String, TaskError>;

    async fn state(&self, id: &str) -> Result<ContainerState, TaskError>;

    /// TERM, then KILL after `grace`. Idempotent on missing containers.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), TaskError>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub image: String,
    /// Host directory containing one subdirectory per workspace id.
    pub host_workspaces_root: String,
    pub container_workspace_root: String,
    pub network: Option<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub task_timeout: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    /// Store connection handed to the container.
    pub database_url: String,
    /// Gateway base URL for the container's tool callbacks.
    pub api_url: String,
    /// Extra environment passed through (LLM and tracing credentials).
    pub passthrough_env: HashMap<String, String>,
}

impl OrchestratorConfig {
    pub fn new(database_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            image: "appforge-agent:latest".to_string(),
            host_workspaces_root: "/var/lib/appforge/workspaces".to_string(),
            container_workspace_root: "/workspace".to_string(),
            network: None,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
            task_timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_secs(2),
            stop_grace: Duration::from_secs(90),
            database_url: database_url.into(),
            api_url: api_url.into(),
            passthrough_env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub session_id: String,
    pub status: FinishStatus,
    pub reason: Option<String>,
    pub container_exit_code: Option<i64>,
}

pub struct TaskOrchestrator<C: ContainerControl> {
    control: C,
    events: Arc<dyn EventStore>,
    sessions: Arc<dyn SessionStore>,
    stop: Arc<dyn StopSignals>,
    config: OrchestratorConfig,
}

pub fn container_name(session_id: &str) -> String {
    format!("appforge-agent-{session_id}")
}

impl<C: ContainerControl> TaskOrchestrator<C> {
    pub fn new(
        control: C,
        events: Arc<dyn EventStore>,
        sessions: Arc<dyn SessionStore>,
        stop: Arc<dyn StopSignals>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            control,
            events,
            sessions,
            stop,
            config,
        }
    }

    fn build_spec(&self, task: &GenerateTask) -> ContainerSpec {
        let mut env = vec![
            ("SESSION_ID".to_string(), task.session_id.clone()),
            ("WORKSPACE_ID".to_string(), task.workspace_id.clone()),
            (
                "FRAMEWORK".to_string(),
                task.framework.as_str().to_string(),
            ),
            ("RUN_MODE".to_string(), "database".to_string()),
            ("DATABASE_URL".to_string(), self.config.database_url.clone()),
            ("APPFORGE_API_URL".to_string(), self.config.api_url.clone()),
            // Protocol-peer key: the session id authorises callbacks.
            ("MGX_AGENT_API_KEY".to_string(), task.session_id.clone()),
        ];
        for (key, value) in &self.config.passthrough_env {
            env.push((key.clone(), value.clone()));
        }
        ContainerSpec {
            name: container_name(&task.session_id),
            image: self.config.image.clone(),
            env,
            host_workspace_path: format!(
                "{}/{}",
                self.config.host_workspaces_root.trim_end_matches('/'),
                task.workspace_id
            ),
            container_workspace_root: self.config.container_workspace_root.clone(),
            memory_bytes: self.config.memory_bytes,
            nano_cpus: self.config.nano_cpus,
            network: self.config.network.clone(),
        }
    }

    /// Append a synthetic finish unless a real one already exists.
    async fn synthesize_finish(
        &self,
        session_id: &str,
        status: FinishStatus,
        reason: String,
    ) -> Result<(FinishStatus, Option<String>), TaskError> {
        if let Some(real) = self.events.finish_event(session_id).await? {
            let status = real.finish_status().unwrap_or(status);
            return Ok((status, None));
        }
        self.events
            .append_event(&Event::finish(session_id, status, Some(reason.clone())))
            .await?;
        Ok((status, Some(reason)))
    }

    async fn finish_and_clear(
        &self,
        task: &GenerateTask,
        status: FinishStatus,
        reason: Option<String>,
        exit_code: Option<i64>,
    ) -> TaskResult {
        if let Err(e) = self.sessions.set_running(&task.session_id, false).await {
            warn!(error = %e, "failed to clear is_running");
        }
        let _ = self.stop.clear(&task.session_id).await;
        TaskResult {
            session_id: task.session_id.clone(),
            status,
            reason,
            container_exit_code: exit_code,
        }
    }

    /// Run one task to its terminal state.
    pub async fn execute(&self, task: &GenerateTask) -> Result<TaskResult, TaskError> {
        let spec = self.build_spec(task);
        self.control.remove_existing(&spec.name).await?;
        let container_id = match self.control.start(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let (status, reason) = self
                    .synthesize_finish(
                        &task.session_id,
                        FinishStatus::Failed,
                        format!("container-start-failed: {e}"),
                    )
                    .await?;
                return Ok(self.finish_and_clear(task, status, reason, None).await);
            }
        };
        info!(session_id = %task.session_id, container_id = %container_id, "agent container started");
        if let Err(e) = self.sessions.set_running(&task.session_id, true).await {
            warn!(error = %e, "failed to set is_running");
        }

        let started = tokio::time::Instant::now();
        loop {
            // A real finish event is the preferred terminal signal.
            if let Some(finish) = self.events.finish_event(&task.session_id).await? {
                let status = finish.finish_status().unwrap_or(FinishStatus::Failed);
                let _ = self.control.remove_existing(&spec.name).await;
                return Ok(self.finish_and_clear(task, status, None, None).await);
            }

            if started.elapsed() > self.config.task_timeout {
                warn!(session_id = %task.session_id, "task timeout, stopping container");
                let _ = self.control.stop(&container_id, Duration::from_secs(10)).await;
                let _ = self.control.remove_existing(&spec.name).await;
                let (status, reason) = self
                    .synthesize_finish(
                        &task.session_id,
                        FinishStatus::Timeout,
                        format!(
                            "task timeout after {}s",
                            self.config.task_timeout.as_secs()
                        ),
                    )
                    .await?;
                return Ok(self.finish_and_clear(task, status, reason, None).await);
            }

            if self.stop.is_stop_requested(&task.session_id).await? {
                // Give the runtime the grace window to write its own
                // finish{stopped}; stop the container either way.
                info!(session_id = %task.session_id, "stop requested, stopping container");
                let _ = self.control.stop(&container_id, self.config.stop_grace).await;
                let _ = self.control.remove_existing(&spec.name).await;
                let (status, reason) = self
                    .synthesize_finish(
                        &task.session_id,
                        FinishStatus::Stopped,
                        "stop-requested".to_string(),
                    )
                    .await?;
                return Ok(self.finish_and_clear(task, status, reason, None).await);
            }

            match self.control.state(&container_id).await? {
                ContainerState::Running => {}
                ContainerState::Exited(code) => {
                    let _ = self.control.remove_existing(&spec.name).await;
                    let (status, reason) = self
                        .synthesize_finish(
                            &task.session_id,
                            FinishStatus::Failed,
                            format!("container-exited: exit_code={code}"),
                        )
                        .await?;
                    return Ok(self
                        .finish_and_clear(task, status, reason, Some(code))
                        .await);
                }
                ContainerState::Gone => {
                    let (status, reason) = self
                        .synthesize_finish(
                            &task.session_id,
                            FinishStatus::Failed,
                            "container-exited: not found".to_string(),
                        )
                        .await?;
                    return Ok(self.finish_and_clear(task, status, reason, None).await);
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
