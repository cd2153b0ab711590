use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use appforge_contract::storage::{EventStore, MessageStore, SessionStore, StopSignals};
use appforge_taskd::{GenerateTask, TaskBroker};

use crate::auth::AuthConfig;
use crate::dev_containers::DevContainers;

/// Seam over the broker so tests can record enqueued tasks.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn enqueue(&self, task: GenerateTask) -> Result<(), String>;
}

#[async_trait]
impl TaskSink for TaskBroker {
    async fn enqueue(&self, task: GenerateTask) -> Result<(), String> {
        TaskBroker::enqueue(self, &task)
            .await
            .map_err(|e| e.to_string())
    }
}

#[derive(Clone)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Idle/connection timeout; the stream closes without a finish and the
    /// client may resume.
    pub idle_timeout: Duration,
    /// Consecutive empty polls before checking whether the agent silently
    /// went away.
    pub quiet_polls_before_liveness_check: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            idle_timeout: Duration::from_secs(300),
            quiet_polls_before_liveness_check: 20,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub events: Arc<dyn EventStore>,
    pub messages: Arc<dyn MessageStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub stop: Arc<dyn StopSignals>,
    pub tasks: Arc<dyn TaskSink>,
    pub auth: Arc<AuthConfig>,
    /// None when no container engine is reachable (tests, bare dev).
    pub dev: Option<Arc<DevContainers>>,
    pub stream: StreamSettings,
}
