//! Task orchestration layer.
//!
//! The worker pool consumes generation tasks from the broker and, per task,
//! spawns an isolated agent container, monitors it against the store's
//! finish event, and tears it down. Workers never load agent code; all
//! agent work happens inside the spawned container.

mod broker;
mod docker;
mod orchestrator;

pub use broker::{BrokerError, GenerateTask, TaskBroker, TASK_STREAM, TASK_SUBJECT};
pub use docker::DockerControl;
pub use orchestrator::{
    container_name, ContainerControl, ContainerSpec, ContainerState, OrchestratorConfig,
    TaskError, TaskOrchestrator, TaskResult,
};
