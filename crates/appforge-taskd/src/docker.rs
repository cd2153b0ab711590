//! Bollard-backed container engine.

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;

use crate::orchestrator::{ContainerControl, ContainerSpec, ContainerState, TaskError};

pub struct DockerControl {
    docker: Docker,
}

impl DockerControl {
    pub fn connect() -> Result<Self, TaskError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| TaskError::Container(e.to_string()))?;
        Ok(Self { docker })
    }

    fn is_not_found(error: &bollard::errors::Error) -> bool {
        matches!(
            error,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }
}

#[async_trait]
impl ContainerControl for DockerControl {
    async fn remove_existing(&self, name: &str) -> Result<(), TaskError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(TaskError::Container(e.to_string())),
        }
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String, TaskError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.host_workspace_path, spec.container_workspace_root
            )]),
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            auto_remove: Some(true),
            network_mode: spec.network.clone(),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| TaskError::Container(e.to_string()))?;
        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| TaskError::Container(e.to_string()))?;
        Ok(created.id)
    }

    async fn state(&self, id: &str) -> Result<ContainerState, TaskError> {
        match self.docker.inspect_container(id, None).await {
            Ok(inspect) => {
                let state = inspect.state.unwrap_or_default();
                if state.running.unwrap_or(false) {
                    Ok(ContainerState::Running)
                } else {
                    Ok(ContainerState::Exited(state.exit_code.unwrap_or(-1)))
                }
            }
            Err(e) if Self::is_not_found(&e) => Ok(ContainerState::Gone),
            Err(e) => Err(TaskError::Container(e.to_string())),
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), TaskError> {
        // `docker stop` is TERM, then KILL once the grace window elapses.
        match self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(TaskError::Container(e.to_string())),
        }
    }
}
