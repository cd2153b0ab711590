//! At-least-once task queue on JetStream.
//!
//! A work-queue stream holds generation tasks; workers pull through a
//! durable consumer and ack only after the orchestrator returns, so a
//! crashed worker's task is redelivered.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use async_nats::jetstream;
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy};

use appforge_contract::Framework;

pub const TASK_STREAM: &str = "APPFORGE_TASKS";
pub const TASK_SUBJECT: &str = "appforge.tasks.generate";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("nats error: {0}")]
    Nats(String),

    #[error("bad task payload: {0}")]
    Payload(String),
}

/// One unit of work: run the team for a session's latest user turn.
/// The prompt is deliberately absent; the container rediscovers it from
/// the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateTask {
    pub session_id: String,
    pub workspace_id: String,
    pub framework: Framework,
}

pub struct TaskBroker {
    jetstream: jetstream::Context,
}

impl TaskBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Nats(e.to_string()))?;
        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }

    /// Create the work-queue stream if it does not exist (idempotent).
    pub async fn ensure_stream(&self) -> Result<(), BrokerError> {
        self.jetstream
            .get_or_create_stream(StreamConfig {
                name: TASK_STREAM.to_string(),
                subjects: vec![TASK_SUBJECT.to_string()],
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Nats(e.to_string()))?;
        Ok(())
    }

    pub async fn enqueue(&self, task: &GenerateTask) -> Result<(), BrokerError> {
        let payload =
            serde_json::to_vec(task).map_err(|e| BrokerError::Payload(e.to_string()))?;
        self.jetstream
            .publish(TASK_SUBJECT, payload.into())
            .await
            .map_err(|e| BrokerError::Nats(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Nats(e.to_string()))?;
        Ok(())
    }

    /// Consume tasks forever, invoking `handle` per task and acking on
    /// return. `handle` failures are logged and acked anyway once the
    /// orchestrator has synthesised the terminal state; transport errors
    /// leave the message unacked for redelivery.
    pub async fn consume<F, Fut>(&self, durable: &str, handle: F) -> Result<(), BrokerError>
    where
        F: Fn(GenerateTask) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let stream = self
            .jetstream
            .get_or_create_stream(StreamConfig {
                name: TASK_STREAM.to_string(),
                subjects: vec![TASK_SUBJECT.to_string()],
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Nats(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                durable,
                PullConfig {
                    durable_name: Some(durable.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Nats(e.to_string()))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Nats(e.to_string()))?;

        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "task message receive failed");
                    continue;
                }
            };
            match serde_json::from_slice::<GenerateTask>(&message.payload) {
                Ok(task) => {
                    tracing::info!(session_id = %task.session_id, "task received");
                    handle(task).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "dropping malformed task payload");
                }
            }
            if let Err(e) = message.ack().await {
                tracing::warn!(error = %e, "task ack failed; task may be redelivered");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_payload_round_trip() {
        let task = GenerateTask {
            session_id: "sess_1".to_string(),
            workspace_id: "ws_1".to_string(),
            framework: Framework::FastapiVite,
        };
        let bytes = serde_json::to_vec(&task).unwrap();
        let back: GenerateTask = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.session_id, "sess_1");
        assert_eq!(back.framework, Framework::FastapiVite);
    }
}
