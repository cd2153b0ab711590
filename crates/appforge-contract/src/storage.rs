//! Storage traits shared by the gateway, the runtime, and the orchestrator.
//!
//! Two interchangeable implementations live in `appforge-store-adapters`:
//! a durable Postgres adapter and an in-memory twin for tests and the
//! `memory` run mode.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::Event;
use crate::message::Message;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing store I/O failed. Retryable.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A caller violated an append contract (programmer error).
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Durable append of events, indexed for polling and resume.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event. Idempotent on duplicate event id: the stored event
    /// wins and the duplicate is dropped without error.
    async fn append_event(&self, event: &Event) -> Result<String, StoreError>;

    /// Events with `timestamp > after` (all events when `after` is `None`),
    /// in canonical order `(timestamp, insertion sequence)`, at most `limit`.
    async fn events_since(
        &self,
        session_id: &str,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    /// Fast lookup of the session's `finish` event, if any.
    async fn finish_event(&self, session_id: &str) -> Result<Option<Event>, StoreError>;

    /// Delete events older than the given Unix timestamp. Returns the count.
    async fn purge_expired(&self, older_than: f64) -> Result<u64, StoreError>;
}

/// Durable append of messages, ordered for history rehydration.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one message. Idempotent on duplicate message id.
    async fn append_message(&self, message: &Message) -> Result<String, StoreError>;

    /// Messages for a session ordered by `(timestamp, insertion sequence)`.
    /// `Desc` returns the newest `limit` messages, newest first.
    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Message>, StoreError>;

    /// The most recent message of a session, if any.
    async fn last_message(&self, session_id: &str) -> Result<Option<Message>, StoreError>;

    async fn purge_expired(&self, older_than: f64) -> Result<u64, StoreError>;
}

/// Session records. Created by the gateway, `is_running` owned by taskd.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Sessions owned by a user, newest first.
    async fn list_sessions(&self, created_by: &str) -> Result<Vec<Session>, StoreError>;

    async fn set_running(&self, session_id: &str, running: bool) -> Result<(), StoreError>;
}

/// Cooperative stop requests, observed by the runtime between stream items
/// and by the task orchestrator's monitor loop. Requests expire after 60 s
/// in case no one picks them up.
#[async_trait]
pub trait StopSignals: Send + Sync {
    async fn request_stop(&self, session_id: &str) -> Result<(), StoreError>;

    async fn is_stop_requested(&self, session_id: &str) -> Result<bool, StoreError>;

    async fn clear(&self, session_id: &str) -> Result<(), StoreError>;
}
