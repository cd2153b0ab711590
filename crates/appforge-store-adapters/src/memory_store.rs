use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use appforge_contract::storage::{
    EventStore, MessageStore, SessionStore, SortOrder, StopSignals, StoreError,
};
use appforge_contract::{Event, EventType, Message, Session};

const STOP_SIGNAL_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Inner {
    /// Insertion order is the tie-break for equal timestamps.
    events: Vec<Event>,
    event_ids: HashSet<String>,
    messages: Vec<Message>,
    message_ids: HashSet<String>,
    sessions: HashMap<String, Session>,
    stop_requests: HashMap<String, Instant>,
}

/// In-memory storage for tests and local development.
///
/// Additionally exposes direct snapshots (`events_snapshot`,
/// `messages_snapshot`) for test inspection.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored events for a session, in canonical order.
    pub async fn events_snapshot(&self, session_id: &str) -> Vec<Event> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        events
    }

    /// All stored messages for a session, in canonical order.
    pub async fn messages_snapshot(&self, session_id: &str) -> Vec<Message> {
        let inner = self.inner.read().await;
        inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, event: &Event) -> Result<String, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.event_ids.insert(event.id.clone()) {
            return Ok(event.id.clone());
        }
        inner.events.push(event.clone());
        Ok(event.id.clone())
    }

    async fn events_since(
        &self,
        session_id: &str,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().await;
        let mut matched: Vec<(usize, &Event)> = inner
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.session_id == session_id)
            .filter(|(_, e)| after.is_none_or(|ts| e.timestamp > ts))
            .collect();
        matched.sort_by(|(seq_a, a), (seq_b, b)| {
            a.timestamp.total_cmp(&b.timestamp).then(seq_a.cmp(seq_b))
        });
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn finish_event(&self, session_id: &str) -> Result<Option<Event>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.session_id == session_id && e.event_type == EventType::Finish)
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
            .cloned())
    }

    async fn purge_expired(&self, older_than: f64) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.events.len();
        inner.events.retain(|e| e.timestamp >= older_than);
        let removed: Vec<String> = {
            let kept: HashSet<&str> = inner.events.iter().map(|e| e.id.as_str()).collect();
            inner
                .event_ids
                .iter()
                .filter(|id| !kept.contains(id.as_str()))
                .cloned()
                .collect()
        };
        for id in removed {
            inner.event_ids.remove(&id);
        }
        Ok((before - inner.events.len()) as u64)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append_message(&self, message: &Message) -> Result<String, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.message_ids.insert(message.id.clone()) {
            return Ok(message.id.clone());
        }
        inner.messages.push(message.clone());
        Ok(message.id.clone())
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let mut matched: Vec<(usize, &Message)> = inner
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.session_id == session_id)
            .collect();
        matched.sort_by(|(seq_a, a), (seq_b, b)| {
            a.timestamp.total_cmp(&b.timestamp).then(seq_a.cmp(seq_b))
        });
        let messages: Vec<Message> = match order {
            SortOrder::Asc => matched
                .into_iter()
                .take(limit)
                .map(|(_, m)| m.clone())
                .collect(),
            SortOrder::Desc => matched
                .into_iter()
                .rev()
                .take(limit)
                .map(|(_, m)| m.clone())
                .collect(),
        };
        Ok(messages)
    }

    async fn last_message(&self, session_id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self
            .list_messages(session_id, 1, SortOrder::Desc)
            .await?
            .into_iter()
            .next())
    }

    async fn purge_expired(&self, older_than: f64) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.messages.len();
        inner.messages.retain(|m| m.timestamp >= older_than);
        let kept: HashSet<String> = inner.messages.iter().map(|m| m.id.clone()).collect();
        inner.message_ids.retain(|id| kept.contains(id));
        Ok((before - inner.messages.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::Invariant(format!(
                "session already exists: {}",
                session.id
            )));
        }
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(session_id).cloned())
    }

    async fn list_sessions(&self, created_by: &str) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.created_by == created_by)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));
        Ok(sessions)
    }

    async fn set_running(&self, session_id: &str, running: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.is_running = running;
        session.updated_at = appforge_contract::clock::monotonic_now();
        Ok(())
    }
}

#[async_trait]
impl StopSignals for MemoryStore {
    async fn request_stop(&self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .stop_requests
            .insert(session_id.to_string(), Instant::now());
        Ok(())
    }

    async fn is_stop_requested(&self, session_id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .stop_requests
            .get(session_id)
            .is_some_and(|at| at.elapsed() < STOP_SIGNAL_TTL))
    }

    async fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.stop_requests.remove(session_id);
        Ok(())
    }
}
