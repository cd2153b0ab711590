use async_trait::async_trait;
use sqlx::Row;

use appforge_contract::clock::monotonic_now;
use appforge_contract::storage::{
    EventStore, MessageStore, SessionStore, SortOrder, StopSignals, StoreError,
};
use appforge_contract::{Event, EventType, Message, Session};

const STOP_SIGNAL_TTL_SECS: f64 = 60.0;

/// Durable storage behind a Postgres connection pool.
///
/// Records are stored as jsonb with the fields the indexes need mirrored
/// into columns; a BIGSERIAL insertion sequence is the tie-break for equal
/// timestamps.
pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(Self::sql_err)?;
        Ok(Self::new(pool))
    }

    /// Ensure the storage tables and indexes exist (idempotent).
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let sql = r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id         TEXT PRIMARY KEY,
                created_by TEXT NOT NULL,
                created_at DOUBLE PRECISION NOT NULL,
                data       JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                seq        BIGSERIAL PRIMARY KEY,
                id         TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                ts         DOUBLE PRECISION NOT NULL,
                event_type TEXT NOT NULL,
                data       JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_session_ts
                ON events (session_id, ts);
            CREATE INDEX IF NOT EXISTS idx_events_session_type
                ON events (session_id, event_type);
            CREATE INDEX IF NOT EXISTS idx_events_ts
                ON events (ts);
            CREATE TABLE IF NOT EXISTS messages (
                seq        BIGSERIAL PRIMARY KEY,
                id         TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                ts         DOUBLE PRECISION NOT NULL,
                data       JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session_ts
                ON messages (session_id, ts);
            CREATE TABLE IF NOT EXISTS stop_signals (
                session_id   TEXT PRIMARY KEY,
                requested_at DOUBLE PRECISION NOT NULL
            );
        "#;
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err)?;
        Ok(())
    }

    fn sql_err(e: sqlx::Error) -> StoreError {
        StoreError::Persistence(e.to_string())
    }

    fn ser_err(e: serde_json::Error) -> StoreError {
        StoreError::Serialization(e.to_string())
    }

    fn event_from_row(data: serde_json::Value) -> Result<Event, StoreError> {
        serde_json::from_value(data).map_err(Self::ser_err)
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn append_event(&self, event: &Event) -> Result<String, StoreError> {
        let data = serde_json::to_value(event).map_err(Self::ser_err)?;
        // Duplicate ids are dropped; the first write wins.
        sqlx::query(
            "INSERT INTO events (id, session_id, ts, event_type, data)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.session_id)
        .bind(event.timestamp)
        .bind(event.event_type.as_str())
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        Ok(event.id.clone())
    }

    async fn events_since(
        &self,
        session_id: &str,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = match after {
            Some(ts) => {
                sqlx::query(
                    "SELECT data FROM events
                     WHERE session_id = $1 AND ts > $2
                     ORDER BY ts, seq LIMIT $3",
                )
                .bind(session_id)
                .bind(ts)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT data FROM events
                     WHERE session_id = $1
                     ORDER BY ts, seq LIMIT $2",
                )
                .bind(session_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(Self::sql_err)?;

        rows.into_iter()
            .map(|row| Self::event_from_row(row.get::<serde_json::Value, _>(0)))
            .collect()
    }

    async fn finish_event(&self, session_id: &str) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(
            "SELECT data FROM events
             WHERE session_id = $1 AND event_type = $2
             ORDER BY ts DESC, seq DESC LIMIT 1",
        )
        .bind(session_id)
        .bind(EventType::Finish.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::sql_err)?;

        row.map(|row| Self::event_from_row(row.get::<serde_json::Value, _>(0)))
            .transpose()
    }

    async fn purge_expired(&self, older_than: f64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE ts < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn append_message(&self, message: &Message) -> Result<String, StoreError> {
        let data = serde_json::to_value(message).map_err(Self::ser_err)?;
        sqlx::query(
            "INSERT INTO messages (id, session_id, ts, data)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.timestamp)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        Ok(message.id.clone())
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Message>, StoreError> {
        let sql = match order {
            SortOrder::Asc => {
                "SELECT data FROM messages WHERE session_id = $1 ORDER BY ts, seq LIMIT $2"
            }
            SortOrder::Desc => {
                "SELECT data FROM messages WHERE session_id = $1 ORDER BY ts DESC, seq DESC LIMIT $2"
            }
        };
        let rows = sqlx::query(sql)
            .bind(session_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::sql_err)?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row.get::<serde_json::Value, _>(0)).map_err(Self::ser_err)
            })
            .collect()
    }

    async fn last_message(&self, session_id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self
            .list_messages(session_id, 1, SortOrder::Desc)
            .await?
            .into_iter()
            .next())
    }

    async fn purge_expired(&self, older_than: f64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE ts < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let data = serde_json::to_value(session).map_err(Self::ser_err)?;
        let result = sqlx::query(
            "INSERT INTO sessions (id, created_by, created_at, data)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&session.id)
        .bind(&session.created_by)
        .bind(session.created_at)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Invariant(format!(
                "session already exists: {}",
                session.id
            )));
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT data FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::sql_err)?;
        row.map(|row| {
            serde_json::from_value(row.get::<serde_json::Value, _>(0)).map_err(Self::ser_err)
        })
        .transpose()
    }

    async fn list_sessions(&self, created_by: &str) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM sessions WHERE created_by = $1 ORDER BY created_at DESC",
        )
        .bind(created_by)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row.get::<serde_json::Value, _>(0)).map_err(Self::ser_err)
            })
            .collect()
    }

    async fn set_running(&self, session_id: &str, running: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions
             SET data = jsonb_set(
                 jsonb_set(data, '{is_running}', to_jsonb($2::boolean)),
                 '{updated_at}', to_jsonb($3::double precision))
             WHERE id = $1",
        )
        .bind(session_id)
        .bind(running)
        .bind(monotonic_now())
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StopSignals for PostgresStore {
    async fn request_stop(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO stop_signals (session_id, requested_at)
             VALUES ($1, $2)
             ON CONFLICT (session_id) DO UPDATE SET requested_at = EXCLUDED.requested_at",
        )
        .bind(session_id)
        .bind(monotonic_now())
        .execute(&self.pool)
        .await
        .map_err(Self::sql_err)?;
        Ok(())
    }

    async fn is_stop_requested(&self, session_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT requested_at FROM stop_signals WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::sql_err)?;
        Ok(row.is_some_and(|row| {
            let requested_at: f64 = row.get(0);
            monotonic_now() - requested_at < STOP_SIGNAL_TTL_SECS
        }))
    }

    async fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM stop_signals WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(Self::sql_err)?;
        Ok(())
    }
}
