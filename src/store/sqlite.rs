//! SQLite conversation store.
//!
//! A message row that cannot be read back (bad uuid, unknown role, out of
//! range timestamp) makes the whole thread load as empty, the same way the
//! file backend treats a corrupted log. A corrupted metadata document only
//! loses its optional fields.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, SqlitePool};
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::ConversationStore;
use crate::error::{Result, ThreadlineError};
use crate::types::{PersistedMessage, Role, RunId, ThreadMetadata};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY NOT NULL,
        thread_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        parent_run_id TEXT,
        generation_id TEXT,
        message_order_idx INTEGER,
        timestamp INTEGER NOT NULL,
        message_type TEXT NOT NULL,
        role TEXT NOT NULL,
        from_agent TEXT,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_thread_order
        ON messages (thread_id, timestamp, message_order_idx)",
    "CREATE TABLE IF NOT EXISTS thread_metadata (
        thread_id TEXT PRIMARY KEY NOT NULL,
        current_run_id TEXT,
        last_updated INTEGER NOT NULL,
        metadata_json TEXT
    )",
];

/// Fields of [`ThreadMetadata`] without their own column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latest_run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_mappings: Option<std::collections::BTreeMap<String, RunId>>,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
}

/// SQLite-backed store.
///
/// Tables are created on first use; concurrent first callers share a single
/// creation. Timestamps are stored as integer microseconds.
pub struct SqliteConversationStore {
    pool: SqlitePool,
    schema: OnceCell<()>,
}

impl SqliteConversationStore {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            schema: OnceCell::new(),
        }
    }

    /// Connect to `url` (e.g. `sqlite://threads.db`), creating the file if needed.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self::new(pool))
    }

    /// Private in-memory database held by a single pooled connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                let mut tx = self.pool.begin().await?;
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&mut *tx).await?;
                }
                tx.commit().await?;
                tracing::debug!("sqlite conversation schema ready");
                Ok::<(), ThreadlineError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn append(&self, thread_id: &str, messages: &[PersistedMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        for message in messages {
            sqlx::query(
                "INSERT INTO messages (id, thread_id, run_id, parent_run_id, generation_id, \
                 message_order_idx, timestamp, message_type, role, from_agent, payload) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&message.id)
            .bind(thread_id)
            .bind(message.run_id.to_string())
            .bind(message.parent_run_id.map(|id| id.to_string()))
            .bind(message.generation_id.map(|id| id.to_string()))
            .bind(message.message_order_idx.map(i64::from))
            .bind(message.timestamp.timestamp_micros())
            .bind(&message.message_type)
            .bind(message.role.to_string())
            .bind(&message.from_agent)
            .bind(&message.payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Vec<PersistedMessage>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT id, thread_id, run_id, parent_run_id, generation_id, message_order_idx, \
             timestamp, message_type, role, from_agent, payload \
             FROM messages WHERE thread_id = ? \
             ORDER BY timestamp ASC, COALESCE(message_order_idx, 0) ASC, rowid ASC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        match rows.iter().map(message_from_row).collect::<Result<Vec<_>>>() {
            Ok(messages) => Ok(messages),
            Err(error) => {
                tracing::warn!(thread_id, %error, "ignoring corrupted thread log");
                Ok(Vec::new())
            }
        }
    }

    async fn save_metadata(&self, metadata: &ThreadMetadata) -> Result<()> {
        self.ensure_schema().await?;
        let document = MetadataDocument {
            latest_run_id: metadata.latest_run_id,
            session_mappings: metadata.session_mappings.clone(),
            properties: metadata.properties.clone(),
        };
        sqlx::query(
            "INSERT INTO thread_metadata (thread_id, current_run_id, last_updated, metadata_json) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(thread_id) DO UPDATE SET \
                current_run_id = excluded.current_run_id, \
                last_updated = excluded.last_updated, \
                metadata_json = excluded.metadata_json",
        )
        .bind(&metadata.thread_id)
        .bind(metadata.current_run_id.map(|id| id.to_string()))
        .bind(metadata.last_updated.timestamp_micros())
        .bind(serde_json::to_string(&document)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_metadata(&self, thread_id: &str) -> Result<Option<ThreadMetadata>> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT thread_id, current_run_id, last_updated, metadata_json \
             FROM thread_metadata WHERE thread_id = ?",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(metadata_from_row).transpose()
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM thread_metadata WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<ThreadMetadata>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT thread_id, current_run_id, last_updated, metadata_json FROM thread_metadata \
             UNION ALL \
             SELECT m.thread_id, NULL, MAX(m.timestamp), NULL FROM messages m \
             WHERE NOT EXISTS (SELECT 1 FROM thread_metadata t WHERE t.thread_id = m.thread_id) \
             GROUP BY m.thread_id \
             ORDER BY last_updated DESC, thread_id ASC \
             LIMIT ? OFFSET ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(metadata_from_row).collect()
    }
}

fn parse_uuid(column: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|err| {
        ThreadlineError::InvalidArgument(format!("column {column} holds invalid uuid {raw:?}: {err}"))
    })
}

fn parse_optional_uuid(column: &str, raw: Option<String>) -> Result<Option<Uuid>> {
    raw.map(|raw| parse_uuid(column, &raw)).transpose()
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
        ThreadlineError::InvalidArgument(format!("timestamp out of range: {micros}"))
    })
}

fn message_from_row(row: &SqliteRow) -> Result<PersistedMessage> {
    let role: String = row.try_get("role")?;
    let role = Role::from_str(&role)
        .map_err(|_| ThreadlineError::InvalidArgument(format!("unknown role {role:?}")))?;
    let order: Option<i64> = row.try_get("message_order_idx")?;
    Ok(PersistedMessage {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        run_id: parse_uuid("run_id", &row.try_get::<String, _>("run_id")?)?,
        parent_run_id: parse_optional_uuid("parent_run_id", row.try_get("parent_run_id")?)?,
        generation_id: parse_optional_uuid("generation_id", row.try_get("generation_id")?)?,
        message_order_idx: order.and_then(|idx| u32::try_from(idx).ok()),
        timestamp: micros_to_datetime(row.try_get("timestamp")?)?,
        message_type: row.try_get("message_type")?,
        role,
        from_agent: row.try_get("from_agent")?,
        payload: row.try_get("payload")?,
    })
}

fn metadata_from_row(row: &SqliteRow) -> Result<ThreadMetadata> {
    let thread_id: String = row.try_get("thread_id")?;
    let last_updated = micros_to_datetime(row.try_get("last_updated")?)?;
    let mut metadata = ThreadMetadata::synthesized(thread_id, last_updated);

    let current: Option<String> = row.try_get("current_run_id")?;
    match parse_optional_uuid("current_run_id", current) {
        Ok(current) => metadata.current_run_id = current,
        Err(error) => {
            tracing::warn!(thread_id = %metadata.thread_id, %error, "ignoring corrupted current_run_id");
        }
    }

    let document: Option<String> = row.try_get("metadata_json")?;
    if let Some(raw) = document {
        match serde_json::from_str::<MetadataDocument>(&raw) {
            Ok(document) => {
                metadata.latest_run_id = document.latest_run_id;
                metadata.session_mappings = document.session_mappings;
                metadata.properties = document.properties;
            }
            Err(error) => {
                tracing::warn!(thread_id = %metadata.thread_id, %error, "ignoring corrupted metadata_json");
            }
        }
    }
    Ok(metadata)
}
