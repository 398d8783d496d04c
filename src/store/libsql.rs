//! libSQL queue store — durable `QueueStore` implementation.
//!
//! Queues and their messages live in two tables; the compare-and-set is a
//! conditional `UPDATE ... WHERE state = ?` checked via affected-row count.
//! Timestamps are written as RFC 3339 text. Supports local file and
//! in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::{MediaRef, TransformedMessage};
use crate::queue::model::{MessageStatus, Queue, QueueKey, QueuedMessage, QueueState};
use crate::store::traits::QueueStore;

const QUEUE_COLUMNS: &str = "id, source_id, destination_id, rule_set_id, state, opened_at, close_interval_secs, dispatch_attempts, updated_at";

/// libSQL-backed queue store.
///
/// A single connection is reused for all operations; `libsql::Connection`
/// is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        let store = Self { db: Arc::new(db), conn };
        store.init_schema().await?;
        info!(path = %path.display(), "Queue store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        let store = Self { db: Arc::new(db), conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS queues (
                    id TEXT PRIMARY KEY,
                    source_id TEXT NOT NULL,
                    destination_id TEXT NOT NULL,
                    rule_set_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    opened_at TEXT NOT NULL,
                    close_interval_secs INTEGER NOT NULL,
                    dispatch_attempts INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_queues_state ON queues(state);
                CREATE INDEX IF NOT EXISTS idx_queues_key
                    ON queues(source_id, destination_id, rule_set_id, state);
                CREATE TABLE IF NOT EXISTS queue_messages (
                    id TEXT PRIMARY KEY,
                    queue_id TEXT NOT NULL,
                    sequence_no INTEGER NOT NULL,
                    text TEXT NOT NULL,
                    media_refs TEXT NOT NULL,
                    tags TEXT NOT NULL,
                    status TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_queue_messages_queue
                    ON queue_messages(queue_id, sequence_no);",
            )
            .await
            .map_err(|e| StoreError::Query(format!("init_schema: {e}")))?;
        Ok(())
    }

    async fn load_messages(&self, queue_id: Uuid) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, sequence_no, text, media_refs, tags, status
                 FROM queue_messages WHERE queue_id = ?1 ORDER BY sequence_no",
                params![queue_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("load_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("load_messages: {e}")))?
        {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn load_queue_rows(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Vec<Queue>, StoreError> {
        let mut rows = self
            .conn
            .query(sql, args)
            .await
            .map_err(|e| StoreError::Query(format!("load_queues: {e}")))?;

        let mut skeletons = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("load_queues: {e}")))?
        {
            skeletons.push(row_to_queue(&row)?);
        }

        let mut queues = Vec::with_capacity(skeletons.len());
        for mut queue in skeletons {
            queue.messages = self.load_messages(queue.id).await?;
            queues.push(queue);
        }
        Ok(queues)
    }
}

// ── Row parsing helpers ─────────────────────────────────────────────

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn column_text(row: &libsql::Row, idx: i32, what: &str) -> Result<String, StoreError> {
    row.get::<String>(idx)
        .map_err(|e| StoreError::Query(format!("{what}: {e}")))
}

fn column_i64(row: &libsql::Row, idx: i32, what: &str) -> Result<i64, StoreError> {
    row.get::<i64>(idx)
        .map_err(|e| StoreError::Query(format!("{what}: {e}")))
}

fn row_to_queue(row: &libsql::Row) -> Result<Queue, StoreError> {
    let id = column_text(row, 0, "queue id")?;
    let state = column_text(row, 4, "queue state")?;
    Ok(Queue {
        id: Uuid::parse_str(&id)
            .map_err(|e| StoreError::Serialization(format!("queue id {id}: {e}")))?,
        key: QueueKey {
            source_id: column_text(row, 1, "source_id")?,
            destination_id: column_text(row, 2, "destination_id")?,
            rule_set_id: column_text(row, 3, "rule_set_id")?,
        },
        state: QueueState::parse(&state)
            .ok_or_else(|| StoreError::Serialization(format!("unknown queue state {state}")))?,
        opened_at: parse_datetime(&column_text(row, 5, "opened_at")?),
        close_interval: Duration::from_secs(column_i64(row, 6, "close_interval_secs")?.max(0) as u64),
        dispatch_attempts: column_i64(row, 7, "dispatch_attempts")?.max(0) as u32,
        updated_at: parse_datetime(&column_text(row, 8, "updated_at")?),
        messages: Vec::new(),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<QueuedMessage, StoreError> {
    let id = column_text(row, 0, "message id")?;
    let media_refs: Vec<MediaRef> = serde_json::from_str(&column_text(row, 3, "media_refs")?)
        .map_err(|e| StoreError::Serialization(format!("media_refs: {e}")))?;
    let tags: Vec<String> = serde_json::from_str(&column_text(row, 4, "tags")?)
        .map_err(|e| StoreError::Serialization(format!("tags: {e}")))?;
    let status = column_text(row, 5, "message status")?;
    Ok(QueuedMessage {
        message: TransformedMessage {
            id: Uuid::parse_str(&id)
                .map_err(|e| StoreError::Serialization(format!("message id {id}: {e}")))?,
            text: column_text(row, 2, "message text")?,
            media_refs,
            tags,
        },
        sequence_no: column_i64(row, 1, "sequence_no")?.max(0) as u32,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| StoreError::Serialization(format!("unknown message status {status}")))?,
    })
}

fn encode_message(message: &TransformedMessage) -> Result<(String, String), StoreError> {
    let media = serde_json::to_string(&message.media_refs)
        .map_err(|e| StoreError::Serialization(format!("media_refs: {e}")))?;
    let tags = serde_json::to_string(&message.tags)
        .map_err(|e| StoreError::Serialization(format!("tags: {e}")))?;
    Ok((media, tags))
}

#[async_trait]
impl QueueStore for LibSqlStore {
    async fn insert_queue(&self, queue: &Queue) -> Result<(), StoreError> {
        self.conn
            .execute(
                &format!("INSERT INTO queues ({QUEUE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    queue.id.to_string(),
                    queue.key.source_id.clone(),
                    queue.key.destination_id.clone(),
                    queue.key.rule_set_id.clone(),
                    queue.state.as_str(),
                    queue.opened_at.to_rfc3339(),
                    queue.close_interval.as_secs() as i64,
                    queue.dispatch_attempts as i64,
                    queue.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_queue: {e}")))?;

        for queued in &queue.messages {
            let (media, tags) = encode_message(&queued.message)?;
            self.conn
                .execute(
                    "INSERT INTO queue_messages (id, queue_id, sequence_no, text, media_refs, tags, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        queued.message.id.to_string(),
                        queue.id.to_string(),
                        queued.sequence_no as i64,
                        queued.message.text.clone(),
                        media,
                        tags,
                        queued.status.as_str(),
                    ],
                )
                .await
                .map_err(|e| StoreError::Query(format!("insert_queue message: {e}")))?;
        }

        debug!(queue_id = %queue.id, source_id = %queue.key.source_id, "Queue persisted");
        Ok(())
    }

    async fn append_message(
        &self,
        queue_id: Uuid,
        message: &TransformedMessage,
    ) -> Result<Option<u32>, StoreError> {
        // The touch doubles as the open-state gate: zero affected rows
        // means the queue closed (or never existed) since it was found.
        let affected = self
            .conn
            .execute(
                "UPDATE queues SET updated_at = ?1 WHERE id = ?2 AND state = 'open'",
                params![Utc::now().to_rfc3339(), queue_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_message gate: {e}")))?;
        if affected == 0 {
            if self.get_queue(queue_id).await?.is_none() {
                return Err(StoreError::QueueNotFound(queue_id));
            }
            return Ok(None);
        }

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM queue_messages WHERE queue_id = ?1",
                params![queue_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_message count: {e}")))?;
        let sequence_no = match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("append_message count: {e}")))?
        {
            Some(row) => column_i64(&row, 0, "message count")?.max(0) as u32,
            None => 0,
        };

        let (media, tags) = encode_message(message)?;
        self.conn
            .execute(
                "INSERT INTO queue_messages (id, queue_id, sequence_no, text, media_refs, tags, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id.to_string(),
                    queue_id.to_string(),
                    sequence_no as i64,
                    message.text.clone(),
                    media,
                    tags,
                    MessageStatus::Pending.as_str(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_message: {e}")))?;

        Ok(Some(sequence_no))
    }

    async fn get_queue(&self, queue_id: Uuid) -> Result<Option<Queue>, StoreError> {
        let queues = self
            .load_queue_rows(
                &format!("SELECT {QUEUE_COLUMNS} FROM queues WHERE id = ?1"),
                params![queue_id.to_string()],
            )
            .await?;
        Ok(queues.into_iter().next())
    }

    async fn find_open_queue(&self, key: &QueueKey) -> Result<Option<Queue>, StoreError> {
        let queues = self
            .load_queue_rows(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queues
                     WHERE source_id = ?1 AND destination_id = ?2 AND rule_set_id = ?3 AND state = 'open'"
                ),
                params![
                    key.source_id.clone(),
                    key.destination_id.clone(),
                    key.rule_set_id.clone()
                ],
            )
            .await?;
        Ok(queues.into_iter().next())
    }

    async fn load_queues(&self, state: QueueState) -> Result<Vec<Queue>, StoreError> {
        self.load_queue_rows(
            &format!("SELECT {QUEUE_COLUMNS} FROM queues WHERE state = ?1 ORDER BY opened_at"),
            params![state.as_str()],
        )
        .await
    }

    async fn load_resumable(&self) -> Result<Vec<Queue>, StoreError> {
        self.load_queue_rows(
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM queues
                 WHERE state NOT IN ('sent', 'failed') ORDER BY opened_at"
            ),
            (),
        )
        .await
    }

    async fn compare_and_set_state(
        &self,
        queue_id: Uuid,
        expected: QueueState,
        next: QueueState,
    ) -> Result<bool, StoreError> {
        let affected = self
            .conn
            .execute(
                "UPDATE queues SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
                params![
                    next.as_str(),
                    Utc::now().to_rfc3339(),
                    queue_id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("compare_and_set_state: {e}")))?;

        if affected == 0 {
            // Distinguish "lost the race" from "no such queue".
            let exists = self.get_queue(queue_id).await?.is_some();
            if !exists {
                return Err(StoreError::QueueNotFound(queue_id));
            }
            return Ok(false);
        }
        debug!(queue_id = %queue_id, from = %expected, to = %next, "Queue state transition");
        Ok(true)
    }

    async fn save_message_result(
        &self,
        queue_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn
            .execute(
                "UPDATE queue_messages SET status = ?1 WHERE id = ?2 AND queue_id = ?3",
                params![status.as_str(), message_id.to_string(), queue_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_message_result: {e}")))?;
        if affected == 0 {
            return Err(StoreError::Query(format!(
                "message {message_id} not in queue {queue_id}"
            )));
        }
        self.conn
            .execute(
                "UPDATE queues SET updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), queue_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_message_result touch: {e}")))?;
        Ok(())
    }

    async fn record_dispatch_attempt(&self, queue_id: Uuid) -> Result<u32, StoreError> {
        self.conn
            .execute(
                "UPDATE queues SET dispatch_attempts = dispatch_attempts + 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), queue_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_dispatch_attempt: {e}")))?;

        let mut rows = self
            .conn
            .query(
                "SELECT dispatch_attempts FROM queues WHERE id = ?1",
                params![queue_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_dispatch_attempt: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("record_dispatch_attempt: {e}")))?
        {
            Some(row) => Ok(column_i64(&row, 0, "dispatch_attempts")?.max(0) as u32),
            None => Err(StoreError::QueueNotFound(queue_id)),
        }
    }

    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = older_than.to_rfc3339();
        self.conn
            .execute(
                "DELETE FROM queue_messages WHERE queue_id IN
                   (SELECT id FROM queues WHERE state IN ('sent', 'failed') AND updated_at < ?1)",
                params![cutoff.clone()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("prune_terminal messages: {e}")))?;
        let affected = self
            .conn
            .execute(
                "DELETE FROM queues WHERE state IN ('sent', 'failed') AND updated_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| StoreError::Query(format!("prune_terminal: {e}")))?;
        Ok(affected as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformed(text: &str) -> TransformedMessage {
        TransformedMessage {
            id: Uuid::new_v4(),
            text: text.into(),
            media_refs: vec![MediaRef::new("photo-1")],
            tags: vec!["дроп".into()],
        }
    }

    fn open_queue(source: &str) -> Queue {
        Queue::open(
            QueueKey::new(source, "dst-1", "rs-1"),
            Duration::from_secs(2700),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn round_trips_a_queue_with_messages() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let queue = open_queue("src-a");
        store.insert_queue(&queue).await.unwrap();

        let msg = transformed("Платье 650 грн");
        assert_eq!(store.append_message(queue.id, &msg).await.unwrap(), Some(0));
        assert_eq!(
            store.append_message(queue.id, &transformed("друге")).await.unwrap(),
            Some(1)
        );

        let loaded = store.get_queue(queue.id).await.unwrap().unwrap();
        assert_eq!(loaded.key, queue.key);
        assert_eq!(loaded.state, QueueState::Open);
        assert_eq!(loaded.close_interval, Duration::from_secs(2700));
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].message.text, "Платье 650 грн");
        assert_eq!(loaded.messages[0].message.media_refs[0], MediaRef::new("photo-1"));
        assert_eq!(loaded.messages[0].message.tags, vec!["дроп".to_string()]);
    }

    #[tokio::test]
    async fn find_open_queue_matches_full_key() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let queue = open_queue("src-a");
        store.insert_queue(&queue).await.unwrap();

        assert!(store.find_open_queue(&queue.key).await.unwrap().is_some());
        assert!(
            store
                .find_open_queue(&QueueKey::new("src-a", "dst-2", "rs-1"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn append_is_refused_once_the_queue_closes() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut queue = open_queue("src-a");
        queue.state = QueueState::Closed;
        store.insert_queue(&queue).await.unwrap();

        let appended = store.append_message(queue.id, &transformed("late")).await.unwrap();
        assert_eq!(appended, None);
        let loaded = store.get_queue(queue.id).await.unwrap().unwrap();
        assert!(loaded.messages.is_empty());

        let err = store
            .append_message(Uuid::new_v4(), &transformed("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn cas_is_atomic_on_state() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let queue = open_queue("src-a");
        store.insert_queue(&queue).await.unwrap();

        assert!(
            store
                .compare_and_set_state(queue.id, QueueState::Open, QueueState::Closed)
                .await
                .unwrap()
        );
        assert!(
            !store
                .compare_and_set_state(queue.id, QueueState::Open, QueueState::Closed)
                .await
                .unwrap()
        );
        let err = store
            .compare_and_set_state(Uuid::new_v4(), QueueState::Open, QueueState::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn message_results_persist() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let queue = open_queue("src-a");
        store.insert_queue(&queue).await.unwrap();
        let msg = transformed("a");
        store.append_message(queue.id, &msg).await.unwrap();

        store
            .save_message_result(queue.id, msg.id, MessageStatus::Sent)
            .await
            .unwrap();
        let loaded = store.get_queue(queue.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages[0].status, MessageStatus::Sent);

        let report = store.queue_report(queue.id).await.unwrap().unwrap();
        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.messages[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn dispatch_attempts_increment() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let queue = open_queue("src-a");
        store.insert_queue(&queue).await.unwrap();
        assert_eq!(store.record_dispatch_attempt(queue.id).await.unwrap(), 1);
        assert_eq!(store.record_dispatch_attempt(queue.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn resumable_and_state_loads() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut open = open_queue("src-a");
        open.messages.push(QueuedMessage {
            message: transformed("x"),
            sequence_no: 0,
            status: MessageStatus::Pending,
        });
        store.insert_queue(&open).await.unwrap();

        let mut sent = open_queue("src-b");
        sent.state = QueueState::Sent;
        store.insert_queue(&sent).await.unwrap();

        let resumable = store.load_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].id, open.id);
        assert_eq!(resumable[0].messages.len(), 1);

        assert_eq!(store.load_queues(QueueState::Sent).await.unwrap().len(), 1);
        assert!(store.load_queues(QueueState::Closed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");

        let queue = open_queue("src-a");
        {
            let store = LibSqlStore::new_local(&path).await.unwrap();
            store.insert_queue(&queue).await.unwrap();
            store.append_message(queue.id, &transformed("a")).await.unwrap();
        }

        let store = LibSqlStore::new_local(&path).await.unwrap();
        let loaded = store.get_queue(queue.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn prune_deletes_old_terminal_only() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut old_sent = open_queue("src-a");
        old_sent.state = QueueState::Sent;
        old_sent.updated_at = Utc::now() - chrono::Duration::hours(48);
        store.insert_queue(&old_sent).await.unwrap();

        let open = open_queue("src-b");
        store.insert_queue(&open).await.unwrap();

        let pruned = store
            .prune_terminal(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_queue(old_sent.id).await.unwrap().is_none());
        assert!(store.get_queue(open.id).await.unwrap().is_some());
    }
}
