//! In-memory queue store — per-process backend for tests and dry runs.
//!
//! All operations run under one async mutex, which trivially gives the
//! compare-and-set its atomicity. State survives as long as the process;
//! durability is the libsql backend's job.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::TransformedMessage;
use crate::queue::model::{MessageStatus, Queue, QueueKey, QueuedMessage, QueueState};
use crate::store::traits::QueueStore;

/// Process-local queue store.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<Uuid, Queue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_queue(&self, queue: &Queue) -> Result<(), StoreError> {
        let mut queues = self.queues.lock().await;
        queues.insert(queue.id, queue.clone());
        Ok(())
    }

    async fn append_message(
        &self,
        queue_id: Uuid,
        message: &TransformedMessage,
    ) -> Result<Option<u32>, StoreError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&queue_id)
            .ok_or(StoreError::QueueNotFound(queue_id))?;
        if queue.state != QueueState::Open {
            return Ok(None);
        }
        let sequence_no = queue.messages.len() as u32;
        queue.messages.push(QueuedMessage {
            message: message.clone(),
            sequence_no,
            status: MessageStatus::Pending,
        });
        queue.updated_at = Utc::now();
        Ok(Some(sequence_no))
    }

    async fn get_queue(&self, queue_id: Uuid) -> Result<Option<Queue>, StoreError> {
        Ok(self.queues.lock().await.get(&queue_id).cloned())
    }

    async fn find_open_queue(&self, key: &QueueKey) -> Result<Option<Queue>, StoreError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .values()
            .find(|q| q.state == QueueState::Open && &q.key == key)
            .cloned())
    }

    async fn load_queues(&self, state: QueueState) -> Result<Vec<Queue>, StoreError> {
        let queues = self.queues.lock().await;
        let mut result: Vec<Queue> = queues.values().filter(|q| q.state == state).cloned().collect();
        result.sort_by_key(|q| q.opened_at);
        Ok(result)
    }

    async fn load_resumable(&self) -> Result<Vec<Queue>, StoreError> {
        let queues = self.queues.lock().await;
        let mut result: Vec<Queue> = queues
            .values()
            .filter(|q| !q.state.is_terminal())
            .cloned()
            .collect();
        result.sort_by_key(|q| q.opened_at);
        Ok(result)
    }

    async fn compare_and_set_state(
        &self,
        queue_id: Uuid,
        expected: QueueState,
        next: QueueState,
    ) -> Result<bool, StoreError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&queue_id)
            .ok_or(StoreError::QueueNotFound(queue_id))?;
        if queue.state != expected {
            return Ok(false);
        }
        queue.state = next;
        queue.updated_at = Utc::now();
        Ok(true)
    }

    async fn save_message_result(
        &self,
        queue_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&queue_id)
            .ok_or(StoreError::QueueNotFound(queue_id))?;
        let message = queue
            .messages
            .iter_mut()
            .find(|m| m.message.id == message_id)
            .ok_or_else(|| {
                StoreError::Query(format!("message {message_id} not in queue {queue_id}"))
            })?;
        message.status = status;
        queue.updated_at = Utc::now();
        Ok(())
    }

    async fn record_dispatch_attempt(&self, queue_id: Uuid) -> Result<u32, StoreError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&queue_id)
            .ok_or(StoreError::QueueNotFound(queue_id))?;
        queue.dispatch_attempts += 1;
        queue.updated_at = Utc::now();
        Ok(queue.dispatch_attempts)
    }

    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut queues = self.queues.lock().await;
        let before = queues.len();
        queues.retain(|_, q| !(q.state.is_terminal() && q.updated_at < older_than));
        Ok(before - queues.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn transformed(text: &str) -> TransformedMessage {
        TransformedMessage {
            id: Uuid::new_v4(),
            text: text.into(),
            media_refs: vec![],
            tags: vec![],
        }
    }

    fn open_queue() -> Queue {
        Queue::open(
            QueueKey::new("src-a", "dst-1", "rs-1"),
            Duration::from_secs(2700),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_and_find_open() {
        let store = MemoryStore::new();
        let queue = open_queue();
        store.insert_queue(&queue).await.unwrap();

        let found = store.find_open_queue(&queue.key).await.unwrap().unwrap();
        assert_eq!(found.id, queue.id);

        let other_key = QueueKey::new("src-b", "dst-1", "rs-1");
        assert!(store.find_open_queue(&other_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_assigns_sequence_numbers() {
        let store = MemoryStore::new();
        let queue = open_queue();
        store.insert_queue(&queue).await.unwrap();

        assert_eq!(
            store.append_message(queue.id, &transformed("a")).await.unwrap(),
            Some(0)
        );
        assert_eq!(
            store.append_message(queue.id, &transformed("b")).await.unwrap(),
            Some(1)
        );

        let loaded = store.get_queue(queue.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].sequence_no, 1);
        assert_eq!(loaded.messages[1].status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn append_is_refused_once_the_queue_closes() {
        let store = MemoryStore::new();
        let mut queue = open_queue();
        queue.state = QueueState::Closed;
        store.insert_queue(&queue).await.unwrap();

        let appended = store.append_message(queue.id, &transformed("late")).await.unwrap();
        assert_eq!(appended, None);
        let loaded = store.get_queue(queue.id).await.unwrap().unwrap();
        assert!(loaded.messages.is_empty());
    }

    #[tokio::test]
    async fn cas_succeeds_once() {
        let store = MemoryStore::new();
        let mut queue = open_queue();
        queue.state = QueueState::Closed;
        store.insert_queue(&queue).await.unwrap();

        assert!(
            store
                .compare_and_set_state(queue.id, QueueState::Closed, QueueState::Sending)
                .await
                .unwrap()
        );
        // A second claimant loses.
        assert!(
            !store
                .compare_and_set_state(queue.id, QueueState::Closed, QueueState::Sending)
                .await
                .unwrap()
        );
        let loaded = store.get_queue(queue.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, QueueState::Sending);
    }

    #[tokio::test]
    async fn cas_on_missing_queue_errors() {
        let store = MemoryStore::new();
        let err = store
            .compare_and_set_state(Uuid::new_v4(), QueueState::Open, QueueState::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn message_results_and_attempts() {
        let store = MemoryStore::new();
        let queue = open_queue();
        store.insert_queue(&queue).await.unwrap();
        let msg = transformed("a");
        store.append_message(queue.id, &msg).await.unwrap();

        store
            .save_message_result(queue.id, msg.id, MessageStatus::Failed)
            .await
            .unwrap();
        let loaded = store.get_queue(queue.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages[0].status, MessageStatus::Failed);

        assert_eq!(store.record_dispatch_attempt(queue.id).await.unwrap(), 1);
        assert_eq!(store.record_dispatch_attempt(queue.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn prune_only_touches_old_terminal_queues() {
        let store = MemoryStore::new();

        let mut sent = open_queue();
        sent.state = QueueState::Sent;
        sent.updated_at = Utc::now() - chrono::Duration::hours(48);
        store.insert_queue(&sent).await.unwrap();

        let mut fresh_sent = open_queue();
        fresh_sent.key = QueueKey::new("src-b", "dst-1", "rs-1");
        fresh_sent.state = QueueState::Sent;
        store.insert_queue(&fresh_sent).await.unwrap();

        let mut old_open = open_queue();
        old_open.key = QueueKey::new("src-c", "dst-1", "rs-1");
        old_open.updated_at = Utc::now() - chrono::Duration::hours(48);
        store.insert_queue(&old_open).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(store.prune_terminal(cutoff).await.unwrap(), 1);
        assert!(store.get_queue(sent.id).await.unwrap().is_none());
        assert!(store.get_queue(fresh_sent.id).await.unwrap().is_some());
        assert!(store.get_queue(old_open.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resumable_excludes_terminal() {
        let store = MemoryStore::new();
        for (state, src) in [
            (QueueState::Open, "a"),
            (QueueState::Closed, "b"),
            (QueueState::Sending, "c"),
            (QueueState::FailedPartial, "d"),
            (QueueState::Sent, "e"),
            (QueueState::Failed, "f"),
        ] {
            let mut queue = open_queue();
            queue.key = QueueKey::new(format!("src-{src}"), "dst-1", "rs-1");
            queue.state = state;
            store.insert_queue(&queue).await.unwrap();
        }
        let resumable = store.load_resumable().await.unwrap();
        assert_eq!(resumable.len(), 4);
        assert!(resumable.iter().all(|q| !q.state.is_terminal()));
    }
}
