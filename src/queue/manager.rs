//! Queue manager — append-or-open ingestion and the close sweep.
//!
//! Ingestion is serialized through one async mutex so two concurrent
//! messages for the same key cannot both open a queue. Closing goes through
//! the store's compare-and-set, so a close racing a dispatch claim resolves
//! to exactly one winner.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::TransformedMessage;
use crate::queue::model::{Queue, QueueKey, QueueState};
use crate::store::traits::QueueStore;

pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    ingest: Mutex<()>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            ingest: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Append a transformed message to the open queue for `key`, opening a
    /// fresh one when none is accumulating. Returns the owning queue's id.
    ///
    /// The close interval is captured from the rule set here, at open time;
    /// later rule changes do not move an already-open queue's window.
    /// A message whose text equals the last queued message's is a repost
    /// and is dropped without appending.
    pub async fn enqueue(
        &self,
        key: QueueKey,
        close_interval: Duration,
        message: &TransformedMessage,
    ) -> Result<Uuid, StoreError> {
        let _guard = self.ingest.lock().await;

        loop {
            let queue_id = match self.store.find_open_queue(&key).await? {
                Some(queue) => {
                    if queue
                        .messages
                        .last()
                        .is_some_and(|last| last.message.text == message.text)
                    {
                        debug!(queue_id = %queue.id, "Duplicate of last queued message; skipped");
                        return Ok(queue.id);
                    }
                    queue.id
                }
                None => {
                    let queue = Queue::open(key.clone(), close_interval, Utc::now());
                    self.store.insert_queue(&queue).await?;
                    info!(
                        queue_id = %queue.id,
                        source_id = %key.source_id,
                        destination_id = %key.destination_id,
                        "Opened queue"
                    );
                    queue.id
                }
            };

            match self.store.append_message(queue_id, message).await? {
                Some(sequence_no) => {
                    debug!(queue_id = %queue_id, sequence_no, "Message enqueued");
                    return Ok(queue_id);
                }
                // The queue left Open between lookup and append (the close
                // sweep won the race); resolve the key again.
                None => continue,
            }
        }
    }

    /// Close every open queue whose window has elapsed. Returns the ids of
    /// queues this sweep transitioned; queues another actor already moved
    /// are skipped silently.
    pub async fn close_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut closed = Vec::new();
        for queue in self.store.load_queues(QueueState::Open).await? {
            if !queue.is_due_for_close(now) {
                continue;
            }
            if self
                .store
                .compare_and_set_state(queue.id, QueueState::Open, QueueState::Closed)
                .await?
            {
                info!(
                    queue_id = %queue.id,
                    messages = queue.messages.len(),
                    "Queue closed for dispatch"
                );
                closed.push(queue.id);
            }
        }
        Ok(closed)
    }

    /// Force-close a queue regardless of its window (operator action and
    /// shutdown). Idempotent: returns `false` when the queue already left
    /// the `Open` state.
    pub async fn close_now(&self, queue_id: Uuid) -> Result<bool, StoreError> {
        self.store
            .compare_and_set_state(queue_id, QueueState::Open, QueueState::Closed)
            .await
    }
}
