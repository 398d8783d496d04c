//! Queue store trait — the single async persistence interface the core
//! consumes.
//!
//! `compare_and_set_state` is the only synchronization primitive the engine
//! relies on: every queue state transition is serialized through it. A
//! backend that cannot perform the update must return an error, never
//! pretend success — sweeps fail closed on store errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::TransformedMessage;
use crate::queue::model::{MessageStatus, Queue, QueueKey, QueueReport, QueueState};

/// Durable persistence of queue and message state, surviving restarts.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a newly opened queue (including any initial messages).
    async fn insert_queue(&self, queue: &Queue) -> Result<(), StoreError>;

    /// Append a message to a queue, provided it is still `Open`. Returns
    /// the assigned sequence number, or `None` when the queue left the
    /// `Open` state since it was looked up — the caller must re-resolve
    /// the key to a fresh queue.
    async fn append_message(
        &self,
        queue_id: Uuid,
        message: &TransformedMessage,
    ) -> Result<Option<u32>, StoreError>;

    /// Fetch a queue with its messages.
    async fn get_queue(&self, queue_id: Uuid) -> Result<Option<Queue>, StoreError>;

    /// The accumulating (`Open`) queue for a key, if one exists. At most
    /// one exists per key at a time.
    async fn find_open_queue(&self, key: &QueueKey) -> Result<Option<Queue>, StoreError>;

    /// All queues currently in `state`, messages included.
    async fn load_queues(&self, state: QueueState) -> Result<Vec<Queue>, StoreError>;

    /// All non-terminal queues — boot recovery reloads these and resumes
    /// sweeps as if uninterrupted.
    async fn load_resumable(&self) -> Result<Vec<Queue>, StoreError>;

    /// Atomically transition `expected → next`. Returns `false` when the
    /// queue is not in `expected` state (e.g. another claimant won).
    async fn compare_and_set_state(
        &self,
        queue_id: Uuid,
        expected: QueueState,
        next: QueueState,
    ) -> Result<bool, StoreError>;

    /// Record a per-message dispatch result.
    async fn save_message_result(
        &self,
        queue_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
    ) -> Result<(), StoreError>;

    /// Increment and return the queue's dispatch attempt counter.
    async fn record_dispatch_attempt(&self, queue_id: Uuid) -> Result<u32, StoreError>;

    /// Delete terminal queues not touched since `older_than`. Returns the
    /// number deleted. Non-terminal queues are never pruned.
    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Per-message breakdown for operator queries and failure reports.
    async fn queue_report(&self, queue_id: Uuid) -> Result<Option<QueueReport>, StoreError> {
        Ok(self.get_queue(queue_id).await?.map(|q| q.report()))
    }
}
