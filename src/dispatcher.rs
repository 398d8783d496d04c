//! Queue dispatcher — drains a claimed queue through the transport.
//!
//! The caller owns the claim: a queue handed to `dispatch_queue` must
//! already be in `Sending`. Messages go out in sequence order with a
//! randomized pause between consecutive sends. Per-message results are
//! persisted as they land, so a crash mid-dispatch resumes with only the
//! unsent remainder.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{SendError, StoreError};
use crate::queue::model::{MessageStatus, Queue, QueueState};
use crate::store::traits::QueueStore;
use crate::transport::Transport;

/// Default pause between consecutive sends: 5–15 seconds.
pub const DEFAULT_PACING_SECS: RangeInclusive<u64> = 5..=15;

/// Dispatch attempts per queue before it is marked failed for good.
pub const DEFAULT_MAX_DISPATCH_ATTEMPTS: u32 = 3;

pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    pacing: RangeInclusive<u64>,
    max_dispatch_attempts: u32,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn QueueStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            pacing: DEFAULT_PACING_SECS,
            max_dispatch_attempts: DEFAULT_MAX_DISPATCH_ATTEMPTS,
        }
    }

    /// Override the inter-send pacing range, in seconds. Tests use `0..=0`.
    pub fn with_pacing(mut self, pacing: RangeInclusive<u64>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_dispatch_attempts = attempts.max(1);
        self
    }

    /// Drain a queue already claimed into `Sending`. Sends every message
    /// without a `Sent` result, then settles the queue's final state:
    /// `Sent`, `FailedPartial` (retryable), or `Failed` (permanent error
    /// or attempt bound spent).
    pub async fn dispatch_queue(&self, queue_id: Uuid) -> Result<(), StoreError> {
        let attempt = self.store.record_dispatch_attempt(queue_id).await?;
        let queue = self
            .store
            .get_queue(queue_id)
            .await?
            .ok_or(StoreError::QueueNotFound(queue_id))?;

        info!(
            queue_id = %queue_id,
            destination_id = %queue.key.destination_id,
            attempt,
            messages = queue.messages.len(),
            "Dispatching queue"
        );

        let mut permanent_failure = false;
        let mut first = true;
        for queued in queue
            .messages
            .iter()
            .filter(|m| m.status != MessageStatus::Sent)
        {
            if !first {
                tokio::time::sleep(self.pacing_delay()).await;
            }
            first = false;

            match self
                .transport
                .send(&queue.key.destination_id, &queued.message)
                .await
            {
                Ok(()) => {
                    self.store
                        .save_message_result(queue_id, queued.message.id, MessageStatus::Sent)
                        .await?;
                }
                Err(err) => {
                    warn!(
                        queue_id = %queue_id,
                        message_id = %queued.message.id,
                        sequence_no = queued.sequence_no,
                        error = %err,
                        "Send failed"
                    );
                    self.store
                        .save_message_result(queue_id, queued.message.id, MessageStatus::Failed)
                        .await?;
                    if matches!(err, SendError::Permanent { .. }) {
                        permanent_failure = true;
                        break;
                    }
                }
            }
        }

        self.settle(queue_id, attempt, permanent_failure).await
    }

    async fn settle(
        &self,
        queue_id: Uuid,
        attempt: u32,
        permanent_failure: bool,
    ) -> Result<(), StoreError> {
        let queue = self
            .store
            .get_queue(queue_id)
            .await?
            .ok_or(StoreError::QueueNotFound(queue_id))?;

        let next = if permanent_failure {
            QueueState::Failed
        } else {
            match queue.outcome() {
                QueueState::Sent => QueueState::Sent,
                _ if attempt >= self.max_dispatch_attempts => QueueState::Failed,
                _ => QueueState::FailedPartial,
            }
        };

        // The dispatcher holds the Sending claim; a lost CAS here means an
        // operator intervened and we leave the queue alone.
        let transitioned = self
            .store
            .compare_and_set_state(queue_id, QueueState::Sending, next)
            .await?;
        if !transitioned {
            warn!(queue_id = %queue_id, "Queue left Sending state mid-dispatch; not settled");
            return Ok(());
        }

        match next {
            QueueState::Sent => {
                info!(queue_id = %queue_id, "Queue dispatched");
            }
            QueueState::FailedPartial => {
                let failed = queue.failed_messages().len();
                warn!(
                    queue_id = %queue_id,
                    failed,
                    attempt,
                    "Queue partially dispatched; failed messages will be retried"
                );
            }
            QueueState::Failed => {
                report_failure(&queue, attempt, permanent_failure);
            }
            _ => {}
        }
        Ok(())
    }

    fn pacing_delay(&self) -> Duration {
        let secs = rand::thread_rng().gen_range(self.pacing.clone());
        Duration::from_secs(secs)
    }
}

/// Operator-facing report for a queue that is done failing.
fn report_failure(queue: &Queue, attempt: u32, permanent: bool) {
    let report = queue.report();
    let failed: Vec<u32> = report
        .messages
        .iter()
        .filter(|m| m.status == MessageStatus::Failed)
        .map(|m| m.sequence_no)
        .collect();
    error!(
        queue_id = %queue.id,
        source_id = %queue.key.source_id,
        destination_id = %queue.key.destination_id,
        attempt,
        permanent,
        failed_sequences = ?failed,
        total = report.messages.len(),
        "Queue failed terminally"
    );
}
