//! Queue data model — the batching unit between transformation and dispatch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::types::TransformedMessage;

/// Identity of a batch: one accumulating queue exists per key at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub source_id: String,
    pub destination_id: String,
    pub rule_set_id: String,
}

impl QueueKey {
    pub fn new(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        rule_set_id: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            rule_set_id: rule_set_id.into(),
        }
    }
}

/// Queue lifecycle. `Open → Closed → Sending → Sent`, with
/// `Sending → FailedPartial` on mixed results, `FailedPartial → Sending`
/// for bounded retries, and `Failed` once retries are exhausted or a
/// permanent send failure occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Open,
    Closed,
    Sending,
    Sent,
    FailedPartial,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Open => "open",
            QueueState::Closed => "closed",
            QueueState::Sending => "sending",
            QueueState::Sent => "sent",
            QueueState::FailedPartial => "failed_partial",
            QueueState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "open" => QueueState::Open,
            "closed" => QueueState::Closed,
            "sending" => QueueState::Sending,
            "sent" => QueueState::Sent,
            "failed_partial" => QueueState::FailedPartial,
            "failed" => QueueState::Failed,
            _ => return None,
        })
    }

    /// Terminal states are eligible for retention pruning; `FailedPartial`
    /// is terminal only once the retry bound is spent, so it stays live.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueState::Sent | QueueState::Failed)
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message dispatch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => MessageStatus::Pending,
            "sent" => MessageStatus::Sent,
            "failed" => MessageStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }
}

/// A transformed message inside a queue, with its dispatch bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message: TransformedMessage,
    /// Position within the queue; dispatch preserves this order.
    pub sequence_no: u32,
    pub status: MessageStatus,
}

/// An accumulating batch of transformed messages awaiting scheduled dispatch.
#[derive(Debug, Clone)]
pub struct Queue {
    pub id: Uuid,
    pub key: QueueKey,
    pub state: QueueState,
    /// Fixed at open; the close window runs from here, not from the last add.
    pub opened_at: DateTime<Utc>,
    /// Captured from the rule set at open time so sweeps recompute state
    /// purely from persisted data.
    pub close_interval: Duration,
    /// Number of dispatch sweeps that have claimed this queue.
    pub dispatch_attempts: u32,
    /// Bumped on every persisted change; drives retention pruning.
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<QueuedMessage>,
}

impl Queue {
    /// Open a new queue for a key. Called on first message arrival.
    pub fn open(key: QueueKey, close_interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            state: QueueState::Open,
            opened_at: now,
            close_interval,
            dispatch_attempts: 0,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Wall-clock close check: never early, tolerant of sweep jitter.
    pub fn is_due_for_close(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.opened_at);
        let interval = chrono::Duration::from_std(self.close_interval)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        elapsed >= interval
    }

    /// Messages still awaiting a terminal status, in sequence order.
    pub fn pending_messages(&self) -> Vec<&QueuedMessage> {
        self.messages
            .iter()
            .filter(|m| !m.status.is_terminal())
            .collect()
    }

    /// Messages whose last attempt failed, in sequence order (retry subset).
    pub fn failed_messages(&self) -> Vec<&QueuedMessage> {
        self.messages
            .iter()
            .filter(|m| m.status == MessageStatus::Failed)
            .collect()
    }

    pub fn all_results_terminal(&self) -> bool {
        self.messages.iter().all(|m| m.status.is_terminal())
    }

    /// Batch outcome once every message has a terminal status.
    pub fn outcome(&self) -> QueueState {
        if self.messages.iter().all(|m| m.status == MessageStatus::Sent) {
            QueueState::Sent
        } else {
            QueueState::FailedPartial
        }
    }

    /// Operator-facing per-message breakdown.
    pub fn report(&self) -> QueueReport {
        QueueReport {
            queue_id: self.id,
            key: self.key.clone(),
            state: self.state,
            dispatch_attempts: self.dispatch_attempts,
            messages: self
                .messages
                .iter()
                .map(|m| MessageReport {
                    message_id: m.message.id,
                    sequence_no: m.sequence_no,
                    status: m.status,
                })
                .collect(),
        }
    }
}

/// Per-message breakdown of a queue, for failure reporting and queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueReport {
    pub queue_id: Uuid,
    pub key: QueueKey,
    pub state: QueueState,
    pub dispatch_attempts: u32,
    pub messages: Vec<MessageReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReport {
    pub message_id: Uuid,
    pub sequence_no: u32,
    pub status: MessageStatus,
}
