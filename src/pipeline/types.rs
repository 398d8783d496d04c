//! Shared types for the message transformation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reference to a media attachment, opaque to the core.
///
/// The ingestion source produces these; the dispatch transport consumes them.
/// The pipeline only reorders and concatenates them (album merge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef(pub String);

impl MediaRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// A raw message as delivered by an ingestion source. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Source-native message id.
    pub id: String,
    /// The origin feed this message arrived from.
    pub source_id: String,
    /// Message text. May be empty for bare-media messages.
    pub text: String,
    /// Media attachments in arrival order.
    pub media_refs: Vec<MediaRef>,
    /// Album membership: messages sharing a `group_id` belong together.
    pub group_id: Option<String>,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Convenience constructor for a text-only message.
    pub fn text(id: impl Into<String>, source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            text: text.into(),
            media_refs: Vec::new(),
            group_id: None,
            received_at: Utc::now(),
        }
    }
}

/// Output of the transformation pipeline. Produced once, never mutated;
/// ownership passes to the queue that accumulates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformedMessage {
    /// Engine-assigned id, used to key per-message dispatch results.
    pub id: Uuid,
    /// Cleaned, price-adjusted text with the tag block appended.
    pub text: String,
    /// Media attachments, merged across album members where applicable.
    pub media_refs: Vec<MediaRef>,
    /// Deduplicated tags in first-seen order (brand tag last, if any).
    pub tags: Vec<String>,
}
