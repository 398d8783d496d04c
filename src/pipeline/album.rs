//! Album buffer — folds messages sharing a `group_id` into one logical
//! message.
//!
//! Members accumulate per (source, group) until no new member has arrived
//! for the grace window; the engine's flush task then emits a single merged
//! raw message (first non-empty caption, media in arrival order) back into
//! the transformer. The buffer is transient and never persisted: a crash
//! loses at most one in-flight album, which the source redelivers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::pipeline::types::RawMessage;

struct AlbumEntry {
    members: Vec<RawMessage>,
    last_arrival: DateTime<Utc>,
}

/// Transient buffer of partial albums, keyed by (source, group).
pub struct AlbumBuffer {
    grace: Duration,
    entries: Mutex<HashMap<(String, String), AlbumEntry>>,
}

impl AlbumBuffer {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one album member into the buffer. The grace window re-arms on
    /// every arrival, so a slow album is not cut short mid-delivery.
    ///
    /// Messages without a `group_id` do not belong here; they are passed to
    /// the transformer directly by the engine.
    pub async fn push(&self, raw: RawMessage) {
        let Some(group_id) = raw.group_id.clone() else {
            debug!(message_id = %raw.id, "push called without group_id; ignoring");
            return;
        };
        let key = (raw.source_id.clone(), group_id);
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key).or_insert_with(|| AlbumEntry {
            members: Vec::new(),
            last_arrival: Utc::now(),
        });
        entry.last_arrival = Utc::now();
        entry.members.push(raw);
    }

    /// Flush every album whose grace window has elapsed at `now`, merging
    /// each into a single raw message.
    pub async fn flush_expired(&self, now: DateTime<Utc>) -> Vec<RawMessage> {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        let mut entries = self.entries.lock().await;

        let expired: Vec<(String, String)> = entries
            .iter()
            .filter(|(_, e)| now.signed_duration_since(e.last_arrival) >= grace)
            .map(|(k, _)| k.clone())
            .collect();

        let mut merged = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(entry) = entries.remove(&key) {
                debug!(
                    source_id = %key.0,
                    group_id = %key.1,
                    members = entry.members.len(),
                    "Album complete, flushing"
                );
                if let Some(message) = merge(entry.members) {
                    merged.push(message);
                }
            }
        }
        merged
    }

    /// Flush everything regardless of age — explicit end marker / shutdown.
    pub async fn flush_all(&self) -> Vec<RawMessage> {
        let mut entries = self.entries.lock().await;
        entries
            .drain()
            .filter_map(|(_, entry)| merge(entry.members))
            .collect()
    }

    /// Number of albums currently buffered.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Merge album members into one logical message: the first non-empty caption
/// becomes the text, media refs concatenate in arrival order, and the group
/// marker is cleared so the result flows straight through the transformer.
fn merge(members: Vec<RawMessage>) -> Option<RawMessage> {
    let mut iter = members.into_iter();
    let mut first = iter.next()?;

    for member in iter {
        if first.text.is_empty() && !member.text.is_empty() {
            first.text = member.text;
        }
        first.media_refs.extend(member.media_refs);
    }
    first.group_id = None;
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::MediaRef;

    fn member(id: &str, text: &str, media: &str) -> RawMessage {
        let mut raw = RawMessage::text(id, "src-a", text);
        raw.group_id = Some("G".into());
        raw.media_refs.push(MediaRef::new(media));
        raw
    }

    #[tokio::test]
    async fn merges_three_members_into_one() {
        let buffer = AlbumBuffer::new(Duration::from_secs(2));
        buffer.push(member("m1", "", "photo-1")).await;
        buffer.push(member("m2", "Підпис альбому", "photo-2")).await;
        buffer.push(member("m3", "", "photo-3")).await;
        assert_eq!(buffer.len().await, 1);

        let flushed = buffer
            .flush_expired(Utc::now() + chrono::Duration::seconds(3))
            .await;
        assert_eq!(flushed.len(), 1);

        let album = &flushed[0];
        assert_eq!(album.text, "Підпис альбому");
        assert_eq!(album.media_refs.len(), 3);
        assert_eq!(album.media_refs[0], MediaRef::new("photo-1"));
        assert_eq!(album.media_refs[2], MediaRef::new("photo-3"));
        assert!(album.group_id.is_none());
        assert_eq!(buffer.len().await, 0);
    }

    #[tokio::test]
    async fn young_albums_are_not_flushed() {
        let buffer = AlbumBuffer::new(Duration::from_secs(2));
        buffer.push(member("m1", "caption", "photo-1")).await;

        let flushed = buffer.flush_expired(Utc::now()).await;
        assert!(flushed.is_empty());
        assert_eq!(buffer.len().await, 1);
    }

    #[tokio::test]
    async fn first_non_empty_caption_wins() {
        let buffer = AlbumBuffer::new(Duration::from_secs(0));
        buffer.push(member("m1", "перший", "photo-1")).await;
        buffer.push(member("m2", "другий", "photo-2")).await;

        let flushed = buffer
            .flush_expired(Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(flushed[0].text, "перший");
    }

    #[tokio::test]
    async fn groups_are_isolated_per_source_and_group() {
        let buffer = AlbumBuffer::new(Duration::from_secs(0));
        buffer.push(member("m1", "a", "photo-1")).await;

        let mut other = member("m2", "b", "photo-2");
        other.group_id = Some("H".into());
        buffer.push(other).await;

        let mut other_source = member("m3", "c", "photo-3");
        other_source.source_id = "src-b".into();
        buffer.push(other_source).await;

        assert_eq!(buffer.len().await, 3);
    }

    #[tokio::test]
    async fn flush_all_drains_everything() {
        let buffer = AlbumBuffer::new(Duration::from_secs(3600));
        buffer.push(member("m1", "a", "photo-1")).await;
        let flushed = buffer.flush_all().await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(buffer.len().await, 0);
    }

    #[tokio::test]
    async fn message_without_group_is_ignored() {
        let buffer = AlbumBuffer::new(Duration::from_secs(0));
        buffer.push(RawMessage::text("m1", "src-a", "no group")).await;
        assert_eq!(buffer.len().await, 0);
    }
}
