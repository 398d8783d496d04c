//! Relay engine — routes raw messages through the transformation pipeline
//! into queues, folds albums, and recovers in-flight work at boot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::pipeline::album::AlbumBuffer;
use crate::pipeline::language::LanguageTable;
use crate::pipeline::transformer::Transformer;
use crate::pipeline::types::RawMessage;
use crate::queue::manager::QueueManager;
use crate::queue::model::{QueueKey, QueueState};
use crate::rules::RuleProvider;

/// How long an album waits for further members before it is merged.
pub const DEFAULT_ALBUM_GRACE: Duration = Duration::from_secs(2);

/// How often buffered albums are checked for expiry.
pub const ALBUM_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub struct RelayEngine {
    transformer: Transformer,
    rules: Arc<dyn RuleProvider>,
    manager: Arc<QueueManager>,
    dispatcher: Arc<Dispatcher>,
    albums: AlbumBuffer,
}

impl RelayEngine {
    pub fn new(
        rules: Arc<dyn RuleProvider>,
        manager: Arc<QueueManager>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            transformer: Transformer::new(LanguageTable::cyrillic_default()),
            rules,
            manager,
            dispatcher,
            albums: AlbumBuffer::new(DEFAULT_ALBUM_GRACE),
        }
    }

    pub fn with_album_grace(mut self, grace: Duration) -> Self {
        self.albums = AlbumBuffer::new(grace);
        self
    }

    pub fn with_language_table(mut self, table: LanguageTable) -> Self {
        self.transformer = Transformer::new(table);
        self
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Entry point for every raw message from an ingestion source.
    ///
    /// Album members are buffered until their group goes quiet; everything
    /// else flows straight through transform-and-enqueue.
    pub async fn on_message(&self, raw: RawMessage) -> Result<()> {
        if raw.group_id.is_some() {
            self.albums.push(raw).await;
            return Ok(());
        }
        self.route_and_enqueue(raw).await
    }

    /// Merge and enqueue every album whose grace window elapsed at `now`.
    pub async fn flush_albums(&self, now: DateTime<Utc>) -> Result<()> {
        for merged in self.albums.flush_expired(now).await {
            self.route_and_enqueue(merged).await?;
        }
        Ok(())
    }

    /// Drain the album buffer unconditionally (shutdown path).
    pub async fn flush_albums_now(&self) -> Result<()> {
        for merged in self.albums.flush_all().await {
            self.route_and_enqueue(merged).await?;
        }
        Ok(())
    }

    /// Resume persisted work after a restart.
    ///
    /// Open queues keep accumulating and close on their original window.
    /// Closed and partially-failed queues are picked up by the next
    /// dispatch sweep. Queues caught mid-`Sending` still hold their claim,
    /// so they are drained directly without re-claiming.
    pub async fn recover(&self) -> Result<()> {
        let queues = self.manager.store().load_resumable().await?;
        if queues.is_empty() {
            return Ok(());
        }
        info!(count = queues.len(), "Resuming persisted queues");

        for queue in queues {
            match queue.state {
                QueueState::Sending => {
                    info!(queue_id = %queue.id, "Resuming interrupted dispatch");
                    if let Err(e) = self.dispatcher.dispatch_queue(queue.id).await {
                        error!(queue_id = %queue.id, error = %e, "Dispatch resume failed");
                    }
                }
                state => {
                    debug!(queue_id = %queue.id, state = %state, "Queue resumed as-is");
                }
            }
        }
        Ok(())
    }

    async fn route_and_enqueue(&self, raw: RawMessage) -> Result<()> {
        let routes = self.rules.routes_for(&raw.source_id);
        if routes.is_empty() {
            debug!(source_id = %raw.source_id, "No routes for source; message ignored");
            return Ok(());
        }

        for route in routes {
            let Some(message) = self.transformer.transform(&raw, &route.rule_set) else {
                debug!(
                    source_id = %raw.source_id,
                    destination_id = %route.destination_id,
                    "Message dropped by filter"
                );
                continue;
            };
            let key = QueueKey::new(
                raw.source_id.clone(),
                route.destination_id.clone(),
                route.rule_set.id.clone(),
            );
            self.manager
                .enqueue(key, route.rule_set.close_interval, &message)
                .await?;
        }
        Ok(())
    }
}

/// Spawn the periodic album flush loop.
pub fn spawn_album_flush_loop(
    engine: Arc<RelayEngine>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if let Err(e) = engine.flush_albums(Utc::now()).await {
                error!(error = %e, "Album flush failed");
            }
        }
    })
}
