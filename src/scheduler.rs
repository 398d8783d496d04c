//! Background sweeps: closing due queues, dispatching closed ones, and
//! pruning terminal history.
//!
//! Each loop is a plain interval task; the cycle functions are free
//! functions so tests can drive a single cycle without timers. Sweep
//! errors are logged and the loop keeps running — a flaky store must not
//! kill the schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::queue::manager::QueueManager;
use crate::queue::model::{Queue, QueueState};
use crate::store::traits::QueueStore;

/// How often the close sweep re-checks open queues.
pub const CLOSE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How often the dispatch sweep looks for closed queues: 45 minutes, same
/// as the default close window. Dev builds shorten this.
pub const DISPATCH_SWEEP_INTERVAL: Duration = Duration::from_secs(2700);

/// Terminal queues older than this get pruned.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Spawn the close sweep loop.
pub fn spawn_close_loop(
    manager: Arc<QueueManager>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = sweep_interval.as_secs(), "Close sweep started");
        let mut tick = tokio::time::interval(sweep_interval);
        loop {
            tick.tick().await;
            run_close_cycle(&manager).await;
        }
    })
}

/// Spawn the dispatch sweep loop.
pub fn spawn_dispatch_loop(
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<Dispatcher>,
    sweep_interval: Duration,
    retention: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = sweep_interval.as_secs(), "Dispatch sweep started");
        let mut tick = tokio::time::interval(sweep_interval);
        loop {
            tick.tick().await;
            run_dispatch_cycle(&store, &dispatcher, retention).await;
        }
    })
}

/// One close cycle: transition every open queue whose window elapsed.
pub async fn run_close_cycle(manager: &QueueManager) {
    match manager.close_due(Utc::now()).await {
        Ok(closed) if !closed.is_empty() => {
            info!(count = closed.len(), "Close sweep transitioned queues");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Close sweep failed"),
    }
}

/// One dispatch cycle: claim and drain closed queues, then partial
/// failures recorded by earlier sweeps, then prune old terminal history.
///
/// The retry set is snapshotted before the closed queues drain, so a queue
/// that fails partially in this cycle waits for the following one.
pub async fn run_dispatch_cycle(
    store: &Arc<dyn QueueStore>,
    dispatcher: &Dispatcher,
    retention: Duration,
) {
    let retryable = load_for_dispatch(store, QueueState::FailedPartial).await;
    let closed = load_for_dispatch(store, QueueState::Closed).await;

    claim_and_dispatch(store, dispatcher, closed, QueueState::Closed).await;
    claim_and_dispatch(store, dispatcher, retryable, QueueState::FailedPartial).await;

    let cutoff = Utc::now()
        - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));
    match store.prune_terminal(cutoff).await {
        Ok(0) => {}
        Ok(pruned) => info!(pruned, "Pruned terminal queues"),
        Err(e) => error!(error = %e, "Retention prune failed"),
    }
}

async fn load_for_dispatch(store: &Arc<dyn QueueStore>, state: QueueState) -> Vec<Queue> {
    match store.load_queues(state).await {
        Ok(queues) => queues,
        Err(e) => {
            error!(error = %e, state = %state, "Dispatch sweep load failed");
            Vec::new()
        }
    }
}

async fn claim_and_dispatch(
    store: &Arc<dyn QueueStore>,
    dispatcher: &Dispatcher,
    queues: Vec<Queue>,
    from: QueueState,
) {
    for queue in queues {
        let claimed = match store
            .compare_and_set_state(queue.id, from, QueueState::Sending)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(queue_id = %queue.id, error = %e, "Dispatch claim failed");
                continue;
            }
        };
        // Lost claims mean another sweep got here first.
        if !claimed {
            continue;
        }
        if let Err(e) = dispatcher.dispatch_queue(queue.id).await {
            error!(queue_id = %queue.id, error = %e, "Dispatch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    use crate::error::SendError;
    use crate::pipeline::types::TransformedMessage;
    use crate::queue::model::{Queue, QueueKey};
    use crate::store::memory::MemoryStore;
    use crate::transport::{NullTransport, Transport};

    fn transformed(text: &str) -> TransformedMessage {
        TransformedMessage {
            id: Uuid::new_v4(),
            text: text.into(),
            media_refs: vec![],
            tags: vec![],
        }
    }

    /// Pops one scripted result per send; an empty script means success.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<(), SendError>>>,
    }

    impl ScriptedTransport {
        fn with_script(script: Vec<Result<(), SendError>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _destination_id: &str,
            _message: &TransformedMessage,
        ) -> Result<(), SendError> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() { Ok(()) } else { script.remove(0) }
        }
    }

    #[tokio::test]
    async fn dispatch_cycle_drains_closed_queues() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let transport = Arc::new(NullTransport::new());
        let dispatcher =
            Dispatcher::new(store.clone(), transport.clone()).with_pacing(0..=0);

        let queue = Queue::open(
            QueueKey::new("src-a", "dst-1", "rs-1"),
            Duration::from_secs(0),
            Utc::now(),
        );
        let id = queue.id;
        store.insert_queue(&queue).await.unwrap();
        store.append_message(id, &transformed("a")).await.unwrap();
        store.append_message(id, &transformed("b")).await.unwrap();
        store
            .compare_and_set_state(id, QueueState::Open, QueueState::Closed)
            .await
            .unwrap();

        run_dispatch_cycle(&store, &dispatcher, DEFAULT_RETENTION).await;

        let queue = store.get_queue(id).await.unwrap().unwrap();
        assert_eq!(queue.state, QueueState::Sent);
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn close_then_dispatch_cycles_move_a_queue_end_to_end() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let manager = QueueManager::new(store.clone());
        let transport = Arc::new(NullTransport::new());
        let dispatcher =
            Dispatcher::new(store.clone(), transport.clone()).with_pacing(0..=0);

        let id = manager
            .enqueue(
                QueueKey::new("src-a", "dst-1", "rs-1"),
                Duration::from_secs(0),
                &transformed("привіт"),
            )
            .await
            .unwrap();

        run_close_cycle(&manager).await;
        assert_eq!(
            store.get_queue(id).await.unwrap().unwrap().state,
            QueueState::Closed
        );

        run_dispatch_cycle(&store, &dispatcher, DEFAULT_RETENTION).await;
        assert_eq!(
            store.get_queue(id).await.unwrap().unwrap().state,
            QueueState::Sent
        );
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn partial_failure_is_not_retried_within_the_same_cycle() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Ok(()),
            Err(SendError::Transient {
                destination: "dst-1".into(),
                reason: "502".into(),
            }),
            Ok(()),
        ]));
        let dispatcher = Dispatcher::new(store.clone(), transport).with_pacing(0..=0);

        let queue = Queue::open(
            QueueKey::new("src-a", "dst-1", "rs-1"),
            Duration::from_secs(0),
            Utc::now(),
        );
        let id = queue.id;
        store.insert_queue(&queue).await.unwrap();
        for text in ["a", "b", "c"] {
            store.append_message(id, &transformed(text)).await.unwrap();
        }
        store
            .compare_and_set_state(id, QueueState::Open, QueueState::Closed)
            .await
            .unwrap();

        run_dispatch_cycle(&store, &dispatcher, DEFAULT_RETENTION).await;

        let loaded = store.get_queue(id).await.unwrap().unwrap();
        assert_eq!(loaded.state, QueueState::FailedPartial);
        assert_eq!(loaded.dispatch_attempts, 1);

        // The following cycle picks up the failed subset.
        run_dispatch_cycle(&store, &dispatcher, DEFAULT_RETENTION).await;
        let loaded = store.get_queue(id).await.unwrap().unwrap();
        assert_eq!(loaded.state, QueueState::Sent);
        assert_eq!(loaded.dispatch_attempts, 2);
    }

    #[tokio::test]
    async fn dispatch_cycle_prunes_old_terminal_queues() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let transport = Arc::new(NullTransport::new());
        let dispatcher = Dispatcher::new(store.clone(), transport).with_pacing(0..=0);

        let mut stale = Queue::open(
            QueueKey::new("src-a", "dst-1", "rs-1"),
            Duration::from_secs(0),
            Utc::now(),
        );
        stale.state = QueueState::Sent;
        stale.updated_at = Utc::now() - chrono::Duration::hours(48);
        store.insert_queue(&stale).await.unwrap();

        run_dispatch_cycle(&store, &dispatcher, DEFAULT_RETENTION).await;
        assert!(store.get_queue(stale.id).await.unwrap().is_none());
    }
}
