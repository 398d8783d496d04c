use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use feed_relay::config::{self, EngineConfig};
use feed_relay::dispatcher::Dispatcher;
use feed_relay::engine::{self, RelayEngine};
use feed_relay::queue::manager::QueueManager;
use feed_relay::scheduler;
use feed_relay::store::libsql::LibSqlStore;
use feed_relay::store::traits::QueueStore;
use feed_relay::transport::{BotApiTransport, NullTransport, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(config_path) = args.next() else {
        eprintln!("Usage: feed-relay CONFIG_PATH [TAG_RULES_PATH]");
        std::process::exit(2);
    };
    let tags_path = args.next();

    let _log_guard = init_tracing();

    let env_name = std::env::var("FEED_RELAY_ENV").unwrap_or_else(|_| "prod".to_string());
    let mut engine_config = EngineConfig::from_env()?;
    if env_name == "dev" {
        // Short cadence for local testing.
        engine_config.close_sweep_interval = Duration::from_secs(5);
        engine_config.dispatch_sweep_interval = Duration::from_secs(10);
        engine_config.pacing_secs = 0..=1;
    }

    eprintln!("📨 Feed Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Env: {}", env_name);
    eprintln!("   Config: {}", config_path);
    if let Some(ref tags) = tags_path {
        eprintln!("   Tags: {}", tags);
    }
    eprintln!("   Database: {}", engine_config.db_path.display());

    let provider = config::load_rule_provider(
        Path::new(&config_path),
        tags_path.as_deref().map(Path::new),
    )?;

    let store: Arc<dyn QueueStore> =
        Arc::new(LibSqlStore::new_local(&engine_config.db_path).await?);

    let transport: Arc<dyn Transport> = match std::env::var("FEED_RELAY_BOT_TOKEN") {
        Ok(token) => {
            eprintln!("   Transport: bot api");
            Arc::new(BotApiTransport::new(secrecy::SecretString::from(token)))
        }
        Err(_) => {
            eprintln!("   Transport: dry-run (FEED_RELAY_BOT_TOKEN not set)");
            Arc::new(NullTransport::new())
        }
    };

    let manager = Arc::new(QueueManager::new(store.clone()));
    let dispatcher = Arc::new(
        Dispatcher::new(store.clone(), transport)
            .with_pacing(engine_config.pacing_secs.clone())
            .with_max_attempts(engine_config.max_dispatch_attempts),
    );
    let relay = Arc::new(
        RelayEngine::new(Arc::new(provider), manager.clone(), dispatcher.clone())
            .with_album_grace(engine_config.album_grace),
    );

    relay.recover().await?;

    let _close_handle =
        scheduler::spawn_close_loop(manager.clone(), engine_config.close_sweep_interval);
    let _dispatch_handle = scheduler::spawn_dispatch_loop(
        store.clone(),
        dispatcher,
        engine_config.dispatch_sweep_interval,
        engine_config.retention,
    );
    let _album_handle =
        engine::spawn_album_flush_loop(relay.clone(), engine::ALBUM_FLUSH_INTERVAL);

    eprintln!("   Running. Ctrl-C to stop.\n");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down; flushing buffered albums");
    relay.flush_albums_now().await?;
    Ok(())
}

/// Console logging by default; rolling daily file when FEED_RELAY_LOG_DIR is
/// set. The guard must stay alive for the non-blocking writer to flush.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = std::env::var("FEED_RELAY_LOG").unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::EnvFilter::new(level)
        }
    };

    if let Ok(dir) = std::env::var("FEED_RELAY_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "feed-relay.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        None
    }
}
