use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use autoforward::channels::{InboundEvent, TelegramChannel};
use autoforward::config::ForwarderConfig;
use autoforward::pipeline::types::OutboundSender;
use autoforward::pipeline::{AlbumDelivery, ContentTransformer, Dispatcher, ForwardEngine, TaskMatcher};
use autoforward::store::{LibSqlBackend, TaskStore};
use autoforward::tasks::seed::seed_from_file;
use autoforward::tasks::{CommandHandler, CommandParser};

/// How long to wait for in-flight deliveries on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real environment variables win.
    dotenvy::dotenv().ok();

    let config = ForwarderConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("📨 autoforward v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Albums: {:?} window {}ms (max {}ms)",
        config.album.policy,
        config.album.window.as_millis(),
        config.album.max_window.as_millis()
    );
    eprintln!(
        "   Admins: {}",
        if config.admin_ids.is_empty() {
            "none (commands disabled)".to_string()
        } else {
            config
                .admin_ids
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let store: Arc<dyn TaskStore> = db.clone();

    if let Some(seed) = &config.seed_file {
        let written = seed_from_file(store.as_ref(), seed)
            .await
            .with_context(|| format!("failed to seed tasks from {}", seed.display()))?;
        eprintln!("   Seeded: {written} task(s) from {}", seed.display());
    }

    // ── Telegram ─────────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramChannel::new(
        config.bot_token.clone(),
        config.admin_ids.clone(),
    ));
    telegram
        .health_check()
        .await
        .context("Telegram bot token rejected")?;

    // ── Pipeline ─────────────────────────────────────────────────────────
    let matcher = Arc::new(if config.task_cache {
        TaskMatcher::with_cache(store.clone())
    } else {
        TaskMatcher::new(store.clone())
    });
    let transformer = Arc::new(ContentTransformer::with_defaults()?);
    let dispatcher = Arc::new(Dispatcher::new(telegram.clone(), telegram.clone(), db.clone()));

    let (engine, flush_rx) = ForwardEngine::new(
        matcher.clone(),
        dispatcher.clone(),
        transformer.clone(),
        config.album,
    );
    let album_consumer = AlbumDelivery::new(dispatcher, transformer).spawn(flush_rx);

    let commands = Arc::new(CommandHandler::new(
        store,
        matcher,
        telegram.clone(),
        config.batch_pacing,
    ));

    // ── Event loop ───────────────────────────────────────────────────────
    let mut events = telegram.start();
    eprintln!("   Listening. Ctrl-C to stop.\n");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    tracing::warn!("Inbound stream ended");
                    break;
                };
                match event {
                    InboundEvent::Message(message) => {
                        engine.handle(message).await;
                    }
                    InboundEvent::Command { chat_id, sender_id, text } => {
                        let Some(command) = CommandParser::parse(&text) else {
                            continue;
                        };
                        // Batches can run for minutes; keep the engine moving.
                        let commands = Arc::clone(&commands);
                        let telegram = Arc::clone(&telegram);
                        tokio::spawn(async move {
                            let reply = commands.execute(sender_id, command).await;
                            if let Err(e) = telegram.send_text(chat_id, &reply).await {
                                tracing::warn!(chat_id, error = %e, "Failed to send command reply");
                            }
                        });
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────
    let drained = engine.drain_albums().await;
    tracing::info!(albums = drained, "Pending albums flushed");
    // Dropping the engine closes the flush channel and every delayed lane;
    // each consumer exits once its queue is empty.
    let mut pending = engine.shutdown();
    pending.push(album_consumer);
    if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(pending))
        .await
        .is_err()
    {
        tracing::warn!("Deliveries still running at shutdown");
    }

    Ok(())
}

/// Stderr logging, plus a daily-rolling file when a log directory is set.
fn init_tracing(config: &ForwarderConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "autoforward.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter()).with(stderr).init();
            None
        }
    }
}
