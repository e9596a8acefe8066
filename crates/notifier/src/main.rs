//! Quill notifier binary entrypoint.
//!
//! Runs the outbox dispatcher and the email delivery worker until Ctrl+C or
//! a fatal dispatcher error.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use quill_common::config::AppConfig;
use quill_common::db;
use quill_notifier::handler::EmailSendHandler;
use quill_notifier::queue::EmailQueue;
use quill_notifier::transport;
use quill_notifier::worker::EmailSendWorker;
use quill_outbox::{HandlerRegistry, OutboxDispatcher, OutboxStore, PgOutboxStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("quill_notifier=info,quill_outbox=info,quill_engine=info")
        }))
        .json()
        .init();

    tracing::info!("Quill notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool));

    // Nothing else runs yet, so any row still marked processing was orphaned
    // by the previous process.
    store.recover_in_flight().await?;

    let queue = Arc::new(EmailQueue::new());
    let registry =
        HandlerRegistry::new().with(Arc::new(EmailSendHandler::new(queue.clone())))?;
    let dispatcher = OutboxDispatcher::new(
        store.clone(),
        registry,
        config.outbox_batch_size,
        Duration::from_millis(config.outbox_poll_interval_ms),
    );
    let worker = EmailSendWorker::new(queue, transport::from_config(&config)).with_outbox(store);

    let shutdown = CancellationToken::new();

    let worker_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });
    let mut dispatcher_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { dispatcher.run(shutdown).await }
    });

    let finished_early = tokio::select! {
        joined = &mut dispatcher_task => Some(joined),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            None
        }
    };

    shutdown.cancel();

    let dispatch_result = match finished_early {
        Some(joined) => joined?,
        None => dispatcher_task.await?,
    };
    worker_task.await?;

    if let Err(e) = dispatch_result {
        tracing::error!(error = %e, "Outbox dispatcher exited with error");
        return Err(e.into());
    }

    tracing::info!("Quill notifier stopped.");
    Ok(())
}
