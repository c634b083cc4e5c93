//! # Sync Server
//!
//! Runs the outbox sync engine against PostgreSQL with the HTTP trigger and,
//! when enabled, the periodic scheduler.
//!
//! ```text
//! sync-server [CONFIG_FILE]
//! ```
//!
//! The config file may also be given through `SYNC_CONFIG_FILE`.

use anyhow::Context;
use outbox_sync::config::SyncConfig;
use outbox_sync::database::{DatabaseConnection, DatabaseMigrations};
use outbox_sync::engine::SyncEngine;
use outbox_sync::logging::init_structured_logging;
use outbox_sync::remote::HttpRemoteClient;
use outbox_sync::scheduler::Scheduler;
use outbox_sync::store::PgQueueStore;
use outbox_sync::web::{create_router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SYNC_CONFIG_FILE").ok())
        .map(PathBuf::from);

    let config = SyncConfig::load(config_path.as_deref()).context("loading configuration")?;
    init_structured_logging(&config.environment, &config.logging);

    let database = DatabaseConnection::new(&config.database)
        .await
        .context("connecting to the queue database")?;
    DatabaseMigrations::run_all(database.pool())
        .await
        .context("running queue migrations")?;

    let remote = HttpRemoteClient::new(&config.remote).context("building remote client")?;
    let engine = Arc::new(SyncEngine::new(
        Arc::new(PgQueueStore::new(database.pool().clone())),
        Arc::new(remote),
        config.mapping.registry(),
        &config,
    ));

    let scheduler = config.scheduler.enabled.then(|| {
        let scheduler = Scheduler::new(engine.clone(), config.scheduler.interval());
        let shutdown = scheduler.shutdown_handle();
        (scheduler.spawn(), shutdown)
    });

    let state = AppState::new(engine, config.environment.clone())
        .with_database_pool(database.pool().clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    info!(bind_address = %config.server.bind_address, "Sync server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("serving HTTP")?;

    if let Some((handle, shutdown)) = scheduler {
        shutdown.notify_one();
        let _ = handle.await;
    }
    database.close().await;
    info!("Sync server stopped");
    Ok(())
}
