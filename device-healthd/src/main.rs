mod config;
mod dedup;
mod device_store;
mod health;
mod mqtt;
mod repository;
mod store;
mod api;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::dedup::EventDeduplicator;
use crate::device_store::DeviceStoreHandle;
use crate::health::checker::HttpHealthChecker;
use crate::health::use_case::DeviceHealthUseCase;
use crate::mqtt::RegistrationHandler;
use crate::repository::DeviceRepository;
use crate::store::db::DeviceDb;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("device_healthd=info"))
        )
        .init();

    tracing::info!("Starting device-healthd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/device-healthd/healthd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open SQLite database
    let db = DeviceDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let store = DeviceStoreHandle::spawn(db);
    let repository: Arc<dyn DeviceRepository> = Arc::new(store.clone());

    let checker = Arc::new(HttpHealthChecker::new(&config.health)?);
    let health = Arc::new(DeviceHealthUseCase::new(repository.clone(), checker, &config.health));
    tracing::info!(
        "Health checks limited to {} concurrent probes",
        health.max_concurrent()
    );

    let dedup = Arc::new(EventDeduplicator::new(Duration::from_secs(config.dedup.window_secs)));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn dedup cleanup task
    let cleanup_handle = tokio::spawn(crate::dedup::run_cleanup(
        dedup.clone(),
        Duration::from_secs(config.dedup.cleanup_interval_secs),
        cancel.clone(),
    ));

    // Spawn MQTT registration listener
    let handler = Arc::new(RegistrationHandler::new(
        repository.clone(),
        dedup.clone(),
        health.clone(),
    ));
    let mqtt_cancel = cancel.clone();
    let mqtt_config = config.mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_listener(mqtt_config, handler, mqtt_cancel).await {
            tracing::error!("MQTT listener error: {:#}", e);
        }
    });

    // Build API router
    let app_state = api::routes::AppState {
        repository: repository.clone(),
        dedup: dedup.clone(),
        health: health.clone(),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(cleanup_handle, mqtt_handle, server_handle);

    // Drain health checks that already hold a slot
    health.shutdown().await;

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown device store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
