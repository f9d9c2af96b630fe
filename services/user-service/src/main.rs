//! User service binary.

use anyhow::Context;
use listings_core::event::USER_CREATED;
use listings_core::event_bus::{DurableLog, StreamConfig};
use listings_postgres::{OutboxRelay, RelayConfig};
use listings_redpanda::RedpandaLog;
use listings_runtime::lifecycle::shutdown_signal;
use listings_runtime::metrics::MetricsRecorder;
use listings_runtime::{Publisher, shutdown_channel};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use user_service::config::Config;
use user_service::http::{AppState, router};
use user_service::PostgresUserStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(brokers = %config.log_brokers, "Starting user service");

    let metrics = MetricsRecorder::install()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .max_lifetime(config.database_max_lifetime)
        .idle_timeout(config.database_idle_timeout)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to the user database")?;
    let store = Arc::new(PostgresUserStore::new(pool.clone()));
    store.migrate().await?;

    let log: Arc<dyn DurableLog> = Arc::new(RedpandaLog::builder().brokers(config.log_brokers.clone()).build()?);
    log.ensure_stream(&StreamConfig::new(config.stream_name.clone(), [USER_CREATED]))
        .await?;

    let (trigger, shutdown) = shutdown_channel();

    let relay = OutboxRelay::new(
        pool.clone(),
        Publisher::new(Arc::clone(&log)),
        RelayConfig {
            poll_interval: config.outbox_poll_interval,
            batch_size: config.outbox_batch_size,
            ..RelayConfig::default()
        },
    );
    let relay = tokio::spawn(relay.run(shutdown.clone()));

    let app = router(AppState {
        store,
        metrics: Some(metrics),
    });
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!(address = %address, "HTTP server listening");

    let mut server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.wait().await })
            .await
    });

    tokio::select! {
        () = shutdown_signal() => {},
        result = &mut server => {
            error!(result = ?result, "HTTP server exited unexpectedly");
        },
    }
    trigger.trigger();

    if !server.is_finished() && tokio::time::timeout(config.http_shutdown_grace, &mut server).await.is_err() {
        warn!("HTTP server grace period elapsed, aborting open connections");
        server.abort();
    }
    if let Err(e) = relay.await {
        warn!(error = %e, "Outbox relay task failed");
    }

    pool.close().await;
    info!("User service stopped");
    Ok(())
}
