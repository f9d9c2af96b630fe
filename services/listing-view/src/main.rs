//! Listing view service binary.

use anyhow::Context;
use listing_view_service::config::Config;
use listing_view_service::http::{AppState, router};
use listing_view_service::{CONSUMER_PREFIX, SUBJECTS, build_registry};
use listings_core::event_bus::{DeliveryPolicy, DurableLog, StreamConfig};
use listings_projections::{ListingViewService, PostgresProjectionStore};
use listings_redpanda::RedpandaLog;
use listings_runtime::lifecycle::{await_tasks, shutdown_signal};
use listings_runtime::metrics::MetricsRecorder;
use listings_runtime::{Subscription, SubscriptionOptions, shutdown_channel, start_all};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

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

    info!(
        brokers = %config.log.brokers,
        stream = %config.log.stream_name,
        max_deliver = config.log.max_deliver,
        "Starting listing view service"
    );

    let metrics = MetricsRecorder::install()?;

    // Read model
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .max_lifetime(config.database.max_lifetime)
        .idle_timeout(config.database.idle_timeout)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to the read-model database")?;
    let store = Arc::new(PostgresProjectionStore::new(pool.clone()));
    store.migrate().await?;
    info!("Read model migrated");

    // Durable log
    let log: Arc<dyn DurableLog> = Arc::new(
        RedpandaLog::builder()
            .brokers(config.log.brokers.clone())
            .reconnect_backoff(config.log.reconnect_backoff, config.log.reconnect_backoff_max)
            .build()?,
    );
    let mut stream = StreamConfig::new(config.log.stream_name.clone(), SUBJECTS);
    let mut policy = DeliveryPolicy::default().max_deliver(config.log.max_deliver);
    if config.log.dead_letter_enabled {
        stream = stream.with_dead_letter();
        policy = policy.dead_letter(stream.dead_letter_subject());
    }
    log.ensure_stream(&stream).await?;

    let registry = build_registry(Arc::clone(&store))?;

    let (trigger, shutdown) = shutdown_channel();
    let options = SubscriptionOptions {
        max_in_flight: config.subscription.max_in_flight,
        drain_timeout: config.subscription.drain_timeout,
        ..SubscriptionOptions::default()
    };
    let subscriptions = start_all(
        Arc::clone(&log),
        &registry,
        &stream.name,
        CONSUMER_PREFIX,
        &policy,
        &options,
        &shutdown,
    )
    .await?;
    info!(count = subscriptions.len(), "Subscriptions started");

    // HTTP
    let app = router(AppState {
        listings: ListingViewService::new(Arc::clone(&store)),
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

    if !server.is_finished() {
        match tokio::time::timeout(config.http.shutdown_grace, &mut server).await {
            Ok(_) => info!("HTTP server stopped"),
            Err(_) => {
                warn!("HTTP server grace period elapsed, aborting open connections");
                server.abort();
            },
        }
    }

    await_tasks(
        "subscription",
        subscriptions.into_iter().map(Subscription::join),
        config.subscription.drain_timeout * 2,
    )
    .await;

    pool.close().await;
    info!("Listing view service stopped");
    Ok(())
}
