//! API gateway binary.

use anyhow::Context;
use api_gateway::build_gateway;
use api_gateway::config::Config;
use api_gateway::http::{AppState, router};
use listings_runtime::lifecycle::shutdown_signal;
use listings_runtime::metrics::MetricsRecorder;
use listings_runtime::shutdown_channel;
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
        user_service = %config.user_service.base_url,
        listing_service = %config.listing_service.base_url,
        listing_view_service = %config.listing_view_service.base_url,
        "Starting API gateway"
    );

    let metrics = MetricsRecorder::install()?;
    let gateway = build_gateway(&config)?;

    let app = router(
        AppState {
            gateway,
            request_timeout: config.request_timeout,
            metrics: Some(metrics),
        },
        &config.allowed_origins,
    );
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!(address = %address, "HTTP server listening");

    let (trigger, mut shutdown) = shutdown_channel();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
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

    info!("API gateway stopped");
    Ok(())
}
