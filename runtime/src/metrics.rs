//! Prometheus metrics for the event pipeline.
//!
//! Metrics recorded here:
//! - deliveries settled by a subscription, labelled by subject and outcome
//! - payloads that failed to decode
//! - handler panics
//! - publishes and publish failures
//! - outbox rows relayed
//!
//! # Example
//!
//! ```rust,no_run
//! use listings_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let recorder = MetricsRecorder::install()?;
//!
//! // Serve recorder.render() from a /metrics endpoint
//! let body = recorder.render();
//! # Ok(())
//! # }
//! ```

use listings_core::delivery::DeliveryState;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installed Prometheus recorder.
#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// Register metric descriptions and install the global Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or a recorder
    /// is already installed.
    pub fn install() -> Result<Self, MetricsError> {
        register_metrics();

        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn register_metrics() {
    describe_counter!(
        "listings_deliveries_total",
        "Deliveries settled by subscriptions, by subject and outcome"
    );
    describe_counter!(
        "listings_decode_failures_total",
        "Deliveries whose payload could not be decoded"
    );
    describe_counter!(
        "listings_handler_panics_total",
        "Handler invocations that panicked"
    );
    describe_histogram!(
        "listings_handler_duration_seconds",
        "Time spent in the handler chain per delivery"
    );
    describe_counter!(
        "listings_events_published_total",
        "Events published to the durable log"
    );
    describe_counter!(
        "listings_publish_errors_total",
        "Publishes rejected by the durable log"
    );
    describe_counter!(
        "listings_outbox_relayed_total",
        "Outbox rows published and marked as sent"
    );
}

/// Subscription-side metrics.
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    /// Record the final state of a delivery.
    pub fn record_outcome(subject: &str, state: DeliveryState, elapsed: Duration) {
        counter!(
            "listings_deliveries_total",
            "subject" => subject.to_string(),
            "outcome" => state.as_str()
        )
        .increment(1);
        histogram!("listings_handler_duration_seconds", "subject" => subject.to_string())
            .record(elapsed.as_secs_f64());
    }

    /// Record a payload that failed to decode.
    pub fn record_decode_failure(subject: &str) {
        counter!("listings_decode_failures_total", "subject" => subject.to_string()).increment(1);
    }

    /// Record a handler panic.
    pub fn record_panic(subject: &str) {
        counter!("listings_handler_panics_total", "subject" => subject.to_string()).increment(1);
    }
}

/// Publish-side metrics.
pub struct PublishMetrics;

impl PublishMetrics {
    /// Record a durable publish.
    pub fn record_publish(subject: &str) {
        counter!("listings_events_published_total", "subject" => subject.to_string()).increment(1);
    }

    /// Record a rejected publish.
    pub fn record_error(subject: &str) {
        counter!("listings_publish_errors_total", "subject" => subject.to_string()).increment(1);
    }

    /// Record outbox rows relayed.
    pub fn record_relayed(count: usize) {
        counter!("listings_outbox_relayed_total").increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        DeliveryMetrics::record_outcome("user.created", DeliveryState::Acked, Duration::from_millis(3));
        DeliveryMetrics::record_decode_failure("user.created");
        PublishMetrics::record_publish("user.created");
        PublishMetrics::record_relayed(2);
    }
}
