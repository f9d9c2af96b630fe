//! The subscription engine.
//!
//! A [`Subscription`] binds one durable consumer to one typed [`Route`] and
//! drives it through a small state machine:
//!
//! ```text
//! Created ──► Consuming ──► Draining ──► Stopped
//! ```
//!
//! - **Created**: the durable consumer has been registered or confirmed
//!   (idempotent create-or-update).
//! - **Consuming**: deliveries are pulled and dispatched concurrently, at
//!   most `max_in_flight` at a time. A lost delivery stream is re-opened
//!   after `reconnect_delay`.
//! - **Draining**: a stop was requested; no new deliveries are pulled and
//!   in-flight handlers run to completion (bounded by `drain_timeout`).
//! - **Stopped**: terminal.
//!
//! The engine never settles a delivery on the happy path; that is left to
//! the route's middleware chain. It only steps in when a handler panics
//! (nak) and logs deliveries left unsettled.

use crate::lifecycle::{Shutdown, ShutdownTrigger, shutdown_channel};
use crate::metrics::DeliveryMetrics;
use crate::registry::{HandlerRegistry, Route};
use futures::{FutureExt, StreamExt};
use listings_core::delivery::{Delivery, DeliveryState};
use listings_core::event_bus::{
    ConsumerConfig, ConsumerStatus, DeliveryPolicy, DeliveryStream, DurableLog, EventBusError,
};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`Subscription`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Consumer registered, not yet consuming
    Created,
    /// Pulling and dispatching deliveries
    Consuming,
    /// Waiting for in-flight handlers after a stop request
    Draining,
    /// Terminal
    Stopped,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Consuming => "consuming",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors raised when starting a subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The route handles a different subject than the consumer filters
    #[error("Route for '{route}' cannot serve consumer filtered on '{filter}'")]
    SubjectMismatch {
        /// Subject of the route
        route: String,
        /// Consumer subject filter
        filter: String,
    },

    /// The log rejected the consumer
    #[error(transparent)]
    Log(#[from] EventBusError),
}

/// Configuration for a [`Subscription`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Durable consumer to bind
    pub consumer: ConsumerConfig,
    /// Maximum concurrent handler invocations
    pub max_in_flight: usize,
    /// Upper bound on the drain phase
    pub drain_timeout: Duration,
    /// Wait before re-opening a lost delivery stream
    pub reconnect_delay: Duration,
}

impl SubscriptionConfig {
    /// Config with [`SubscriptionOptions::DEFAULT`] tuning.
    #[must_use]
    pub const fn new(consumer: ConsumerConfig) -> Self {
        Self::with_options(consumer, SubscriptionOptions::DEFAULT)
    }

    /// Config with the given tuning; `max_in_flight` is raised to at least 1.
    #[must_use]
    pub const fn with_options(consumer: ConsumerConfig, options: SubscriptionOptions) -> Self {
        Self {
            consumer,
            max_in_flight: if options.max_in_flight == 0 { 1 } else { options.max_in_flight },
            drain_timeout: options.drain_timeout,
            reconnect_delay: options.reconnect_delay,
        }
    }

    /// Set the concurrency bound (at least 1).
    #[must_use]
    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Set the drain timeout.
    #[must_use]
    pub const fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Set the reconnect delay.
    #[must_use]
    pub const fn reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }
}

/// Handle to a running subscription.
pub struct Subscription {
    name: String,
    state: watch::Receiver<SubscriptionState>,
    stop: ShutdownTrigger,
    task: JoinHandle<()>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Register the durable consumer and start consuming.
    ///
    /// The subscription stops when [`Subscription::stop`] is called or when
    /// `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::SubjectMismatch`] if `route` does not
    /// serve the consumer's subject, or [`SubscriptionError::Log`] if the
    /// consumer cannot be created.
    pub async fn start(
        log: Arc<dyn DurableLog>,
        config: SubscriptionConfig,
        route: Arc<dyn Route>,
        shutdown: Shutdown,
    ) -> Result<Self, SubscriptionError> {
        if route.subject() != config.consumer.subject_filter {
            return Err(SubscriptionError::SubjectMismatch {
                route: route.subject().to_string(),
                filter: config.consumer.subject_filter.clone(),
            });
        }

        let status = log.create_or_update_consumer(&config.consumer).await?;
        match status {
            ConsumerStatus::Created => info!(consumer = %config.consumer.name, "Durable consumer created"),
            ConsumerStatus::Updated => info!(consumer = %config.consumer.name, "Durable consumer updated"),
            ConsumerStatus::Unchanged => debug!(consumer = %config.consumer.name, "Durable consumer confirmed"),
        }

        let (state_tx, state) = watch::channel(SubscriptionState::Created);
        let (stop, stop_rx) = shutdown_channel();
        let name = config.consumer.name.clone();

        let engine = Engine {
            log,
            route,
            config,
            state: state_tx,
            stop: stop_rx,
            shutdown,
        };
        let task = tokio::spawn(engine.run());

        Ok(Self {
            name,
            state,
            stop,
            task,
        })
    }

    /// Durable consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Request a stop; the subscription drains and then stops.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Wait for the subscription to reach [`SubscriptionState::Stopped`].
    ///
    /// # Errors
    ///
    /// Returns the [`tokio::task::JoinError`] if the engine task panicked.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        // Keep the trigger alive until the task ends so it is not read as a stop.
        let Self { stop, task, .. } = self;
        let result = task.await;
        drop(stop);
        result
    }

    /// Request a stop and wait for it.
    ///
    /// # Errors
    ///
    /// See [`Subscription::join`].
    pub async fn stop_and_join(self) -> Result<(), tokio::task::JoinError> {
        self.stop();
        self.join().await
    }
}

/// Why a delivery stream stopped being processed.
enum StreamEnd {
    StopRequested,
    Closed,
}

struct Engine {
    log: Arc<dyn DurableLog>,
    route: Arc<dyn Route>,
    config: SubscriptionConfig,
    state: watch::Sender<SubscriptionState>,
    stop: Shutdown,
    shutdown: Shutdown,
}

impl Engine {
    fn transition(&self, next: SubscriptionState) {
        let previous = self.state.send_replace(next);
        debug!(
            consumer = %self.config.consumer.name,
            from = %previous,
            to = %next,
            "Subscription state changed"
        );
    }

    fn stop_requested(&self) -> bool {
        self.stop.is_triggered() || self.shutdown.is_triggered()
    }

    async fn wait_for_stop(stop: &mut Shutdown, shutdown: &mut Shutdown) {
        tokio::select! {
            () = stop.wait() => {},
            () = shutdown.wait() => {},
        }
    }

    async fn run(mut self) {
        let consumer = self.config.consumer.name.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut in_flight = JoinSet::new();

        self.transition(SubscriptionState::Consuming);
        info!(
            consumer = %consumer,
            subject = %self.config.consumer.subject_filter,
            max_in_flight = self.config.max_in_flight,
            "Subscription consuming"
        );

        while !self.stop_requested() {
            let mut stop = self.stop.clone();
            let mut shutdown = self.shutdown.clone();

            let opened = tokio::select! {
                () = Self::wait_for_stop(&mut stop, &mut shutdown) => break,
                opened = self.log.consume(&consumer) => opened,
            };

            match opened {
                Ok(mut deliveries) => {
                    match self.process(&mut deliveries, &semaphore, &mut in_flight).await {
                        StreamEnd::StopRequested => break,
                        StreamEnd::Closed => warn!(
                            consumer = %consumer,
                            delay = ?self.config.reconnect_delay,
                            "Delivery stream closed, reconnecting"
                        ),
                    }
                },
                Err(e) => error!(
                    consumer = %consumer,
                    error = %e,
                    delay = ?self.config.reconnect_delay,
                    "Failed to open delivery stream, retrying"
                ),
            }

            tokio::select! {
                () = Self::wait_for_stop(&mut stop, &mut shutdown) => break,
                () = tokio::time::sleep(self.config.reconnect_delay) => {},
            }
        }

        self.transition(SubscriptionState::Draining);
        self.drain(&mut in_flight).await;
        self.transition(SubscriptionState::Stopped);
        info!(consumer = %consumer, "Subscription stopped");
    }

    async fn process(
        &self,
        deliveries: &mut DeliveryStream,
        semaphore: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
    ) -> StreamEnd {
        let mut stop = self.stop.clone();
        let mut shutdown = self.shutdown.clone();

        loop {
            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!(consumer = %self.config.consumer.name, error = %e, "Dispatch task failed");
                }
            }

            let permit = tokio::select! {
                () = Self::wait_for_stop(&mut stop, &mut shutdown) => return StreamEnd::StopRequested,
                permit = Arc::clone(semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return StreamEnd::StopRequested,
                },
            };

            let next = tokio::select! {
                () = Self::wait_for_stop(&mut stop, &mut shutdown) => return StreamEnd::StopRequested,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let route = Arc::clone(&self.route);
                    in_flight.spawn(async move {
                        dispatch(route, delivery).await;
                        drop(permit);
                    });
                },
                Some(Err(e)) => {
                    error!(consumer = %self.config.consumer.name, error = %e, "Error receiving delivery");
                },
                None => return StreamEnd::Closed,
            }
        }
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        let consumer = &self.config.consumer.name;
        let pending = in_flight.len();
        if pending == 0 {
            return;
        }

        info!(consumer = %consumer, in_flight = pending, "Draining in-flight deliveries");
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while let Some(finished) = in_flight.join_next().await {
                if let Err(e) = finished {
                    error!(consumer = %consumer, error = %e, "Dispatch task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                consumer = %consumer,
                remaining = in_flight.len(),
                "Drain timed out, aborting remaining handlers"
            );
            in_flight.abort_all();
        }
    }
}

/// Run one delivery through its route, converting a panic into a nak.
async fn dispatch(route: Arc<dyn Route>, delivery: Delivery) {
    let started = Instant::now();
    let subject = delivery.subject().to_string();

    let outcome = AssertUnwindSafe(route.dispatch(delivery.clone()))
        .catch_unwind()
        .await;

    if outcome.is_err() {
        DeliveryMetrics::record_panic(&subject);
        error!(
            subject = %subject,
            consumer = %delivery.consumer(),
            delivery_attempt = delivery.attempt(),
            "Handler panicked"
        );
        if !delivery.is_settled() {
            if let Err(e) = delivery.nak("handler panicked").await {
                error!(subject = %subject, error = %e, "Failed to nak after panic");
            }
        }
    }

    let state = delivery.state();
    if state == DeliveryState::Pending {
        warn!(
            subject = %subject,
            consumer = %delivery.consumer(),
            "Delivery left unsettled by handler chain"
        );
    }
    DeliveryMetrics::record_outcome(&subject, state, started.elapsed());
}

/// Start one subscription per registered subject.
///
/// Consumers are named `{prefix}-{subject}` with dots replaced by
/// underscores, all sharing `policy` and the tuning of `template`.
///
/// # Errors
///
/// Returns the first [`SubscriptionError`]; subscriptions already started
/// are stopped before returning.
pub async fn start_all(
    log: Arc<dyn DurableLog>,
    registry: &HandlerRegistry,
    stream: &str,
    prefix: &str,
    policy: &DeliveryPolicy,
    template: &SubscriptionOptions,
    shutdown: &Shutdown,
) -> Result<Vec<Subscription>, SubscriptionError> {
    let mut started = Vec::new();

    for route in registry.routes() {
        let name = consumer_name(prefix, route.subject());
        let consumer = ConsumerConfig::new(stream, name, route.subject()).with_delivery(policy.clone());
        let config = SubscriptionConfig::with_options(consumer, *template);

        match Subscription::start(Arc::clone(&log), config, route, shutdown.clone()).await {
            Ok(subscription) => started.push(subscription),
            Err(e) => {
                for subscription in started {
                    let name = subscription.name().to_string();
                    if let Err(join_error) = subscription.stop_and_join().await {
                        error!(consumer = %name, error = %join_error, "Subscription task failed while stopping");
                    }
                }
                return Err(e);
            },
        }
    }

    Ok(started)
}

/// Tuning shared by every subscription started through [`start_all`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Maximum concurrent handler invocations per subscription
    pub max_in_flight: usize,
    /// Upper bound on each drain phase
    pub drain_timeout: Duration,
    /// Wait before re-opening a lost delivery stream
    pub reconnect_delay: Duration,
}

impl SubscriptionOptions {
    /// 64 in flight, 10s drain, 5s reconnect delay.
    pub const DEFAULT: Self = Self {
        max_in_flight: 64,
        drain_timeout: Duration::from_secs(10),
        reconnect_delay: Duration::from_secs(5),
    };
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Durable consumer name for `subject`.
#[must_use]
pub fn consumer_name(prefix: &str, subject: &str) -> String {
    format!("{prefix}-{}", subject.replace('.', "_"))
}
