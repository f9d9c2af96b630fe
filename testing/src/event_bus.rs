//! In-memory durable log.
//!
//! [`InMemoryLog`] implements the full [`DurableLog`] contract in process:
//! streams bind subjects, durable consumers keep their own cursor, nak'd
//! messages are redelivered while the consumer's policy allows, and
//! permanently failed messages land on the dead-letter subject. It never
//! touches the network, so engine and handler tests are fast and
//! deterministic.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use futures::Stream;
use listings_core::delivery::{Acknowledger, Delivery, DeliveryState, Settlement};
use listings_core::event::{
    DomainEvent, HEADER_DELIVERY_ATTEMPT, HEADER_FAILURE_REASON, HEADER_ORIGINAL_SUBJECT,
};
use listings_core::event_bus::{
    ConsumerConfig, ConsumerStatus, DeliveryStream, DurableLog, EventBusError, PublishAck,
    StreamConfig,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// A settlement as recorded by the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementRecord {
    /// Consumer that settled
    pub consumer: String,
    /// Subject of the settled message
    pub subject: String,
    /// Attempt that was settled
    pub delivery_attempt: u32,
    /// What the consumer asked for
    pub settlement: Settlement,
    /// Where the delivery ended up
    pub outcome: DeliveryState,
}

#[derive(Clone, Debug)]
struct StoredMessage {
    stream: String,
    subject: String,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    cursor: usize,
    redeliveries: VecDeque<DomainEvent>,
    active: bool,
}

#[derive(Debug, Default)]
struct LogState {
    streams: HashMap<String, StreamConfig>,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
    settlements: Vec<SettlementRecord>,
    unavailable: bool,
}

impl LogState {
    fn stream_for(&self, subject: &str) -> Option<&StreamConfig> {
        self.streams.values().find(|stream| stream.binds(subject))
    }

    fn append(&mut self, subject: &str, payload: &[u8], headers: BTreeMap<String, String>) -> Result<PublishAck, EventBusError> {
        let stream = self
            .stream_for(subject)
            .ok_or_else(|| EventBusError::UnknownSubject(subject.to_string()))?
            .name
            .clone();

        self.messages.push(StoredMessage {
            stream: stream.clone(),
            subject: subject.to_string(),
            payload: payload.to_vec(),
            headers,
        });

        Ok(PublishAck {
            stream,
            subject: subject.to_string(),
            sequence: self.messages.len() as u64,
        })
    }

    fn next_for(&mut self, consumer: &str) -> Option<DomainEvent> {
        let state = self.consumers.get_mut(consumer)?;
        if let Some(event) = state.redeliveries.pop_front() {
            return Some(event);
        }

        while state.cursor < self.messages.len() {
            let message = &self.messages[state.cursor];
            state.cursor += 1;
            if message.stream == state.config.stream && message.subject == state.config.subject_filter {
                let mut event = DomainEvent::new(message.subject.clone(), message.payload.clone());
                event.headers = message.headers.clone();
                return Some(event);
            }
        }
        None
    }
}

struct Inner {
    state: Mutex<LogState>,
    changes: watch::Sender<u64>,
}

impl Inner {
    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn settle(&self, consumer: &str, event: &DomainEvent, settlement: &Settlement) -> Result<DeliveryState, EventBusError> {
        let mut state = self.state.lock().unwrap();
        let policy = state
            .consumers
            .get(consumer)
            .ok_or_else(|| EventBusError::ConsumerNotFound(consumer.to_string()))?
            .config
            .delivery
            .clone();

        let outcome = match settlement {
            Settlement::Ack => DeliveryState::Acked,
            Settlement::Nak { .. } if policy.should_redeliver(event.delivery_attempt) => {
                let redelivery = event.clone().with_attempt(event.delivery_attempt + 1);
                if let Some(consumer_state) = state.consumers.get_mut(consumer) {
                    consumer_state.redeliveries.push_back(redelivery);
                }
                DeliveryState::RetryScheduled
            },
            Settlement::Nak { reason } | Settlement::Term { reason } => {
                if let Some(dead_letter) = &policy.dead_letter_subject {
                    let headers = BTreeMap::from([
                        (HEADER_ORIGINAL_SUBJECT.to_string(), event.subject.clone()),
                        (HEADER_FAILURE_REASON.to_string(), reason.clone()),
                        (HEADER_DELIVERY_ATTEMPT.to_string(), event.delivery_attempt.to_string()),
                    ]);
                    if let Err(e) = state.append(dead_letter, &event.payload, headers) {
                        tracing::warn!(
                            subject = %event.subject,
                            dead_letter = %dead_letter,
                            error = %e,
                            "Dead-letter subject is not bound; message dropped"
                        );
                    }
                }
                DeliveryState::PermanentlyFailed
            },
        };

        state.settlements.push(SettlementRecord {
            consumer: consumer.to_string(),
            subject: event.subject.clone(),
            delivery_attempt: event.delivery_attempt,
            settlement: settlement.clone(),
            outcome,
        });
        drop(state);

        self.notify();
        Ok(outcome)
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    consumer: String,
}

impl Acknowledger for InMemoryAcker {
    fn settle<'a>(
        &'a self,
        event: &'a DomainEvent,
        settlement: Settlement,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryState, EventBusError>> + Send + 'a>> {
        Box::pin(async move { self.inner.settle(&self.consumer, event, &settlement) })
    }
}

/// Releases the consumer when its delivery stream is dropped.
struct ActiveGuard {
    inner: Arc<Inner>,
    consumer: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            if let Some(consumer) = state.consumers.get_mut(&self.consumer) {
                consumer.active = false;
            }
        }
    }
}

/// In-memory implementation of [`DurableLog`] for tests.
///
/// # Example
///
/// ```
/// use listings_testing::InMemoryLog;
/// use listings_core::event_bus::{ConsumerConfig, DurableLog, StreamConfig};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryLog::new();
/// log.ensure_stream(&StreamConfig::new("s", ["user.created"])).await?;
/// log.create_or_update_consumer(&ConsumerConfig::new("s", "users", "user.created")).await?;
///
/// log.publish("user.created", br#"{"id":1}"#).await?;
///
/// let mut deliveries = log.consume("users").await?;
/// let delivery = deliveries.next().await.unwrap()?;
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryLog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InMemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLog").finish_non_exhaustive()
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LogState::default()),
                changes,
            }),
        }
    }

    /// Make publishes fail as if the log were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.state.lock().unwrap().unavailable = unavailable;
    }

    /// All messages appended under `subject`, in order.
    #[must_use]
    pub fn messages(&self, subject: &str) -> Vec<DomainEvent> {
        self.inner
            .state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.subject == subject)
            .map(|m| {
                let mut event = DomainEvent::new(m.subject.clone(), m.payload.clone());
                event.headers = m.headers.clone();
                event
            })
            .collect()
    }

    /// Every settlement recorded so far.
    #[must_use]
    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.inner.state.lock().unwrap().settlements.clone()
    }

    /// Settlements recorded for one consumer.
    #[must_use]
    pub fn settlements_for(&self, consumer: &str) -> Vec<SettlementRecord> {
        self.settlements()
            .into_iter()
            .filter(|record| record.consumer == consumer)
            .collect()
    }

    /// Current configuration of a durable consumer.
    #[must_use]
    pub fn consumer_config(&self, consumer: &str) -> Option<ConsumerConfig> {
        self.inner
            .state
            .lock()
            .unwrap()
            .consumers
            .get(consumer)
            .map(|c| c.config.clone())
    }

    /// Whether a subscriber currently holds the consumer.
    #[must_use]
    pub fn is_active(&self, consumer: &str) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .consumers
            .get(consumer)
            .is_some_and(|c| c.active)
    }

    /// Wait until `consumer` has recorded at least `count` settlements.
    pub async fn wait_for_settlements(&self, consumer: &str, count: usize) {
        let mut changes = self.inner.changes.subscribe();
        loop {
            changes.borrow_and_update();
            if self.settlements_for(consumer).len() >= count {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    fn deliveries(&self, consumer: String) -> impl Stream<Item = Result<Delivery, EventBusError>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let guard = ActiveGuard {
            inner: Arc::clone(&inner),
            consumer: consumer.clone(),
        };

        async_stream::stream! {
            let _guard = guard;
            let mut changes = inner.changes.subscribe();
            let acker: Arc<dyn Acknowledger> = Arc::new(InMemoryAcker {
                inner: Arc::clone(&inner),
                consumer: consumer.clone(),
            });

            loop {
                changes.borrow_and_update();
                let next = inner.state.lock().unwrap().next_for(&consumer);
                if let Some(event) = next {
                    yield Ok(Delivery::new(event, consumer.as_str(), Arc::clone(&acker)));
                    continue;
                }
                if changes.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

impl DurableLog for InMemoryLog {
    fn ensure_stream(
        &self,
        config: &StreamConfig,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let config = config.clone();
        Box::pin(async move {
            self.inner
                .state
                .lock()
                .unwrap()
                .streams
                .insert(config.name.clone(), config);
            Ok(())
        })
    }

    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, EventBusError>> + Send + '_>> {
        let subject = subject.to_string();
        let payload = payload.to_vec();
        Box::pin(async move {
            let ack = {
                let mut state = self.inner.state.lock().unwrap();
                if state.unavailable {
                    return Err(EventBusError::PublishFailed {
                        subject,
                        reason: "log unavailable".to_string(),
                    });
                }
                state.append(&subject, &payload, BTreeMap::new())?
            };
            self.inner.notify();
            Ok(ack)
        })
    }

    fn create_or_update_consumer(
        &self,
        config: &ConsumerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ConsumerStatus, EventBusError>> + Send + '_>> {
        let config = config.clone();
        Box::pin(async move {
            let mut state = self.inner.state.lock().unwrap();
            let stream = state
                .streams
                .get(&config.stream)
                .ok_or_else(|| EventBusError::StreamNotFound(config.stream.clone()))?;
            if !stream.binds(&config.subject_filter) {
                return Err(EventBusError::SubscriptionFailed {
                    consumer: config.name.clone(),
                    reason: format!(
                        "stream '{}' does not bind '{}'",
                        config.stream, config.subject_filter
                    ),
                });
            }

            match state.consumers.get_mut(&config.name) {
                Some(existing) if existing.config == config => Ok(ConsumerStatus::Unchanged),
                Some(existing) => {
                    existing.config = config;
                    Ok(ConsumerStatus::Updated)
                },
                None => {
                    state.consumers.insert(
                        config.name.clone(),
                        ConsumerState {
                            config,
                            cursor: 0,
                            redeliveries: VecDeque::new(),
                            active: false,
                        },
                    );
                    Ok(ConsumerStatus::Created)
                },
            }
        })
    }

    fn consume(
        &self,
        consumer: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let consumer = consumer.to_string();
        Box::pin(async move {
            {
                let mut state = self.inner.state.lock().unwrap();
                let entry = state
                    .consumers
                    .get_mut(&consumer)
                    .ok_or_else(|| EventBusError::ConsumerNotFound(consumer.clone()))?;
                if entry.active {
                    return Err(EventBusError::ConsumerBusy(consumer));
                }
                entry.active = true;
            }

            Ok(Box::pin(self.deliveries(consumer)) as DeliveryStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use listings_core::event_bus::DeliveryPolicy;

    const STREAM: &str = "listing_view_event";

    async fn log_with_consumer(policy: DeliveryPolicy) -> InMemoryLog {
        let log = InMemoryLog::new();
        let stream = StreamConfig::new(STREAM, ["user.created", "listing.created"]).with_dead_letter();
        log.ensure_stream(&stream).await.unwrap();
        log.create_or_update_consumer(
            &ConsumerConfig::new(STREAM, "users", "user.created").with_delivery(policy),
        )
        .await
        .unwrap();
        log
    }

    #[tokio::test]
    async fn publish_to_unbound_subject_fails() {
        let log = InMemoryLog::new();
        let result = log.publish("nowhere", b"{}").await;
        assert_eq!(result, Err(EventBusError::UnknownSubject("nowhere".to_string())));
    }

    #[tokio::test]
    async fn publish_returns_increasing_sequence() {
        let log = log_with_consumer(DeliveryPolicy::default()).await;
        let first = log.publish("user.created", b"1").await.unwrap();
        let second = log.publish("listing.created", b"2").await.unwrap();

        assert_eq!(first.stream, STREAM);
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn create_or_update_consumer_is_idempotent() {
        let log = log_with_consumer(DeliveryPolicy::default()).await;
        let config = ConsumerConfig::new(STREAM, "users", "user.created");

        assert_eq!(
            log.create_or_update_consumer(&config).await.unwrap(),
            ConsumerStatus::Unchanged
        );

        let updated = config.with_delivery(DeliveryPolicy::default().max_deliver(3));
        assert_eq!(
            log.create_or_update_consumer(&updated).await.unwrap(),
            ConsumerStatus::Updated
        );
        assert_eq!(log.consumer_config("users").unwrap().delivery.max_deliver, 3);
    }

    #[tokio::test]
    async fn consumer_must_bind_a_stream_subject() {
        let log = log_with_consumer(DeliveryPolicy::default()).await;
        let result = log
            .create_or_update_consumer(&ConsumerConfig::new(STREAM, "x", "order.created"))
            .await;
        assert!(matches!(result, Err(EventBusError::SubscriptionFailed { .. })));
    }

    #[tokio::test]
    async fn second_subscriber_is_rejected_until_first_drops() {
        let log = log_with_consumer(DeliveryPolicy::default()).await;
        let first = log.consume("users").await.unwrap();

        assert!(matches!(
            log.consume("users").await,
            Err(EventBusError::ConsumerBusy(_))
        ));

        drop(first);
        assert!(!log.is_active("users"));
        assert!(log.consume("users").await.is_ok());
    }

    #[tokio::test]
    async fn consumer_only_sees_its_subject() {
        let log = log_with_consumer(DeliveryPolicy::default()).await;
        log.publish("listing.created", b"listing").await.unwrap();
        log.publish("user.created", b"user").await.unwrap();

        let mut deliveries = log.consume("users").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        assert_eq!(delivery.event().payload, b"user");
        assert_eq!(delivery.attempt(), 1);
    }

    #[tokio::test]
    async fn nak_with_single_attempt_dead_letters() {
        let policy = DeliveryPolicy::default().dead_letter(format!("{STREAM}.dead_letter"));
        let log = log_with_consumer(policy).await;
        log.publish("user.created", b"user").await.unwrap();

        let mut deliveries = log.consume("users").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        let state = delivery.nak("boom").await.unwrap();

        assert_eq!(state, DeliveryState::PermanentlyFailed);
        let dead = log.messages(&format!("{STREAM}.dead_letter"));
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].headers[HEADER_ORIGINAL_SUBJECT], "user.created");
        assert_eq!(dead[0].headers[HEADER_FAILURE_REASON], "boom");
    }

    #[tokio::test]
    async fn nak_below_ceiling_redelivers_with_next_attempt() {
        let log = log_with_consumer(DeliveryPolicy::default().max_deliver(2)).await;
        log.publish("user.created", b"user").await.unwrap();

        let mut deliveries = log.consume("users").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.nak("later").await.unwrap(), DeliveryState::RetryScheduled);

        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.attempt(), 2);
        assert_eq!(second.nak("again").await.unwrap(), DeliveryState::PermanentlyFailed);
    }

    #[tokio::test]
    async fn redelivery_only_reaches_the_naking_consumer() {
        let log = log_with_consumer(DeliveryPolicy::default().max_deliver(3)).await;
        log.create_or_update_consumer(&ConsumerConfig::new(STREAM, "audit", "user.created"))
            .await
            .unwrap();
        log.publish("user.created", b"user").await.unwrap();

        let mut users = log.consume("users").await.unwrap();
        let mut audit = log.consume("audit").await.unwrap();
        let audited = audit.next().await.unwrap().unwrap();
        assert_eq!(audited.ack().await.unwrap(), DeliveryState::Acked);

        let first = users.next().await.unwrap().unwrap();
        assert_eq!(first.nak("later").await.unwrap(), DeliveryState::RetryScheduled);
        let second = users.next().await.unwrap().unwrap();
        assert_eq!(second.attempt(), 2);

        let extra = tokio::time::timeout(std::time::Duration::from_millis(50), audit.next()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn term_never_redelivers() {
        let log = log_with_consumer(DeliveryPolicy::default().max_deliver(5)).await;
        log.publish("user.created", b"user").await.unwrap();

        let mut deliveries = log.consume("users").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        assert_eq!(delivery.term("bad").await.unwrap(), DeliveryState::PermanentlyFailed);
        assert_eq!(log.settlements_for("users").len(), 1);
    }

    #[tokio::test]
    async fn unavailable_log_rejects_publish() {
        let log = log_with_consumer(DeliveryPolicy::default()).await;
        log.set_unavailable(true);

        assert!(matches!(
            log.publish("user.created", b"x").await,
            Err(EventBusError::PublishFailed { .. })
        ));
    }
}
