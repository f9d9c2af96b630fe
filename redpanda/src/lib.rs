//! Redpanda durable log for the listings platform.
//!
//! Implements [`DurableLog`] over any Kafka-compatible broker with rdkafka.
//!
//! # Mapping
//!
//! | Log concept        | Kafka                                               |
//! |--------------------|-----------------------------------------------------|
//! | subject            | topic                                               |
//! | stream             | set of topics, created on `ensure_stream`           |
//! | durable consumer   | consumer group (`group.id` = consumer name)         |
//! | ack                | offset commit                                       |
//! | delivery attempt   | `x-delivery-attempt` header (absent = 1)            |
//! | redelivery         | append to `<stream>.<consumer>.retry`, attempt + 1  |
//! | dead letter        | append to `<stream>.dead_letter` with provenance    |
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits: an offset is committed only
//! once every earlier offset on the partition has settled. A crash before
//! the commit redelivers the message, so handlers must be idempotent.
//!
//! # Example
//!
//! ```no_run
//! use listings_core::event_bus::{DurableLog, StreamConfig};
//! use listings_redpanda::RedpandaLog;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log = RedpandaLog::builder()
//!     .brokers("localhost:9092")
//!     .producer_acks("all")
//!     .build()?;
//!
//! log.ensure_stream(&StreamConfig::new("listing_view_event", ["user.created", "listing.created"]))
//!     .await?;
//! log.publish("user.created", br#"{"id":1,"name":"John Doe"}"#).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod acker;
pub mod offsets;

use acker::{ConsumerShared, KafkaAcknowledger, Position, attempt_from_headers, delivered_subject, retry_topic};
use futures::StreamExt;
use listings_core::delivery::Delivery;
use listings_core::event::DomainEvent;
use listings_core::event_bus::{
    ConsumerConfig, ConsumerStatus, DeliveryStream, DurableLog, EventBusError, PublishAck, StreamConfig,
};
use offsets::{OffsetTracker, RebalanceContext};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Redpanda-backed [`DurableLog`].
///
/// Stream and consumer definitions are kept per process: every service
/// calls `ensure_stream` and `create_or_update_consumer` at startup.
pub struct RedpandaLog {
    /// Kafka producer for publishing, redelivery and dead-lettering
    producer: FutureProducer,
    /// Admin client for topic creation
    admin: AdminClient<DefaultClientContext>,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Delivery buffer size per consumer
    buffer_size: usize,
    /// Auto offset reset policy for new consumer groups
    auto_offset_reset: String,
    /// Partitions for newly created topics
    topic_partitions: i32,
    /// Replication factor for newly created topics
    replication_factor: i32,
    /// Reconnect backoff for consumers, in milliseconds
    reconnect_backoff: (u64, u64),
    streams: Mutex<BTreeMap<String, StreamConfig>>,
    consumers: Mutex<HashMap<String, ConsumerConfig>>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl RedpandaLog {
    /// Create a log with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the clients cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaLogBuilder {
        RedpandaLogBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn stream_for(&self, subject: &str) -> Result<String, EventBusError> {
        let streams = self
            .streams
            .lock()
            .map_err(|_| EventBusError::Other("stream registry poisoned".to_string()))?;
        streams
            .values()
            .find(|stream| stream.binds(subject))
            .map(|stream| stream.name.clone())
            .ok_or_else(|| EventBusError::UnknownSubject(subject.to_string()))
    }

    async fn create_topics(&self, names: &[&str]) -> Result<(), EventBusError> {
        let topics: Vec<NewTopic<'_>> = names
            .iter()
            .map(|name| {
                NewTopic::new(
                    name,
                    self.topic_partitions,
                    TopicReplication::Fixed(self.replication_factor),
                )
            })
            .collect();

        let results = self
            .admin
            .create_topics(&topics, &AdminOptions::new())
            .await
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create topics: {e}")))?;

        for result in results {
            match result {
                Ok(topic) => tracing::info!(topic = %topic, "Topic created"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {},
                Err((topic, code)) => {
                    return Err(EventBusError::Other(format!("Failed to create topic '{topic}': {code}")));
                },
            }
        }
        Ok(())
    }

    fn create_consumer(
        &self,
        config: &ConsumerConfig,
        retry_topic: &str,
        offsets: &Arc<Mutex<OffsetTracker>>,
    ) -> Result<StreamConsumer<RebalanceContext>, EventBusError> {
        let subscription_failed = |reason: String| EventBusError::SubscriptionFailed {
            consumer: config.name.clone(),
            reason,
        };

        let context = RebalanceContext::new(config.name.clone(), Arc::clone(offsets));
        let consumer: StreamConsumer<RebalanceContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &config.name)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .set("reconnect.backoff.ms", self.reconnect_backoff.0.to_string())
            .set("reconnect.backoff.max.ms", self.reconnect_backoff.1.to_string())
            .create_with_context(context)
            .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

        let mut topics = vec![config.subject_filter.as_str()];
        if config.delivery.max_deliver > 1 {
            topics.push(retry_topic);
        }
        consumer
            .subscribe(&topics)
            .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

        Ok(consumer)
    }
}

/// Builder for configuring a [`RedpandaLog`].
#[derive(Default)]
pub struct RedpandaLogBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
    topic_partitions: Option<i32>,
    replication_factor: Option<i32>,
    reconnect_backoff: Option<(Duration, Duration)>,
}

impl RedpandaLogBuilder {
    /// Set the broker addresses (comma separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the per-consumer delivery buffer. Values below 1 are raised to 1.
    ///
    /// Default: 1000
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set where new consumer groups start reading: "earliest" or "latest".
    ///
    /// Default: "earliest", so a new consumer sees the whole stream.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the partition count and replication factor for created topics.
    ///
    /// Default: 1 partition, replication 1
    #[must_use]
    pub const fn topics(mut self, partitions: i32, replication_factor: i32) -> Self {
        self.topic_partitions = Some(partitions);
        self.replication_factor = Some(replication_factor);
        self
    }

    /// Set the consumer reconnect backoff and its ceiling.
    ///
    /// Default: 100ms, capped at 10s
    #[must_use]
    pub const fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff = Some((initial, max));
        self
    }

    /// Build the [`RedpandaLog`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the clients cannot be created.
    pub fn build(self) -> Result<RedpandaLog, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create admin client: {e}")))?;

        let (initial, max) = self
            .reconnect_backoff
            .unwrap_or((Duration::from_millis(100), Duration::from_secs(10)));
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);

        let log = RedpandaLog {
            producer,
            admin,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string()),
            topic_partitions: self.topic_partitions.unwrap_or(1),
            replication_factor: self.replication_factor.unwrap_or(1),
            reconnect_backoff: (millis(initial), millis(max)),
            streams: Mutex::new(BTreeMap::new()),
            consumers: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashSet::new())),
        };

        tracing::info!(
            brokers = %log.brokers,
            acks = acks,
            compression = compression,
            buffer_size = log.buffer_size,
            auto_offset_reset = %log.auto_offset_reset,
            "RedpandaLog created"
        );
        Ok(log)
    }
}

/// Releases a durable consumer when its delivery stream is dropped.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.name);
        }
    }
}

fn read_headers<M: Message>(message: &M) -> BTreeMap<String, String> {
    message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| {
                    let value = header.value?;
                    Some((header.key.to_string(), String::from_utf8_lossy(value).into_owned()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Pump messages from the Kafka consumer into the delivery channel until
/// the receiving stream is dropped.
async fn forward(shared: Arc<ConsumerShared>, tx: mpsc::Sender<Result<Delivery, EventBusError>>) {
    let mut messages = shared.consumer.stream();

    loop {
        let next = tokio::select! {
            () = tx.closed() => break,
            next = messages.next() => next,
        };
        let Some(result) = next else { break };

        let item = match result {
            Ok(message) => {
                let headers = read_headers(&message);
                let event = DomainEvent {
                    subject: delivered_subject(message.topic(), &shared.retry_topic, message.key(), &headers),
                    payload: message.payload().unwrap_or_default().to_vec(),
                    delivery_attempt: attempt_from_headers(&headers),
                    headers,
                };
                let position = Position {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                };

                match shared.offsets.lock() {
                    Ok(mut offsets) => offsets.received(&position.topic, position.partition, position.offset),
                    Err(_) => {
                        tracing::error!(consumer = %shared.name, "Offset tracker poisoned, stopping consumer");
                        break;
                    },
                }

                tracing::trace!(
                    consumer = %shared.name,
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    delivery_attempt = event.delivery_attempt,
                    "Received message"
                );

                let acker = Arc::new(KafkaAcknowledger {
                    shared: Arc::clone(&shared),
                    position,
                });
                Ok(Delivery::new(event, shared.name.as_str(), acker))
            },
            Err(e) => Err(EventBusError::TransportError(format!("Failed to receive message: {e}"))),
        };

        if tx.send(item).await.is_err() {
            break;
        }
    }

    tracing::debug!(consumer = %shared.name, "Consumer task exiting");
}

impl DurableLog for RedpandaLog {
    fn ensure_stream(
        &self,
        config: &StreamConfig,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let config = config.clone();
        Box::pin(async move {
            let subjects: Vec<&str> = config.subjects.iter().map(String::as_str).collect();
            self.create_topics(&subjects).await?;
            tracing::debug!(stream = %config.name, topics = subjects.len(), "Stream topics ensured");

            self.streams
                .lock()
                .map_err(|_| EventBusError::Other("stream registry poisoned".to_string()))?
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
            let stream = self.stream_for(&subject)?;
            let record = FutureRecord::to(&subject).payload(&payload).key(&subject);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        subject = %subject,
                        partition = partition,
                        offset = offset,
                        "Message appended"
                    );
                    Ok(PublishAck {
                        stream,
                        subject,
                        sequence: u64::try_from(offset).unwrap_or_default(),
                    })
                },
                Err((kafka_error, _)) => Err(EventBusError::PublishFailed {
                    subject,
                    reason: kafka_error.to_string(),
                }),
            }
        })
    }

    fn create_or_update_consumer(
        &self,
        config: &ConsumerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ConsumerStatus, EventBusError>> + Send + '_>> {
        let config = config.clone();
        Box::pin(async move {
            {
                let streams = self
                    .streams
                    .lock()
                    .map_err(|_| EventBusError::Other("stream registry poisoned".to_string()))?;
                let stream = streams
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
            }

            if config.delivery.max_deliver > 1 {
                let retry = retry_topic(&config.stream, &config.name);
                self.create_topics(&[retry.as_str()]).await?;
            }

            let mut consumers = self
                .consumers
                .lock()
                .map_err(|_| EventBusError::Other("consumer registry poisoned".to_string()))?;
            let status = match consumers.get(&config.name) {
                Some(existing) if *existing == config => ConsumerStatus::Unchanged,
                Some(_) => ConsumerStatus::Updated,
                None => ConsumerStatus::Created,
            };
            consumers.insert(config.name.clone(), config);
            Ok(status)
        })
    }

    fn consume(
        &self,
        consumer: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let name = consumer.to_string();
        Box::pin(async move {
            let config = self
                .consumers
                .lock()
                .map_err(|_| EventBusError::Other("consumer registry poisoned".to_string()))?
                .get(&name)
                .cloned()
                .ok_or_else(|| EventBusError::ConsumerNotFound(name.clone()))?;

            let inserted = self
                .active
                .lock()
                .map_err(|_| EventBusError::Other("consumer registry poisoned".to_string()))?
                .insert(name.clone());
            if !inserted {
                return Err(EventBusError::ConsumerBusy(name));
            }
            let guard = ActiveGuard {
                active: Arc::clone(&self.active),
                name: name.clone(),
            };

            let retry_topic = retry_topic(&config.stream, &name);
            let offsets = Arc::new(Mutex::new(OffsetTracker::new()));
            let kafka_consumer = self.create_consumer(&config, &retry_topic, &offsets)?;
            let shared = Arc::new(ConsumerShared {
                name: name.clone(),
                consumer: kafka_consumer,
                retry_topic,
                producer: self.producer.clone(),
                policy: config.delivery.clone(),
                timeout: self.timeout,
                offsets,
            });

            tracing::info!(
                consumer = %name,
                subject = %config.subject_filter,
                max_deliver = config.delivery.max_deliver,
                manual_commit = true,
                "Consuming"
            );

            let (tx, rx) = mpsc::channel(self.buffer_size);
            tokio::spawn(forward(shared, tx));

            let stream = async_stream::stream! {
                let _guard = guard;
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
