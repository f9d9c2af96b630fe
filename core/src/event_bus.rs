//! The durable log contract.
//!
//! This module defines [`DurableLog`], the interface the platform needs from
//! its messaging system: named streams binding a set of subjects, durable
//! consumers with explicit acknowledgment, and publishes that return only
//! once the write is durable.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   publish(subject)   ┌──────────────────────────┐
//! │  Publisher   │ ───────────────────► │  Stream "listing_view_   │
//! └──────────────┘                      │  event"                  │
//!                                       │  ├─ user.created         │
//!                                       │  ├─ listing.created      │
//!                                       │  └─ <stream>.dead_letter │
//!                                       └────────────┬─────────────┘
//!                                                    │ durable consumer
//!                                                    ▼ (one per subject)
//!                                       ┌──────────────────────────┐
//!                                       │  Subscription Engine     │
//!                                       │  ack / nak / term        │
//!                                       └──────────────────────────┘
//! ```
//!
//! # Delivery semantics
//!
//! - **Explicit acknowledgment**: every delivery is settled by the consumer.
//! - **Bounded redelivery**: a negative acknowledgment is redelivered only
//!   while the attempt count is below [`DeliveryPolicy::max_deliver`]
//!   (default 1, i.e. no redelivery).
//! - **Dead-lettering**: messages that fail permanently are appended to the
//!   stream's dead-letter subject when the policy names one.
//! - **Single active consumer**: a durable consumer name has at most one
//!   live [`DeliveryStream`] at a time.
//!
//! # Implementations
//!
//! - `RedpandaLog` in `listings-redpanda` (Kafka-compatible, production)
//! - `InMemoryLog` in `listings-testing` (deterministic, for tests)

use crate::delivery::Delivery;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during durable log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the log
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The log refused or failed to persist a publish
    #[error("Publish failed for subject '{subject}': {reason}")]
    PublishFailed {
        /// Subject the publish targeted
        subject: String,
        /// The reason for failure
        reason: String,
    },

    /// No stream binds the subject
    #[error("No stream binds subject '{0}'")]
    UnknownSubject(String),

    /// The named stream does not exist
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// The named durable consumer does not exist
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Another instance is already consuming from this durable consumer
    #[error("Consumer '{0}' already has an active subscriber")]
    ConsumerBusy(String),

    /// Creating or subscribing a consumer failed
    #[error("Subscription failed for consumer '{consumer}': {reason}")]
    SubscriptionFailed {
        /// The consumer name
        consumer: String,
        /// The reason for failure
        reason: String,
    },

    /// The log rejected an acknowledgment
    #[error("Acknowledgment failed: {0}")]
    AckFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Generic error for other failures
    #[error("Event bus error: {0}")]
    Other(String),
}

/// A named stream and the subjects it binds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name
    pub name: String,
    /// Subjects appended to this stream
    pub subjects: Vec<String>,
}

impl StreamConfig {
    /// Create a stream binding the given subjects.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
        }
    }

    /// Name of this stream's dead-letter subject: `<stream>.dead_letter`.
    #[must_use]
    pub fn dead_letter_subject(&self) -> String {
        format!("{}.dead_letter", self.name)
    }

    /// Also bind the dead-letter subject.
    #[must_use]
    pub fn with_dead_letter(mut self) -> Self {
        let subject = self.dead_letter_subject();
        if !self.subjects.contains(&subject) {
            self.subjects.push(subject);
        }
        self
    }

    /// Whether this stream binds `subject`.
    #[must_use]
    pub fn binds(&self, subject: &str) -> bool {
        self.subjects.iter().any(|s| s == subject)
    }
}

/// How deliveries must be acknowledged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckPolicy {
    /// Every delivery is acknowledged individually by the consumer
    #[default]
    Explicit,
}

/// Redelivery and dead-letter policy for a durable consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    /// Maximum number of delivery attempts per message (at least 1)
    pub max_deliver: u32,
    /// Subject that receives permanently failed messages
    pub dead_letter_subject: Option<String>,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliver: 1,
            dead_letter_subject: None,
        }
    }
}

impl DeliveryPolicy {
    /// Set the attempt ceiling. Values below 1 are raised to 1.
    #[must_use]
    pub fn max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver.max(1);
        self
    }

    /// Send permanently failed messages to `subject`.
    #[must_use]
    pub fn dead_letter(mut self, subject: impl Into<String>) -> Self {
        self.dead_letter_subject = Some(subject.into());
        self
    }

    /// Whether a message negatively acknowledged on `attempt` gets another delivery.
    #[must_use]
    pub const fn should_redeliver(&self, attempt: u32) -> bool {
        attempt < self.max_deliver
    }
}

/// Configuration of a durable consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Stream the consumer reads from
    pub stream: String,
    /// Durable consumer name
    pub name: String,
    /// Subject the consumer is bound to
    pub subject_filter: String,
    /// Acknowledgment policy
    pub ack_policy: AckPolicy,
    /// Redelivery policy
    pub delivery: DeliveryPolicy,
}

impl ConsumerConfig {
    /// Explicit-ack consumer with the default single-attempt policy.
    #[must_use]
    pub fn new(
        stream: impl Into<String>,
        name: impl Into<String>,
        subject_filter: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            name: name.into(),
            subject_filter: subject_filter.into(),
            ack_policy: AckPolicy::Explicit,
            delivery: DeliveryPolicy::default(),
        }
    }

    /// Replace the delivery policy.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }
}

/// Result of [`DurableLog::create_or_update_consumer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// A new consumer was registered
    Created,
    /// An existing consumer had a different configuration and was updated
    Updated,
    /// An identical consumer already existed
    Unchanged,
}

/// Durable-write acknowledgment returned by a publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream the message was appended to
    pub stream: String,
    /// Subject the message was appended under
    pub subject: String,
    /// Position of the message in the log
    pub sequence: u64,
}

/// Stream of deliveries from a durable consumer.
///
/// Dropping the stream releases the consumer so another instance can attach.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// A durable, subject-addressed log.
///
/// Methods return boxed futures so the trait stays object safe and can be
/// shared as `Arc<dyn DurableLog>`.
pub trait DurableLog: Send + Sync {
    /// Create the stream, or update its subject bindings if it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the log cannot be reached or rejects the
    /// configuration.
    fn ensure_stream(
        &self,
        config: &StreamConfig,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Append `payload` under `subject`, resolving once the write is durable.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnknownSubject`] if no stream binds the
    /// subject, or [`EventBusError::PublishFailed`] if the write fails.
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, EventBusError>> + Send + '_>>;

    /// Register a durable consumer, idempotently.
    ///
    /// The same name with the same configuration is a no-op; the same name
    /// with a different configuration updates the consumer in place.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::StreamNotFound`] if the stream is missing, or
    /// [`EventBusError::SubscriptionFailed`] if the filter is not bound by it.
    fn create_or_update_consumer(
        &self,
        config: &ConsumerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ConsumerStatus, EventBusError>> + Send + '_>>;

    /// Attach to a durable consumer and stream its deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConsumerNotFound`] if the consumer was never
    /// registered, or [`EventBusError::ConsumerBusy`] if another subscriber
    /// holds it.
    fn consume(
        &self,
        consumer: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>>;
}
