//! Settlement of Kafka deliveries.
//!
//! | Settlement             | Kafka action                                        |
//! |------------------------|-----------------------------------------------------|
//! | ack                    | commit                                              |
//! | nak, attempts left     | append to the consumer's retry topic, commit        |
//! | nak exhausted, or term | append to the dead-letter topic (if any), commit    |
//!
//! Redeliveries go to a retry topic owned by the nak-ing consumer
//! (`<stream>.<consumer>.retry`), so other consumer groups on the same
//! subject never see them. The original subject travels in the
//! `x-original-subject` header.
//!
//! Commits go through the consumer's [`OffsetTracker`] so a slow message
//! is never skipped by a faster one settling after it.

use crate::offsets::{OffsetTracker, RebalanceContext};
use listings_core::delivery::{Acknowledger, DeliveryState, Settlement};
use listings_core::event::{DomainEvent, HEADER_DELIVERY_ATTEMPT, HEADER_FAILURE_REASON, HEADER_ORIGINAL_SUBJECT};
use listings_core::event_bus::{DeliveryPolicy, EventBusError};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// State shared by every delivery of one consumer.
pub(crate) struct ConsumerShared {
    pub(crate) name: String,
    pub(crate) consumer: StreamConsumer<RebalanceContext>,
    pub(crate) retry_topic: String,
    pub(crate) producer: FutureProducer,
    pub(crate) policy: DeliveryPolicy,
    pub(crate) timeout: Duration,
    pub(crate) offsets: Arc<Mutex<OffsetTracker>>,
}

/// Where a delivered message sits in the log.
#[derive(Clone, Debug)]
pub(crate) struct Position {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
}

/// Acknowledger for one Kafka message.
pub(crate) struct KafkaAcknowledger {
    pub(crate) shared: Arc<ConsumerShared>,
    pub(crate) position: Position,
}

/// Build Kafka headers from a header map.
pub(crate) fn to_kafka_headers(headers: &BTreeMap<String, String>) -> OwnedHeaders {
    headers.iter().fold(OwnedHeaders::new(), |acc, (key, value)| {
        acc.insert(Header {
            key,
            value: Some(value.as_str()),
        })
    })
}

/// Delivery attempt carried in `headers`, 1 when absent or malformed.
pub(crate) fn attempt_from_headers(headers: &BTreeMap<String, String>) -> u32 {
    headers
        .get(HEADER_DELIVERY_ATTEMPT)
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|attempt| *attempt >= 1)
        .unwrap_or(1)
}

/// Topic holding redeliveries for one consumer.
pub(crate) fn retry_topic(stream: &str, consumer: &str) -> String {
    format!("{stream}.{consumer}.retry")
}

/// Subject of a message read from `topic`. Messages on the retry topic
/// carry their subject in a header; the record key is the fallback.
pub(crate) fn delivered_subject(
    topic: &str,
    retry_topic: &str,
    key: Option<&[u8]>,
    headers: &BTreeMap<String, String>,
) -> String {
    if topic != retry_topic {
        return topic.to_string();
    }
    headers
        .get(HEADER_ORIGINAL_SUBJECT)
        .cloned()
        .or_else(|| key.map(|key| String::from_utf8_lossy(key).into_owned()))
        .unwrap_or_else(|| topic.to_string())
}

/// Headers for the next delivery attempt of `event`.
pub(crate) fn redelivery_headers(event: &DomainEvent) -> BTreeMap<String, String> {
    let mut headers = event.headers.clone();
    headers.insert(HEADER_ORIGINAL_SUBJECT.to_string(), event.subject.clone());
    headers.insert(
        HEADER_DELIVERY_ATTEMPT.to_string(),
        (event.delivery_attempt + 1).to_string(),
    );
    headers
}

/// Headers for a dead-lettered copy of `event`.
pub(crate) fn dead_letter_headers(event: &DomainEvent, reason: &str) -> BTreeMap<String, String> {
    let mut headers = event.headers.clone();
    headers.insert(HEADER_ORIGINAL_SUBJECT.to_string(), event.subject.clone());
    headers.insert(HEADER_FAILURE_REASON.to_string(), reason.to_string());
    headers.insert(HEADER_DELIVERY_ATTEMPT.to_string(), event.delivery_attempt.to_string());
    headers
}

impl KafkaAcknowledger {
    async fn append(
        &self,
        topic: &str,
        event: &DomainEvent,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), EventBusError> {
        let record = FutureRecord::to(topic)
            .payload(&event.payload)
            .key(&event.subject)
            .headers(to_kafka_headers(headers));

        self.shared
            .producer
            .send(record, Timeout::After(self.shared.timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| EventBusError::PublishFailed {
                subject: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn dead_letter(&self, event: &DomainEvent, reason: &str) -> Result<(), EventBusError> {
        match &self.shared.policy.dead_letter_subject {
            Some(topic) => {
                self.append(topic, event, &dead_letter_headers(event, reason)).await?;
                tracing::warn!(
                    consumer = %self.shared.name,
                    subject = %event.subject,
                    dead_letter = %topic,
                    delivery_attempt = event.delivery_attempt,
                    reason = %reason,
                    "Message dead-lettered"
                );
            },
            None => tracing::warn!(
                consumer = %self.shared.name,
                subject = %event.subject,
                delivery_attempt = event.delivery_attempt,
                reason = %reason,
                "Message permanently failed, no dead-letter subject configured"
            ),
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), EventBusError> {
        let Position {
            topic,
            partition,
            offset,
        } = &self.position;

        let next = self
            .shared
            .offsets
            .lock()
            .map_err(|_| EventBusError::AckFailed("offset tracker poisoned".to_string()))?
            .settled(topic, *partition, *offset);

        let Some(next) = next else {
            return Ok(());
        };

        let mut list = TopicPartitionList::new();
        list.add_partition_offset(topic, *partition, Offset::Offset(next))
            .map_err(|e| EventBusError::AckFailed(e.to_string()))?;
        self.shared
            .consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| EventBusError::AckFailed(e.to_string()))
    }

    async fn settle_inner(&self, event: &DomainEvent, settlement: Settlement) -> Result<DeliveryState, EventBusError> {
        let state = match settlement {
            Settlement::Ack => DeliveryState::Acked,
            Settlement::Nak { reason } if self.shared.policy.should_redeliver(event.delivery_attempt) => {
                self.append(&self.shared.retry_topic, event, &redelivery_headers(event))
                    .await?;
                tracing::debug!(
                    consumer = %self.shared.name,
                    subject = %event.subject,
                    retry_topic = %self.shared.retry_topic,
                    delivery_attempt = event.delivery_attempt,
                    reason = %reason,
                    "Redelivery scheduled"
                );
                DeliveryState::RetryScheduled
            },
            Settlement::Nak { reason } | Settlement::Term { reason } => {
                self.dead_letter(event, &reason).await?;
                DeliveryState::PermanentlyFailed
            },
        };

        self.commit()?;
        Ok(state)
    }
}

impl Acknowledger for KafkaAcknowledger {
    fn settle<'a>(
        &'a self,
        event: &'a DomainEvent,
        settlement: Settlement,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryState, EventBusError>> + Send + 'a>> {
        Box::pin(self.settle_inner(event, settlement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(attempt: u32) -> DomainEvent {
        DomainEvent::new("listing.created", b"{}".to_vec())
            .with_attempt(attempt)
            .with_header("trace-id", "abc")
    }

    #[test]
    fn missing_or_bad_attempt_header_means_first_attempt() {
        let mut headers = BTreeMap::new();
        assert_eq!(attempt_from_headers(&headers), 1);

        headers.insert(HEADER_DELIVERY_ATTEMPT.to_string(), "zero".to_string());
        assert_eq!(attempt_from_headers(&headers), 1);

        headers.insert(HEADER_DELIVERY_ATTEMPT.to_string(), "3".to_string());
        assert_eq!(attempt_from_headers(&headers), 3);
    }

    #[test]
    fn redelivery_increments_attempt_and_keeps_headers() {
        let headers = redelivery_headers(&event(2));

        assert_eq!(attempt_from_headers(&headers), 3);
        assert_eq!(headers.get("trace-id").map(String::as_str), Some("abc"));
        assert_eq!(
            headers.get(HEADER_ORIGINAL_SUBJECT).map(String::as_str),
            Some("listing.created")
        );
    }

    #[test]
    fn retry_topics_are_private_to_each_consumer() {
        let projector = retry_topic("listing_view_event", "listing-view-listing_created");
        let audit = retry_topic("listing_view_event", "audit-listing_created");

        assert_eq!(projector, "listing_view_event.listing-view-listing_created.retry");
        assert_ne!(projector, audit);
        assert_ne!(projector, "listing.created");
    }

    #[test]
    fn redelivered_message_keeps_its_subject() {
        let retry = retry_topic("listing_view_event", "projector");
        let headers = redelivery_headers(&event(1));

        assert_eq!(
            delivered_subject(&retry, &retry, Some(b"listing.created"), &headers),
            "listing.created"
        );
        assert_eq!(
            delivered_subject(&retry, &retry, Some(b"listing.created"), &BTreeMap::new()),
            "listing.created"
        );
        assert_eq!(
            delivered_subject("user.created", &retry, None, &headers),
            "user.created"
        );
    }

    #[test]
    fn dead_letter_records_origin_and_reason() {
        let headers = dead_letter_headers(&event(1), "user not found");

        assert_eq!(
            headers.get(HEADER_ORIGINAL_SUBJECT).map(String::as_str),
            Some("listing.created")
        );
        assert_eq!(
            headers.get(HEADER_FAILURE_REASON).map(String::as_str),
            Some("user not found")
        );
        assert_eq!(attempt_from_headers(&headers), 1);
    }
}
