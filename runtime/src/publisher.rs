//! Publishing events to the durable log.
//!
//! [`Publisher`] encodes an event to its JSON wire payload and appends it
//! under a subject, resolving once the log confirms the write is durable.
//! It never retries: a failed publish is returned to the caller, which
//! decides whether to retry (the outbox relay, for example, leaves the row
//! unsent and tries again on its next poll).

use crate::metrics::PublishMetrics;
use listings_core::event::Event;
use listings_core::event_bus::{DurableLog, EventBusError, PublishAck};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`Publisher`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The event could not be serialized
    #[error("Failed to encode event for subject '{subject}': {reason}")]
    Encode {
        /// Target subject
        subject: String,
        /// Serializer message
        reason: String,
    },

    /// The log was unreachable or rejected the write
    #[error(transparent)]
    Log(#[from] EventBusError),
}

/// Encodes and appends events to a [`DurableLog`].
#[derive(Clone)]
pub struct Publisher {
    log: Arc<dyn DurableLog>,
}

impl Publisher {
    /// Create a publisher over `log`.
    #[must_use]
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self { log }
    }

    /// Serialize `event` as JSON and append it under `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Encode`] if serialization fails, or
    /// [`PublishError::Log`] if the log is unreachable or no stream binds
    /// the subject.
    pub async fn publish<T>(&self, subject: &str, event: &T) -> Result<PublishAck, PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(event).map_err(|e| PublishError::Encode {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;
        self.publish_raw(subject, &payload).await
    }

    /// Append a typed event under its own subject.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn publish_event<E: Event>(&self, event: &E) -> Result<PublishAck, PublishError> {
        self.publish(E::SUBJECT, event).await
    }

    /// Append an already encoded payload.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Log`] if the log rejects the write.
    pub async fn publish_raw(&self, subject: &str, payload: &[u8]) -> Result<PublishAck, PublishError> {
        match self.log.publish(subject, payload).await {
            Ok(ack) => {
                PublishMetrics::record_publish(subject);
                tracing::debug!(
                    subject = %subject,
                    stream = %ack.stream,
                    sequence = ack.sequence,
                    "Event published"
                );
                Ok(ack)
            },
            Err(e) => {
                PublishMetrics::record_error(subject);
                tracing::error!(subject = %subject, error = %e, "Failed to publish event");
                Err(PublishError::Log(e))
            },
        }
    }
}
