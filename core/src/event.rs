//! Domain events and their wire format.
//!
//! Events are immutable facts published under a subject. The subject decides
//! which handler receives them; the payload is the JSON encoding of one of
//! the event structs below.
//!
//! # Wire format
//!
//! Payloads are plain JSON so that services in any language can read them.
//! Timestamps are integer microseconds since the Unix epoch.
//!
//! ```json
//! {"id":1,"name":"John Doe","email":"john@example.com","created_at":1700000000000000,"updated_at":1700000000000000}
//! ```
//!
//! # Example
//!
//! ```
//! use listings_core::event::{Event, UserCreated};
//!
//! let event = UserCreated {
//!     id: 1,
//!     name: "John Doe".to_string(),
//!     email: "john@example.com".to_string(),
//!     created_at: 0,
//!     updated_at: 0,
//! };
//!
//! let bytes = event.encode()?;
//! let decoded = UserCreated::decode(&bytes)?;
//! assert_eq!(decoded, event);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use thiserror::Error;

/// Subject carrying [`UserCreated`] events.
pub const USER_CREATED: &str = "user.created";

/// Subject carrying [`ListingCreated`] events.
pub const LISTING_CREATED: &str = "listing.created";

/// Errors produced while encoding or decoding an event payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The event could not be serialized.
    #[error("Failed to encode event for subject '{subject}': {reason}")]
    Encode {
        /// Subject the event was bound for
        subject: String,
        /// Underlying serializer message
        reason: String,
    },

    /// The payload was not a valid encoding of the expected event.
    #[error("Failed to decode payload for subject '{subject}': {reason}")]
    Decode {
        /// Subject the payload arrived on
        subject: String,
        /// Underlying deserializer message
        reason: String,
    },
}

/// A typed domain event bound to exactly one subject.
///
/// The subject is an associated constant so routing tables can be checked
/// when handlers are registered rather than when a message arrives.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Subject this event is published under.
    const SUBJECT: &'static str;

    /// Encode this event to its JSON wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Encode`] if serialization fails.
    fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        serde_json::to_vec(self).map_err(|e| DecodeError::Encode {
            subject: Self::SUBJECT.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode an event from its JSON wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Decode`] if the payload is malformed or does
    /// not match the event schema.
    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(payload).map_err(|e| DecodeError::Decode {
            subject: Self::SUBJECT.to_string(),
            reason: e.to_string(),
        })
    }
}

/// A user account was created in the user service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    /// User id
    pub id: i64,
    /// Display name
    pub name: String,
    /// Contact email
    #[serde(default)]
    pub email: String,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time (unix micros)
    pub updated_at: i64,
}

impl Event for UserCreated {
    const SUBJECT: &'static str = USER_CREATED;
}

/// A listing was created in the listing service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCreated {
    /// Listing id
    pub id: i64,
    /// Owner's user id
    pub user_id: i64,
    /// Listing type, e.g. `"rent"` or `"sale"`
    pub listing_type: String,
    /// Price in minor currency units
    pub price: i64,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time (unix micros)
    pub updated_at: i64,
}

impl Event for ListingCreated {
    const SUBJECT: &'static str = LISTING_CREATED;
}

/// A message as delivered by the durable log.
///
/// `delivery_attempt` starts at 1 and grows by one each time the log
/// redelivers the same message after a negative acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainEvent {
    /// Subject the message was published under
    pub subject: String,
    /// Encoded payload
    pub payload: Vec<u8>,
    /// 1-based delivery attempt
    pub delivery_attempt: u32,
    /// Transport headers (dead-letter provenance and the like)
    pub headers: BTreeMap<String, String>,
}

impl DomainEvent {
    /// Create a first-attempt message with no headers.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            delivery_attempt: 1,
            headers: BTreeMap::new(),
        }
    }

    /// Set the delivery attempt.
    #[must_use]
    pub const fn with_attempt(mut self, delivery_attempt: u32) -> Self {
        self.delivery_attempt = delivery_attempt;
        self
    }

    /// Add a transport header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Decode the payload as `E`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Decode`] if the subject does not belong to `E`
    /// or the payload does not parse.
    pub fn decode<E: Event>(&self) -> Result<E, DecodeError> {
        if self.subject != E::SUBJECT {
            return Err(DecodeError::Decode {
                subject: self.subject.clone(),
                reason: format!("expected subject '{}'", E::SUBJECT),
            });
        }
        E::decode(&self.payload)
    }
}

/// Header naming the subject a dead-lettered message was originally published on.
pub const HEADER_ORIGINAL_SUBJECT: &str = "x-original-subject";

/// Header carrying the reason a message was dead-lettered.
pub const HEADER_FAILURE_REASON: &str = "x-failure-reason";

/// Header carrying the delivery attempt across redeliveries.
pub const HEADER_DELIVERY_ATTEMPT: &str = "x-delivery-attempt";
