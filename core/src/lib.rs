//! # Listings Core
//!
//! Core contracts for the listings platform.
//!
//! The platform is a set of services that talk through a durable,
//! subject-addressed log and keep a denormalized read model of listings
//! (each listing embedding a snapshot of its owner). This crate holds the
//! pieces every other crate agrees on:
//!
//! - [`event`]: the domain events and their JSON wire format
//! - [`event_bus`]: the [`DurableLog`](event_bus::DurableLog) contract (streams,
//!   durable consumers, publish acknowledgments)
//! - [`delivery`]: a single delivery of a message and its acknowledgment lifecycle
//! - [`middleware`]: typed handlers and the middleware chain around them
//! - [`projection`]: read-model entities and the [`ProjectionStore`](projection::ProjectionStore) contract
//!
//! ## Flow
//!
//! ```text
//! Publisher ──► DurableLog ──► Subscription ──► Middleware ──► Handler ──► ProjectionStore
//! ```
//!
//! Implementations live elsewhere: `listings-redpanda` (Kafka-compatible log),
//! `listings-projections` (Postgres read model), `listings-testing` (in-memory
//! versions of both).

// Re-export commonly used types
pub use serde::{Deserialize, Serialize};

pub mod delivery;
pub mod event;
pub mod event_bus;
pub mod middleware;
pub mod projection;

pub use delivery::{AckError, Acknowledger, Delivery, DeliveryState, Settlement};
pub use event::{DecodeError, DomainEvent, Event, ListingCreated, UserCreated};
pub use event_bus::{
    ConsumerConfig, ConsumerStatus, DeliveryPolicy, DeliveryStream, DurableLog, EventBusError,
    PublishAck, StreamConfig,
};
pub use middleware::{AutoAck, Handler, HandlerError, Logging, Middleware};
pub use projection::{
    ListingPage, ListingProjection, ListingQuery, ProjectionError, ProjectionStore, UserProjection,
    UserSnapshot,
};

/// Current time as microseconds since the Unix epoch, the timestamp unit
/// carried by every event and read-model row.
#[must_use]
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
