//! # Listings Testing
//!
//! Testing utilities for the listings platform.
//!
//! This crate provides:
//! - [`InMemoryLog`]: a complete in-process [`DurableLog`](listings_core::event_bus::DurableLog)
//!   with durable consumers, redelivery and dead-lettering
//! - [`InMemoryProjectionStore`]: a [`ProjectionStore`](listings_core::projection::ProjectionStore)
//!   with the same upsert and insert-only rules as the Postgres store
//! - [`fixtures`]: events and read-model rows with deterministic timestamps
//!
//! ## Example
//!
//! ```ignore
//! use listings_testing::{InMemoryLog, InMemoryProjectionStore, fixtures};
//!
//! #[tokio::test]
//! async fn projects_listing() {
//!     let log = InMemoryLog::new();
//!     let store = InMemoryProjectionStore::new();
//!     // wire a subscription, publish fixtures::user_created(1, "John Doe"), ...
//! }
//! ```

pub mod event_bus;
pub mod fixtures;
pub mod projection_mocks;

pub use event_bus::{InMemoryLog, SettlementRecord};
pub use projection_mocks::InMemoryProjectionStore;

/// Install a test tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
