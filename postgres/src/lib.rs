//! `PostgreSQL` transactional outbox for the listings platform.
//!
//! A service that changes its own tables and must announce the change
//! stages the event in `outbox_events` inside the same transaction, so
//! either both commit or neither does. [`OutboxRelay`] later publishes
//! staged rows in insertion order and marks them published.
//!
//! # Example
//!
//! ```ignore
//! use listings_postgres::OutboxWriter;
//!
//! let mut tx = pool.begin().await?;
//! let user = insert_user(&mut tx, &request).await?;
//! OutboxWriter::stage_event(&mut tx, &user_created).await?;
//! tx.commit().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod outbox;

pub use outbox::{OutboxError, OutboxRelay, OutboxWriter, RelayConfig, migrate};
