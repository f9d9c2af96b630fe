//! User service.
//!
//! Owns the `users` table. Every created user is staged as a `user.created`
//! outbox entry in the same transaction; the outbox relay running alongside
//! the HTTP server publishes it to the durable log.

pub mod config;
pub mod http;
pub mod store;

pub use store::{PostgresUserStore, User, UserStore, UserStoreError};
