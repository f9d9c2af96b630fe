//! Listing view service.
//!
//! Runs two siblings under one shutdown signal:
//!
//! - one subscription per event subject, projecting `user.created` and
//!   `listing.created` into the read model
//! - the HTTP server answering `GET /listings` from that read model

pub mod config;
pub mod http;

use listings_core::event::{LISTING_CREATED, ListingCreated, USER_CREATED, UserCreated};
use listings_core::projection::ProjectionStore;
use listings_projections::ListingViewProjector;
use listings_runtime::{HandlerRegistry, RegistryError};
use std::sync::Arc;

/// Subjects this service must handle before it may start consuming.
pub const SUBJECTS: [&str; 2] = [USER_CREATED, LISTING_CREATED];

/// Durable consumer name prefix.
pub const CONSUMER_PREFIX: &str = "listing-view";

/// Registry routing both event subjects to one projector over `store`.
///
/// # Errors
///
/// Returns [`RegistryError`] if a subject ends up without a handler.
pub fn build_registry<S: ProjectionStore + 'static>(store: Arc<S>) -> Result<HandlerRegistry, RegistryError> {
    let projector = ListingViewProjector::new(store);

    let mut registry = HandlerRegistry::new();
    registry.register::<UserCreated>(Arc::new(projector.clone()))?;
    registry.register::<ListingCreated>(Arc::new(projector))?;
    registry.verify(&SUBJECTS)?;

    Ok(registry)
}
