//! Listing view read model.
//!
//! # Overview
//!
//! - [`postgres`]: `PostgreSQL` [`ProjectionStore`](listings_core::projection::ProjectionStore)
//! - [`handlers`]: projects `user.created` and `listing.created` into the store
//! - [`service`]: the paginated listing query served over HTTP
//!
//! ```text
//! Subscription ──► ListingViewProjector ──► PostgresProjectionStore ◄── ListingViewService ◄── GET /listings
//! ```

pub mod handlers;
pub mod postgres;
pub mod service;

pub use handlers::ListingViewProjector;
pub use postgres::PostgresProjectionStore;
pub use service::{ListingView, ListingViewService, ListingsResponse, UserView};
