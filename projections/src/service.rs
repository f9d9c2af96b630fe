//! The listing view query.

use listings_core::projection::{ListingProjection, ListingQuery, ProjectionStore, Result, UserSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Owner of a listing as returned to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    /// User id
    pub id: i64,
    /// Display name
    pub name: String,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time (unix micros)
    pub updated_at: i64,
}

/// A listing as returned to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingView {
    /// Listing id
    pub id: i64,
    /// `rent` or `sale`
    pub listing_type: String,
    /// Price
    pub price: i64,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time (unix micros)
    pub updated_at: i64,
    /// Owner snapshot
    pub user: UserView,
}

/// Body of `GET /listings`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingsResponse {
    /// Always `true` on success
    pub result: bool,
    /// Listings on the requested page, newest first
    pub listings: Vec<ListingView>,
    /// Listings matching the filter across all pages
    #[serde(default)]
    pub total: u64,
}

impl From<UserSnapshot> for UserView {
    fn from(user: UserSnapshot) -> Self {
        Self {
            id: user.id,
            name: user.name,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

impl From<ListingProjection> for ListingView {
    fn from(listing: ListingProjection) -> Self {
        Self {
            id: listing.id,
            listing_type: listing.listing_type,
            price: listing.price,
            created_at: listing.created_at,
            updated_at: listing.updated_at,
            user: listing.user.into(),
        }
    }
}

/// Read side of the listing view.
pub struct ListingViewService<S> {
    store: Arc<S>,
}

impl<S> Clone for ListingViewService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ProjectionStore> ListingViewService<S> {
    /// Create a service reading from `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// One page of listings, newest first, optionally for a single owner.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidQuery`](listings_core::projection::ProjectionError::InvalidQuery)
    /// for out-of-range paging, or a storage error from the store.
    pub async fn get_all_listings(&self, query: &ListingQuery) -> Result<ListingsResponse> {
        query.validate()?;
        let page = self.store.list_listings(query).await?;

        Ok(ListingsResponse {
            result: true,
            listings: page.listings.into_iter().map(ListingView::from).collect(),
            total: page.total,
        })
    }
}
