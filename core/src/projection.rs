//! The listings read model.
//!
//! The read model is a denormalized, query-optimized view built from
//! `user.created` and `listing.created` events:
//!
//! - [`UserProjection`] mirrors each user. It is upserted by id, so replays
//!   and duplicate deliveries converge on the same row.
//! - [`ListingProjection`] is insert-only and embeds a [`UserSnapshot`] of its
//!   owner taken when the listing event was processed. The snapshot is a
//!   point-in-time copy and is never re-synchronized with later user changes.
//!
//! ```text
//! Write side (events)              Read side (projection store)
//! ┌────────────────┐  upsert       ┌──────────────────────────┐
//! │ user.created   │ ────────────► │ users                    │
//! └────────────────┘               └────────────┬─────────────┘
//!                                               │ lookup (outside tx)
//! ┌────────────────┐  insert       ┌────────────▼─────────────┐
//! │ listing.created│ ────────────► │ listings (+ user_detail) │
//! └────────────────┘               └──────────────────────────┘
//! ```
//!
//! Only the [`ProjectionStore`] mutates these tables.

use crate::middleware::HandlerError;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Largest page a listing query may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Page size used when a query does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Error type for projection operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The listing references a user the read model has not seen yet
    #[error("User not found: {0}")]
    UserNotFound(i64),

    /// A row with the same key already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The query parameters are out of range
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl ProjectionError {
    /// Whether the failing event might project successfully on redelivery.
    ///
    /// A missing user is retryable: the `user.created` event may simply not
    /// have been processed yet. Storage errors are assumed transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::UserNotFound(_) | Self::Storage(_))
    }
}

impl From<ProjectionError> for HandlerError {
    fn from(error: ProjectionError) -> Self {
        if error.is_retryable() {
            Self::Retryable(error.to_string())
        } else {
            Self::Permanent(error.to_string())
        }
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Read-model row for a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProjection {
    /// User id
    pub id: i64,
    /// Display name
    pub name: String,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time (unix micros)
    pub updated_at: i64,
}

impl UserProjection {
    /// Copy of this user to embed in a listing.
    #[must_use]
    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time copy of a user, embedded in each listing row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    /// User id
    pub id: i64,
    /// Display name at snapshot time
    pub name: String,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time at snapshot time (unix micros)
    pub updated_at: i64,
}

/// Read-model row for a listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingProjection {
    /// Listing id
    pub id: i64,
    /// Owner's user id
    pub user_id: i64,
    /// Listing type
    pub listing_type: String,
    /// Price in minor currency units
    pub price: i64,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time (unix micros)
    pub updated_at: i64,
    /// Owner as it was when the listing was projected
    pub user: UserSnapshot,
}

/// Offset-paginated listing query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingQuery {
    /// 1-based page number
    pub page_number: u32,
    /// Rows per page
    pub page_size: u32,
    /// Only listings owned by this user
    pub user_id: Option<i64>,
}

impl Default for ListingQuery {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: DEFAULT_PAGE_SIZE,
            user_id: None,
        }
    }
}

impl ListingQuery {
    /// Query for one page.
    #[must_use]
    pub const fn new(page_number: u32, page_size: u32) -> Self {
        Self {
            page_number,
            page_size,
            user_id: None,
        }
    }

    /// Restrict to one owner.
    #[must_use]
    pub const fn for_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Check the page bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidQuery`] if the page number is 0 or
    /// the page size is outside `1..=MAX_PAGE_SIZE`.
    pub fn validate(&self) -> Result<()> {
        if self.page_number == 0 {
            return Err(ProjectionError::InvalidQuery(
                "page_num must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ProjectionError::InvalidQuery(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    /// Rows to skip: `(page_number - 1) * page_size`.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page_number.saturating_sub(1)) * u64::from(self.page_size)
    }
}

/// One page of listings plus the total matching the filter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPage {
    /// Listings on this page, newest first
    pub listings: Vec<ListingProjection>,
    /// Number of listings matching the filter across all pages
    pub total: u64,
}

/// Transactional persistence for the read model.
///
/// Each write runs in its own short transaction. Implementations must be
/// safe to call concurrently.
pub trait ProjectionStore: Send + Sync {
    /// Fetch a user projection by id.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the backend fails.
    fn get_user(&self, id: i64) -> impl Future<Output = Result<Option<UserProjection>>> + Send;

    /// Insert a user, or update its name and `updated_at` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the backend fails.
    fn upsert_user(&self, user: &UserProjection) -> impl Future<Output = Result<()>> + Send;

    /// Insert a listing. Never overwrites.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Conflict`] if the id already exists, or
    /// [`ProjectionError::Storage`] if the backend fails.
    fn insert_listing(&self, listing: &ListingProjection) -> impl Future<Output = Result<()>> + Send;

    /// Page through listings, newest first.
    ///
    /// An offset past the last row yields an empty page.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidQuery`] for out-of-range paging, or
    /// [`ProjectionError::Storage`] if the backend fails.
    fn list_listings(&self, query: &ListingQuery) -> impl Future<Output = Result<ListingPage>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn second_page_skips_first_page() {
        assert_eq!(ListingQuery::new(2, 10).offset(), 10);
        assert_eq!(ListingQuery::new(1, 10).offset(), 0);
    }

    #[test]
    fn validate_rejects_zero_page() {
        assert!(ListingQuery::new(0, 10).validate().is_err());
        assert!(ListingQuery::new(1, 0).validate().is_err());
        assert!(ListingQuery::new(1, MAX_PAGE_SIZE + 1).validate().is_err());
        assert!(ListingQuery::new(1, MAX_PAGE_SIZE).validate().is_ok());
    }

    #[test]
    fn missing_user_is_retryable() {
        let error: HandlerError = ProjectionError::UserNotFound(9).into();
        assert!(error.is_retryable());

        let error: HandlerError = ProjectionError::Conflict("listing 5".to_string()).into();
        assert!(!error.is_retryable());
    }

    proptest! {
        #[test]
        fn offset_matches_page_arithmetic(page in 1u32..10_000, size in 1u32..=MAX_PAGE_SIZE) {
            let query = ListingQuery::new(page, size);
            prop_assert_eq!(query.offset(), u64::from(page - 1) * u64::from(size));
            prop_assert!(query.validate().is_ok());
        }
    }
}
