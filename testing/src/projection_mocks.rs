//! In-memory projection store.
//!
//! [`InMemoryProjectionStore`] follows the same rules as the Postgres store:
//! users are upserted, listings are insert-only, and pages come back newest
//! first. It can also be switched into a failing mode to exercise the
//! retryable storage-error path.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use listings_core::projection::{
    ListingPage, ListingProjection, ListingQuery, ProjectionError, ProjectionStore, Result,
    UserProjection,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<i64, UserProjection>,
    listings: HashMap<i64, ListingProjection>,
}

/// In-memory projection store for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use listings_testing::InMemoryProjectionStore;
/// use listings_core::projection::{ProjectionStore, UserProjection};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryProjectionStore::new();
/// store
///     .upsert_user(&UserProjection { id: 1, name: "John Doe".into(), created_at: 0, updated_at: 0 })
///     .await?;
///
/// assert!(store.get_user(1).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionStore {
    tables: Arc<RwLock<Tables>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryProjectionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of user rows.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.tables.read().unwrap().users.len()
    }

    /// Number of listing rows.
    #[must_use]
    pub fn listing_count(&self) -> usize {
        self.tables.read().unwrap().listings.len()
    }

    /// Fetch a listing row by id.
    #[must_use]
    pub fn listing(&self, id: i64) -> Option<ListingProjection> {
        self.tables.read().unwrap().listings.get(&id).cloned()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProjectionError::Storage("store unavailable".to_string()));
        }
        Ok(())
    }
}

impl ProjectionStore for InMemoryProjectionStore {
    async fn get_user(&self, id: i64) -> Result<Option<UserProjection>> {
        self.check_available()?;
        Ok(self.tables.read().unwrap().users.get(&id).cloned())
    }

    async fn upsert_user(&self, user: &UserProjection) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write().unwrap();
        tables
            .users
            .entry(user.id)
            .and_modify(|existing| {
                existing.name.clone_from(&user.name);
                existing.updated_at = user.updated_at;
            })
            .or_insert_with(|| user.clone());
        Ok(())
    }

    async fn insert_listing(&self, listing: &ListingProjection) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write().unwrap();
        if tables.listings.contains_key(&listing.id) {
            return Err(ProjectionError::Conflict(format!(
                "listing {} already exists",
                listing.id
            )));
        }
        tables.listings.insert(listing.id, listing.clone());
        Ok(())
    }

    async fn list_listings(&self, query: &ListingQuery) -> Result<ListingPage> {
        self.check_available()?;
        query.validate()?;

        let tables = self.tables.read().unwrap();
        let mut matching: Vec<&ListingProjection> = tables
            .listings
            .values()
            .filter(|l| query.user_id.is_none_or(|user_id| l.user_id == user_id))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let listings = matching
            .into_iter()
            .skip(offset)
            .take(query.page_size as usize)
            .cloned()
            .collect();

        Ok(ListingPage { listings, total })
    }
}
