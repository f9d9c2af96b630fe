//! Projection handlers for the listing view.
//!
//! [`ListingViewProjector`] turns `user.created` and `listing.created` events
//! into read-model writes. It implements [`Handler`] for both event types so
//! the same projector can be registered under each subject.

use listings_core::delivery::Delivery;
use listings_core::event::{ListingCreated, UserCreated};
use listings_core::middleware::{Handler, HandlerError, HandlerResult};
use listings_core::projection::{ListingProjection, ProjectionError, ProjectionStore, Result, UserProjection};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Projects user and listing events into a [`ProjectionStore`].
pub struct ListingViewProjector<S> {
    store: Arc<S>,
}

impl<S> Clone for ListingViewProjector<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ProjectionStore> ListingViewProjector<S> {
    /// Create a projector writing to `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Upsert the user's projection. Replaying the same event leaves the
    /// row unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the write fails.
    pub async fn on_user_created(&self, event: &UserCreated) -> Result<()> {
        let user = UserProjection {
            id: event.id,
            name: event.name.clone(),
            created_at: event.created_at,
            updated_at: event.updated_at,
        };
        self.store.upsert_user(&user).await?;

        tracing::debug!(user_id = event.id, "User projection upserted");
        Ok(())
    }

    /// Insert the listing with a snapshot of its owner as currently
    /// projected.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::UserNotFound`] if the owner has not been
    /// projected yet, [`ProjectionError::Conflict`] if the listing already
    /// exists, or [`ProjectionError::Storage`] if the backend fails.
    pub async fn on_listing_created(&self, event: &ListingCreated) -> Result<()> {
        let owner = self
            .store
            .get_user(event.user_id)
            .await?
            .ok_or(ProjectionError::UserNotFound(event.user_id))?;

        let listing = ListingProjection {
            id: event.id,
            user_id: event.user_id,
            listing_type: event.listing_type.clone(),
            price: event.price,
            created_at: event.created_at,
            updated_at: event.updated_at,
            user: owner.snapshot(),
        };
        self.store.insert_listing(&listing).await?;

        tracing::debug!(listing_id = event.id, user_id = event.user_id, "Listing projection inserted");
        Ok(())
    }
}

impl<S: ProjectionStore + 'static> Handler<UserCreated> for ListingViewProjector<S> {
    fn handle<'a>(
        &'a self,
        _delivery: &'a Delivery,
        event: UserCreated,
    ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>> {
        Box::pin(async move { self.on_user_created(&event).await.map_err(HandlerError::from) })
    }
}

impl<S: ProjectionStore + 'static> Handler<ListingCreated> for ListingViewProjector<S> {
    fn handle<'a>(
        &'a self,
        _delivery: &'a Delivery,
        event: ListingCreated,
    ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>> {
        Box::pin(async move { self.on_listing_created(&event).await.map_err(HandlerError::from) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use listings_testing::{InMemoryProjectionStore, fixtures};

    fn projector() -> (ListingViewProjector<InMemoryProjectionStore>, Arc<InMemoryProjectionStore>) {
        let store = Arc::new(InMemoryProjectionStore::new());
        (ListingViewProjector::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn duplicate_user_created_is_idempotent() {
        let (projector, store) = projector();
        let event = fixtures::user_created(1, "John Doe");

        projector.on_user_created(&event).await.unwrap();
        let first = store.get_user(1).await.unwrap();
        projector.on_user_created(&event).await.unwrap();

        assert_eq!(store.user_count(), 1);
        assert_eq!(store.get_user(1).await.unwrap(), first);
    }

    #[tokio::test]
    async fn listing_for_unknown_user_is_retryable_and_writes_nothing() {
        let (projector, store) = projector();

        let error = projector
            .on_listing_created(&fixtures::listing_created(5, 1, "rent", 1000))
            .await
            .unwrap_err();

        assert_eq!(error, ProjectionError::UserNotFound(1));
        assert!(HandlerError::from(error).is_retryable());
        assert_eq!(store.listing_count(), 0);
    }

    #[tokio::test]
    async fn listing_embeds_owner_as_projected_at_processing_time() {
        let (projector, store) = projector();
        projector
            .on_user_created(&fixtures::user_created(1, "John Doe"))
            .await
            .unwrap();
        projector
            .on_listing_created(&fixtures::listing_created(5, 1, "rent", 1000))
            .await
            .unwrap();

        let mut renamed = fixtures::user_created(1, "Jane Doe");
        renamed.updated_at += 10;
        projector.on_user_created(&renamed).await.unwrap();

        let listing = store.listing(5).unwrap();
        assert_eq!(listing.user.name, "John Doe");
        assert_eq!(listing.user.updated_at, fixtures::BASE_TIME);
        assert_eq!(store.get_user(1).await.unwrap().unwrap().name, "Jane Doe");
    }

    #[tokio::test]
    async fn duplicate_listing_is_a_permanent_failure() {
        let (projector, _) = projector();
        projector
            .on_user_created(&fixtures::user_created(1, "John Doe"))
            .await
            .unwrap();
        let event = fixtures::listing_created(5, 1, "rent", 1000);
        projector.on_listing_created(&event).await.unwrap();

        let error = projector.on_listing_created(&event).await.unwrap_err();

        assert!(matches!(error, ProjectionError::Conflict(_)));
        assert!(!HandlerError::from(error).is_retryable());
    }

    #[tokio::test]
    async fn storage_outage_is_retryable() {
        let (projector, store) = projector();
        store.set_unavailable(true);

        let error = projector
            .on_user_created(&fixtures::user_created(1, "John Doe"))
            .await
            .unwrap_err();

        assert!(matches!(error, ProjectionError::Storage(_)));
        assert!(error.is_retryable());
    }
}
