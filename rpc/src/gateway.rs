//! Public listing operations composed from the service clients.

use crate::clients::{ListingServiceClient, ListingViewServiceClient, UserServiceClient};
use crate::context::CallContext;
use crate::dto::{CreateListingRequest, GetAllListingsRequest, GetAllListingsResponse, ListingResponse};
use crate::error::RpcError;

/// Listing flows exposed by the API gateway.
#[derive(Clone, Debug)]
pub struct ListingGateway {
    users: UserServiceClient,
    listings: ListingServiceClient,
    views: ListingViewServiceClient,
}

impl ListingGateway {
    /// Compose the gateway from its three dependencies.
    #[must_use]
    pub const fn new(
        users: UserServiceClient,
        listings: ListingServiceClient,
        views: ListingViewServiceClient,
    ) -> Self {
        Self { users, listings, views }
    }

    /// Create a listing after confirming its owner exists.
    ///
    /// The listing service is not called when the user lookup fails.
    ///
    /// # Errors
    ///
    /// The user lookup's error (for example a 404 rejection), or the
    /// listing service's.
    pub async fn create_listing(
        &self,
        ctx: &CallContext,
        request: &CreateListingRequest,
    ) -> Result<ListingResponse, RpcError> {
        let owner = self.users.get_user_by_id(ctx, request.user_id).await?;
        tracing::debug!(user_id = owner.id, "Listing owner confirmed");

        self.listings.create_listing(ctx, request).await
    }

    /// One page of listings from the read model.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`] from the listing view service.
    pub async fn get_all_listings(
        &self,
        ctx: &CallContext,
        request: &GetAllListingsRequest,
    ) -> Result<GetAllListingsResponse, RpcError> {
        self.views.get_all_listings(ctx, request).await
    }

    /// The user service client, for user operations the gateway forwards
    /// as-is.
    #[must_use]
    pub const fn users(&self) -> &UserServiceClient {
        &self.users
    }
}
