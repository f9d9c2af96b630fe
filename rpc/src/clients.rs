//! Typed clients for the services the gateway depends on.

use crate::classify::{multi_error, single_error};
use crate::client::RpcClient;
use crate::context::CallContext;
use crate::dto::{
    CreateListingRequest, CreateUserRequest, GetAllListingsRequest, GetAllListingsResponse, ListingEnvelope,
    ListingResponse, UserEnvelope, UserResponse,
};
use crate::error::RpcError;
use crate::transport::RpcRequest;

/// Client for the user service.
#[derive(Clone, Debug)]
pub struct UserServiceClient {
    rpc: RpcClient,
}

impl UserServiceClient {
    /// Wrap an [`RpcClient`] pointed at the user service.
    #[must_use]
    pub const fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    /// `POST /users` with a form-encoded name.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`]; rejections carry the service's `error` message.
    pub async fn create_user(&self, ctx: &CallContext, request: &CreateUserRequest) -> Result<UserResponse, RpcError> {
        let call = RpcRequest::post("/users").form_field("name", &request.name);
        let response = self.rpc.call(ctx, &call, single_error).await?;
        Ok(response.json::<UserEnvelope>()?.user)
    }

    /// `GET /users/{id}`.
    ///
    /// # Errors
    ///
    /// [`RpcError::Rejected`] with status 404 if the user does not exist,
    /// or any other [`RpcError`].
    pub async fn get_user_by_id(&self, ctx: &CallContext, user_id: i64) -> Result<UserResponse, RpcError> {
        let call = RpcRequest::get(format!("/users/{user_id}"));
        let response = self.rpc.call(ctx, &call, single_error).await?;
        Ok(response.json::<UserEnvelope>()?.user)
    }
}

/// Client for the listing service.
#[derive(Clone, Debug)]
pub struct ListingServiceClient {
    rpc: RpcClient,
}

impl ListingServiceClient {
    /// Wrap an [`RpcClient`] pointed at the listing service.
    #[must_use]
    pub const fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    /// `POST /listings` with a form body. The listing service reports
    /// validation failures as an `errors` array.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn create_listing(
        &self,
        ctx: &CallContext,
        request: &CreateListingRequest,
    ) -> Result<ListingResponse, RpcError> {
        let call = RpcRequest::post("/listings")
            .form_field("price", request.price)
            .form_field("user_id", request.user_id)
            .form_field("listing_type", &request.listing_type);
        let response = self.rpc.call(ctx, &call, multi_error).await?;
        Ok(response.json::<ListingEnvelope>()?.listing)
    }
}

/// Client for the listing view service.
#[derive(Clone, Debug)]
pub struct ListingViewServiceClient {
    rpc: RpcClient,
}

impl ListingViewServiceClient {
    /// Wrap an [`RpcClient`] pointed at the listing view service.
    #[must_use]
    pub const fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    /// `GET /listings?page_num=..&page_size=..[&user_id=..]`.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`].
    pub async fn get_all_listings(
        &self,
        ctx: &CallContext,
        request: &GetAllListingsRequest,
    ) -> Result<GetAllListingsResponse, RpcError> {
        let mut call = RpcRequest::get("/listings")
            .query("page_num", request.page_number)
            .query("page_size", request.page_size);
        if let Some(user_id) = request.user_id {
            call = call.query("user_id", user_id);
        }

        let response = self.rpc.call(ctx, &call, single_error).await?;
        response.json()
    }
}
