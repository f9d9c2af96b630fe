//! Public API gateway.
//!
//! Stateless: every request is answered by calling the user, listing and
//! listing view services through [`listings_rpc`]. Creating a listing first
//! confirms its owner exists, so a listing is never forwarded for an
//! unknown user.

pub mod config;
pub mod http;

use listings_rpc::{
    ListingGateway, ListingServiceClient, ListingViewServiceClient, RpcClient, RpcError, UserServiceClient,
};

/// Build the gateway's three dependency clients from `config`.
///
/// # Errors
///
/// Returns [`RpcError::InvalidRequest`] if an HTTP client cannot be built.
pub fn build_gateway(config: &config::Config) -> Result<ListingGateway, RpcError> {
    Ok(ListingGateway::new(
        UserServiceClient::new(RpcClient::new(&config.user_service)?),
        ListingServiceClient::new(RpcClient::new(&config.listing_service)?),
        ListingViewServiceClient::new(RpcClient::new(&config.listing_view_service)?),
    ))
}
