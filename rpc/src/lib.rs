//! # Listings RPC
//!
//! Synchronous calls between listings services over HTTP.
//!
//! - [`RpcClient`] sends one request, retrying transport failures with
//!   exponential backoff ([`RetryPolicy`]) until the attempt ceiling or the
//!   caller's [`CallContext`] ends the call.
//! - [`classify`] turns error responses into [`RpcError`]s. Server errors
//!   are reported generically; client errors name the responding service.
//! - [`clients`] and [`gateway`] build typed operations on top.
//!
//! # Example
//!
//! ```no_run
//! use listings_rpc::{CallContext, RpcClient, RpcClientConfig, UserServiceClient};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RpcClientConfig::from_env_prefix("USER_SERVICE")?;
//! let users = UserServiceClient::new(RpcClient::new(&config)?);
//!
//! let ctx = CallContext::background().with_timeout(Duration::from_secs(2));
//! let user = users.get_user_by_id(&ctx, 1).await?;
//! println!("{}", user.name);
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod client;
pub mod clients;
pub mod context;
pub mod dto;
pub mod error;
pub mod gateway;
pub mod retry;
pub mod transport;

pub use client::{ConfigError, RpcClient, RpcClientConfig};
pub use clients::{ListingServiceClient, ListingViewServiceClient, UserServiceClient};
pub use context::CallContext;
pub use error::RpcError;
pub use gateway::ListingGateway;
pub use retry::RetryPolicy;
pub use transport::{RequestBody, RpcRequest, RpcResponse, Transport, TransportError};
