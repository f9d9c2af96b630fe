//! # Listings Runtime
//!
//! The moving parts between the durable log and the handlers.
//!
//! ## Core Components
//!
//! - **Publisher**: encodes events and appends them to the log, no retry
//! - **Handler registry**: one typed route per subject, verified at startup
//! - **Subscription**: binds a durable consumer to a route and drives it
//!   through `Created → Consuming → Draining → Stopped`
//! - **Lifecycle**: the shared shutdown signal
//!
//! ## Example
//!
//! ```ignore
//! use listings_runtime::{HandlerRegistry, Shutdown, subscription};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(user_handler)?;
//! registry.verify(&["user.created"])?;
//!
//! let subscriptions = subscription::start_all(
//!     log,
//!     &registry,
//!     "listing_view_event",
//!     "listing-view",
//!     &DeliveryPolicy::default(),
//!     &SubscriptionOptions::default(),
//!     &shutdown,
//! )
//! .await?;
//! ```

/// Shutdown signal shared by long-running tasks
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

/// Event publishing
pub mod publisher;

/// Typed handler registry
pub mod registry;

/// Subscription engine
pub mod subscription;

pub use lifecycle::{Shutdown, ShutdownTrigger, shutdown_channel};
pub use publisher::{PublishError, Publisher};
pub use registry::{HandlerRegistry, RegistryError, Route};
pub use subscription::{
    Subscription, SubscriptionConfig, SubscriptionError, SubscriptionOptions, SubscriptionState, start_all,
};
