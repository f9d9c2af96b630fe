//! Typed handler registry keyed by subject.
//!
//! Each subject maps to exactly one typed route: a decoder for the subject's
//! [`Event`] type and the middleware-wrapped handler for it. Registration
//! rejects a second handler for the same subject, and [`HandlerRegistry::verify`]
//! fails at startup if any expected subject has no handler, so a message
//! can never reach a handler expecting a different type.
//!
//! # Example
//!
//! ```
//! use listings_core::event::{ListingCreated, UserCreated};
//! use listings_core::middleware::handler_fn;
//! use listings_runtime::registry::HandlerRegistry;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = HandlerRegistry::new();
//! registry.register(handler_fn(|_: UserCreated| async { Ok(()) }))?;
//! registry.register(handler_fn(|_: ListingCreated| async { Ok(()) }))?;
//!
//! registry.verify(&["user.created", "listing.created"])?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::DeliveryMetrics;
use listings_core::delivery::Delivery;
use listings_core::event::Event;
use listings_core::middleware::{AutoAck, Handler, Logging, Middleware, chain};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building or verifying a registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler is already registered for the subject
    #[error("A handler is already registered for subject '{0}'")]
    DuplicateSubject(String),

    /// Expected subjects have no handler
    #[error("No handler registered for subjects: {0:?}")]
    MissingSubjects(Vec<String>),
}

/// A subject's decoder and handler chain, with the event type erased.
pub trait Route: Send + Sync {
    /// Subject this route handles.
    fn subject(&self) -> &'static str;

    /// Decode the delivery and run the handler chain.
    ///
    /// Undecodable payloads are terminated. Handler failures are settled by
    /// the chain's middleware and never surface here.
    fn dispatch(&self, delivery: Delivery) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

struct TypedRoute<E: Event> {
    handler: Arc<dyn Handler<E>>,
}

impl<E: Event> Route for TypedRoute<E> {
    fn subject(&self) -> &'static str {
        E::SUBJECT
    }

    fn dispatch(&self, delivery: Delivery) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let event = match E::decode(&delivery.event().payload) {
                Ok(event) => event,
                Err(e) => {
                    DeliveryMetrics::record_decode_failure(E::SUBJECT);
                    tracing::error!(
                        subject = E::SUBJECT,
                        consumer = %delivery.consumer(),
                        delivery_attempt = delivery.attempt(),
                        error = %e,
                        "Failed to decode payload"
                    );
                    if let Err(ack_error) = delivery.term(e.to_string()).await {
                        tracing::error!(
                            subject = E::SUBJECT,
                            error = %ack_error,
                            "Failed to terminate undecodable delivery"
                        );
                    }
                    return;
                },
            };

            // The chain settles the delivery and logs failures.
            let _ = self.handler.handle(&delivery, event).await;
        })
    }
}

/// Subject-keyed routing table.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: BTreeMap<&'static str, Arc<dyn Route>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `E::SUBJECT` behind the default chain
    /// (`Logging` outermost, then `AutoAck`).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateSubject`] if the subject already
    /// has a handler.
    pub fn register<E: Event>(&mut self, handler: Arc<dyn Handler<E>>) -> Result<&mut Self, RegistryError> {
        self.register_with(handler, &[Arc::new(Logging), Arc::new(AutoAck)])
    }

    /// Register `handler` behind an explicit middleware chain; the first
    /// middleware is outermost.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateSubject`] if the subject already
    /// has a handler.
    pub fn register_with<E: Event>(
        &mut self,
        handler: Arc<dyn Handler<E>>,
        middlewares: &[Arc<dyn Middleware<E>>],
    ) -> Result<&mut Self, RegistryError> {
        if self.routes.contains_key(E::SUBJECT) {
            return Err(RegistryError::DuplicateSubject(E::SUBJECT.to_string()));
        }

        let route = TypedRoute {
            handler: chain(handler, middlewares),
        };
        self.routes.insert(E::SUBJECT, Arc::new(route));
        tracing::debug!(subject = E::SUBJECT, "Handler registered");
        Ok(self)
    }

    /// Check that every subject in `expected` has a handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::MissingSubjects`] listing the subjects
    /// without one.
    pub fn verify(&self, expected: &[&str]) -> Result<(), RegistryError> {
        let missing: Vec<String> = expected
            .iter()
            .filter(|subject| !self.routes.contains_key(**subject))
            .map(|subject| (*subject).to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::MissingSubjects(missing))
        }
    }

    /// Route for `subject`.
    #[must_use]
    pub fn route(&self, subject: &str) -> Option<Arc<dyn Route>> {
        self.routes.get(subject).cloned()
    }

    /// Registered subjects, sorted.
    #[must_use]
    pub fn subjects(&self) -> Vec<&'static str> {
        self.routes.keys().copied().collect()
    }

    /// Every route, sorted by subject.
    pub fn routes(&self) -> impl Iterator<Item = Arc<dyn Route>> + '_ {
        self.routes.values().cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use futures::StreamExt;
    use listings_core::delivery::DeliveryState;
    use listings_core::event::{LISTING_CREATED, ListingCreated, USER_CREATED, UserCreated};
    use listings_core::event_bus::{ConsumerConfig, DurableLog, StreamConfig};
    use listings_core::middleware::{HandlerError, handler_fn};
    use listings_testing::InMemoryLog;

    #[test]
    fn duplicate_subject_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(handler_fn(|_: UserCreated| async { Ok(()) })).unwrap();

        let result = registry.register(handler_fn(|_: UserCreated| async { Ok(()) }));

        assert!(matches!(result, Err(RegistryError::DuplicateSubject(s)) if s == USER_CREATED));
    }

    #[test]
    fn verify_reports_missing_subjects() {
        let mut registry = HandlerRegistry::new();
        registry.register(handler_fn(|_: UserCreated| async { Ok(()) })).unwrap();

        assert_eq!(
            registry.verify(&[USER_CREATED, LISTING_CREATED]),
            Err(RegistryError::MissingSubjects(vec![LISTING_CREATED.to_string()]))
        );

        registry.register(handler_fn(|_: ListingCreated| async { Ok(()) })).unwrap();
        assert!(registry.verify(&[USER_CREATED, LISTING_CREATED]).is_ok());
        assert_eq!(registry.subjects(), vec![LISTING_CREATED, USER_CREATED]);
    }

    async fn single_delivery(payload: &[u8]) -> (InMemoryLog, Delivery) {
        let log = InMemoryLog::new();
        log.ensure_stream(&StreamConfig::new("s", [USER_CREATED])).await.unwrap();
        log.create_or_update_consumer(&ConsumerConfig::new("s", "users", USER_CREATED))
            .await
            .unwrap();
        log.publish(USER_CREATED, payload).await.unwrap();
        let delivery = log.consume("users").await.unwrap().next().await.unwrap().unwrap();
        (log, delivery)
    }

    #[tokio::test]
    async fn undecodable_payload_is_terminated() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(handler_fn(|_: UserCreated| async {
                Err(HandlerError::permanent("must not be called"))
            }))
            .unwrap();
        let (_log, delivery) = single_delivery(b"not json").await;

        registry.route(USER_CREATED).unwrap().dispatch(delivery.clone()).await;

        assert_eq!(delivery.state(), DeliveryState::PermanentlyFailed);
    }

    #[tokio::test]
    async fn decoded_event_reaches_handler_and_is_acked() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(handler_fn(|event: UserCreated| async move {
                assert_eq!(event.name, "John Doe");
                Ok(())
            }))
            .unwrap();
        let payload = br#"{"id":1,"name":"John Doe","email":"","created_at":1,"updated_at":1}"#;
        let (_log, delivery) = single_delivery(payload).await;

        registry.route(USER_CREATED).unwrap().dispatch(delivery.clone()).await;

        assert_eq!(delivery.state(), DeliveryState::Acked);
    }
}
