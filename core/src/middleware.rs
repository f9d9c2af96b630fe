//! Typed message handlers and the middleware chain around them.
//!
//! A [`Handler`] receives a decoded event together with the [`Delivery`] it
//! arrived in and reports success or a [`HandlerError`]. Handlers never
//! settle deliveries themselves; that is the job of the [`AutoAck`]
//! middleware, which every subscription installs:
//!
//! | Handler result              | Settlement |
//! |-----------------------------|------------|
//! | `Ok(())`                    | ack        |
//! | `Err(HandlerError::Retryable)` | nak     |
//! | `Err(HandlerError::Permanent)` | term    |
//!
//! # Ordering
//!
//! [`chain`] applies middlewares in reverse registration order, so the
//! first registered middleware is the outermost wrapper:
//!
//! ```text
//! chain(h, [logging, auto_ack])  ==  logging(auto_ack(h))
//! ```

use crate::delivery::{AckError, Delivery, Settlement};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::Instrument;

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Might succeed on a later delivery (missing dependency, database hiccup)
    #[error("{0}")]
    Retryable(String),

    /// Will never succeed (bad payload, constraint violation)
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    /// Build a retryable error.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    /// Build a permanent error.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Whether a redelivery might succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Settlement matching this failure.
    #[must_use]
    pub fn settlement(&self) -> Settlement {
        match self {
            Self::Retryable(reason) => Settlement::Nak { reason: reason.clone() },
            Self::Permanent(reason) => Settlement::Term { reason: reason.clone() },
        }
    }
}

/// Result type for handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Processes one decoded event of type `E`.
///
/// Handlers may run concurrently with themselves and must be safe to do so.
pub trait Handler<E>: Send + Sync {
    /// Handle `event`, delivered in `delivery`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when processing fails; the variant decides
    /// whether the message is redelivered.
    fn handle<'a>(
        &'a self,
        delivery: &'a Delivery,
        event: E,
    ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;
}

/// Transforms a handler into another handler.
pub trait Middleware<E>: Send + Sync {
    /// Wrap `next`.
    fn wrap(&self, next: Arc<dyn Handler<E>>) -> Arc<dyn Handler<E>>;
}

/// Compose `middlewares` around `handler`; the first middleware is outermost.
#[must_use]
pub fn chain<E>(
    handler: Arc<dyn Handler<E>>,
    middlewares: &[Arc<dyn Middleware<E>>],
) -> Arc<dyn Handler<E>> {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware.wrap(next))
}

/// Handler backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F, E> {
    f: F,
    _event: PhantomData<fn(E)>,
}

/// Build a handler from an async closure over the event.
///
/// # Example
///
/// ```
/// use listings_core::event::UserCreated;
/// use listings_core::middleware::{Handler, handler_fn};
/// use std::sync::Arc;
///
/// let handler: Arc<dyn Handler<UserCreated>> = handler_fn(|event: UserCreated| async move {
///     println!("user {} created", event.id);
///     Ok(())
/// });
/// ```
#[must_use]
pub fn handler_fn<E, F, Fut>(f: F) -> Arc<dyn Handler<E>>
where
    E: Send + 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _event: PhantomData,
    })
}

impl<E, F, Fut> Handler<E> for FnHandler<F, E>
where
    E: Send + 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        _delivery: &'a Delivery,
        event: E,
    ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>> {
        Box::pin((self.f)(event))
    }
}

/// Settles each delivery from the wrapped handler's result.
///
/// Settlement failures are logged and never change the handler's result.
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoAck;

impl<E: Send + 'static> Middleware<E> for AutoAck {
    fn wrap(&self, next: Arc<dyn Handler<E>>) -> Arc<dyn Handler<E>> {
        Arc::new(AutoAckHandler { next })
    }
}

struct AutoAckHandler<E> {
    next: Arc<dyn Handler<E>>,
}

impl<E: Send + 'static> Handler<E> for AutoAckHandler<E> {
    fn handle<'a>(
        &'a self,
        delivery: &'a Delivery,
        event: E,
    ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>> {
        Box::pin(async move {
            let result = self.next.handle(delivery, event).await;

            let settlement = match &result {
                Ok(()) => Settlement::Ack,
                Err(e) => e.settlement(),
            };

            match delivery.settle(settlement).await {
                Ok(_) => {},
                Err(AckError::AlreadySettled(state)) => {
                    tracing::debug!(
                        subject = %delivery.subject(),
                        state = %state,
                        "Delivery settled before auto-ack"
                    );
                },
                Err(e) => {
                    tracing::error!(
                        subject = %delivery.subject(),
                        consumer = %delivery.consumer(),
                        delivery_attempt = delivery.attempt(),
                        error = %e,
                        "Failed to settle delivery"
                    );
                },
            }

            result
        })
    }
}

/// Wraps each delivery in a tracing span and logs its outcome.
#[derive(Clone, Copy, Debug, Default)]
pub struct Logging;

impl<E: Send + 'static> Middleware<E> for Logging {
    fn wrap(&self, next: Arc<dyn Handler<E>>) -> Arc<dyn Handler<E>> {
        Arc::new(LoggingHandler { next })
    }
}

struct LoggingHandler<E> {
    next: Arc<dyn Handler<E>>,
}

impl<E: Send + 'static> Handler<E> for LoggingHandler<E> {
    fn handle<'a>(
        &'a self,
        delivery: &'a Delivery,
        event: E,
    ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>> {
        let span = tracing::info_span!(
            "delivery",
            subject = %delivery.subject(),
            consumer = %delivery.consumer(),
            delivery_attempt = delivery.attempt(),
        );

        Box::pin(
            async move {
                let started = Instant::now();
                let result = self.next.handle(delivery, event).await;
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                match &result {
                    Ok(()) => tracing::debug!(elapsed_ms, "Handled delivery"),
                    Err(e) => tracing::error!(
                        elapsed_ms,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Handler failed"
                    ),
                }
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::delivery::{Acknowledger, DeliveryState};
    use crate::event::DomainEvent;
    use crate::event_bus::EventBusError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<Settlement>>,
    }

    impl Acknowledger for RecordingAcker {
        fn settle<'a>(
            &'a self,
            _event: &'a DomainEvent,
            settlement: Settlement,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryState, EventBusError>> + Send + 'a>> {
            Box::pin(async move {
                let state = match settlement {
                    Settlement::Ack => DeliveryState::Acked,
                    Settlement::Nak { .. } => DeliveryState::RetryScheduled,
                    Settlement::Term { .. } => DeliveryState::PermanentlyFailed,
                };
                self.calls.lock().unwrap().push(settlement);
                Ok(state)
            })
        }
    }

    fn delivery() -> (Delivery, Arc<RecordingAcker>) {
        let acker = Arc::new(RecordingAcker::default());
        let delivery = Delivery::new(
            DomainEvent::new("user.created", b"{}".to_vec()),
            "test-consumer",
            Arc::clone(&acker) as Arc<dyn Acknowledger>,
        );
        (delivery, acker)
    }

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    struct TagHandler {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        next: Arc<dyn Handler<u32>>,
    }

    impl Middleware<u32> for Tag {
        fn wrap(&self, next: Arc<dyn Handler<u32>>) -> Arc<dyn Handler<u32>> {
            Arc::new(TagHandler {
                name: self.name,
                log: Arc::clone(&self.log),
                next,
            })
        }
    }

    impl Handler<u32> for TagHandler {
        fn handle<'a>(
            &'a self,
            delivery: &'a Delivery,
            event: u32,
        ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("{}:before", self.name));
                let result = self.next.handle(delivery, event).await;
                self.log.lock().unwrap().push(format!("{}:after", self.name));
                result
            })
        }
    }

    #[tokio::test]
    async fn first_registered_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_log = Arc::clone(&log);
        let handler = handler_fn(move |_: u32| {
            let log = Arc::clone(&inner_log);
            async move {
                log.lock().unwrap().push("handler".to_string());
                Ok(())
            }
        });
        let middlewares: Vec<Arc<dyn Middleware<u32>>> = vec![
            Arc::new(Tag { name: "outer", log: Arc::clone(&log) }),
            Arc::new(Tag { name: "inner", log: Arc::clone(&log) }),
        ];

        let (delivery, _) = delivery();
        chain(handler, &middlewares).handle(&delivery, 7).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "handler", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn auto_ack_acks_on_success() {
        let handler = chain(handler_fn(|_: u32| async { Ok(()) }), &[Arc::new(AutoAck)]);
        let (delivery, acker) = delivery();

        handler.handle(&delivery, 1).await.unwrap();

        assert_eq!(delivery.state(), DeliveryState::Acked);
        assert_eq!(*acker.calls.lock().unwrap(), vec![Settlement::Ack]);
    }

    #[tokio::test]
    async fn auto_ack_naks_retryable_failure() {
        let handler = chain(
            handler_fn(|_: u32| async { Err(HandlerError::retryable("user not found")) }),
            &[Arc::new(AutoAck)],
        );
        let (delivery, acker) = delivery();

        let result = handler.handle(&delivery, 1).await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(
            *acker.calls.lock().unwrap(),
            vec![Settlement::Nak { reason: "user not found".to_string() }]
        );
    }

    #[tokio::test]
    async fn auto_ack_terms_permanent_failure() {
        let handler = chain(
            handler_fn(|_: u32| async { Err(HandlerError::permanent("duplicate listing")) }),
            &[Arc::new(Logging), Arc::new(AutoAck)],
        );
        let (delivery, _) = delivery();

        let _ = handler.handle(&delivery, 1).await;

        assert_eq!(delivery.state(), DeliveryState::PermanentlyFailed);
    }

    #[tokio::test]
    async fn auto_ack_tolerates_settled_delivery() {
        let handler = chain(
            Arc::new(SelfAcking) as Arc<dyn Handler<u32>>,
            &[Arc::new(AutoAck)],
        );
        let (delivery, acker) = delivery();

        handler.handle(&delivery, 1).await.unwrap();

        assert_eq!(acker.calls.lock().unwrap().len(), 1);
    }

    struct SelfAcking;

    impl Handler<u32> for SelfAcking {
        fn handle<'a>(
            &'a self,
            delivery: &'a Delivery,
            _event: u32,
        ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>> {
            Box::pin(async move {
                delivery.ack().await.unwrap();
                Ok(())
            })
        }
    }
}
