//! A single delivery of a message and its acknowledgment lifecycle.
//!
//! Each delivery starts [`DeliveryState::Pending`] and makes exactly one
//! transition out of it:
//!
//! ```text
//!            ack              nak (attempts left)
//! Acked ◄──────────── Pending ────────────────────► RetryScheduled
//!                        │
//!                        │ nak (ceiling reached) / term
//!                        ▼
//!                 PermanentlyFailed ──► dead-letter subject (if configured)
//! ```
//!
//! The log backend decides, through its [`Acknowledger`], whether a
//! negative acknowledgment becomes a redelivery or a permanent failure.
//! Settling an already settled delivery is reported as
//! [`AckError::AlreadySettled`] and does not reach the log.

use crate::event::DomainEvent;
use crate::event_bus::EventBusError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Tagged state of a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Not yet settled
    Pending,
    /// Positively acknowledged
    Acked,
    /// Negatively acknowledged; the log will deliver it again
    RetryScheduled,
    /// Failed for good; dead-lettered when the policy allows
    PermanentlyFailed,
}

impl DeliveryState {
    /// Stable name for logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acked => "acked",
            Self::RetryScheduled => "retry_scheduled",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Acked => 1,
            Self::RetryScheduled => 2,
            Self::PermanentlyFailed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Acked,
            2 => Self::RetryScheduled,
            3 => Self::PermanentlyFailed,
            // SETTLING reads as pending until the log confirms
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker for a settle call in flight.
const SETTLING: u8 = u8::MAX;

/// How a consumer settles a delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Processing succeeded
    Ack,
    /// Processing failed; redeliver if the policy allows
    Nak {
        /// Failure description, recorded on dead-letter
        reason: String,
    },
    /// Processing can never succeed; do not redeliver
    Term {
        /// Failure description, recorded on dead-letter
        reason: String,
    },
}

impl Settlement {
    /// Name of the settlement kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nak { .. } => "nak",
            Self::Term { .. } => "term",
        }
    }
}

/// Errors returned when settling a delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    /// The delivery was already settled
    #[error("Delivery already settled as {0}")]
    AlreadySettled(DeliveryState),

    /// The log failed to record the settlement
    #[error(transparent)]
    Log(#[from] EventBusError),
}

/// Backend half of a delivery: records a settlement in the log.
///
/// Returns the state the delivery ends up in. For [`Settlement::Nak`] this
/// is [`DeliveryState::RetryScheduled`] or [`DeliveryState::PermanentlyFailed`]
/// depending on the consumer's delivery policy.
pub trait Acknowledger: Send + Sync {
    /// Record `settlement` for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the log could not record it; the
    /// delivery then stays pending.
    fn settle<'a>(
        &'a self,
        event: &'a DomainEvent,
        settlement: Settlement,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryState, EventBusError>> + Send + 'a>>;
}

/// One delivery of a message to a consumer.
///
/// Cheap to clone; clones share the same acknowledgment state.
#[derive(Clone)]
pub struct Delivery {
    event: Arc<DomainEvent>,
    consumer: Arc<str>,
    acker: Arc<dyn Acknowledger>,
    state: Arc<AtomicU8>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.event.subject)
            .field("consumer", &self.consumer)
            .field("delivery_attempt", &self.event.delivery_attempt)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Delivery {
    /// Wrap a delivered message with the acknowledger that settles it.
    #[must_use]
    pub fn new(event: DomainEvent, consumer: impl Into<Arc<str>>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            event: Arc::new(event),
            consumer: consumer.into(),
            acker,
            state: Arc::new(AtomicU8::new(DeliveryState::Pending.to_u8())),
        }
    }

    /// The delivered message.
    #[must_use]
    pub fn event(&self) -> &DomainEvent {
        &self.event
    }

    /// Subject of the delivered message.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.event.subject
    }

    /// Name of the durable consumer this was delivered to.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// 1-based delivery attempt.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.event.delivery_attempt
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DeliveryState {
        DeliveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the delivery has been settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.state() != DeliveryState::Pending
    }

    /// Positively acknowledge.
    ///
    /// # Errors
    ///
    /// See [`Delivery::settle`].
    pub async fn ack(&self) -> Result<DeliveryState, AckError> {
        self.settle(Settlement::Ack).await
    }

    /// Negatively acknowledge; redelivered if the policy allows.
    ///
    /// # Errors
    ///
    /// See [`Delivery::settle`].
    pub async fn nak(&self, reason: impl Into<String>) -> Result<DeliveryState, AckError> {
        self.settle(Settlement::Nak { reason: reason.into() }).await
    }

    /// Terminate: never redeliver.
    ///
    /// # Errors
    ///
    /// See [`Delivery::settle`].
    pub async fn term(&self, reason: impl Into<String>) -> Result<DeliveryState, AckError> {
        self.settle(Settlement::Term { reason: reason.into() }).await
    }

    /// Settle the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`AckError::AlreadySettled`] if it was settled before (or a
    /// settle is in flight), or [`AckError::Log`] if the log rejected the
    /// settlement, in which case the delivery stays pending.
    pub async fn settle(&self, settlement: Settlement) -> Result<DeliveryState, AckError> {
        let pending = DeliveryState::Pending.to_u8();
        if let Err(current) =
            self.state
                .compare_exchange(pending, SETTLING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(AckError::AlreadySettled(DeliveryState::from_u8(current)));
        }

        let kind = settlement.kind();
        match self.acker.settle(&self.event, settlement).await {
            Ok(state) => {
                self.state.store(state.to_u8(), Ordering::Release);
                tracing::trace!(
                    subject = %self.event.subject,
                    consumer = %self.consumer,
                    delivery_attempt = self.event.delivery_attempt,
                    settlement = kind,
                    state = %state,
                    "Delivery settled"
                );
                Ok(state)
            },
            Err(e) => {
                self.state.store(pending, Ordering::Release);
                Err(AckError::Log(e))
            },
        }
    }
}
