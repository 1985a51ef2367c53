//! Command and event bus abstractions.
//!
//! # Architecture
//!
//! ```text
//!  Rewards                                  Points
//! ┌──────────────┐  DeductPointsCommand   ┌──────────────┐
//! │ outbox       │ ─────────────────────► │ command      │
//! │ publisher    │   queue: points.cmds   │ consumer     │
//! └──────────────┘                        └──────┬───────┘
//!        ▲                                       │ ledger + outbox
//!        │        PointsDeductedEvent            ▼
//! ┌──────┴───────┐ ◄───────────────────── ┌──────────────┐
//! │ event        │  exchange, routing key │ outbox       │
//! │ consumer     │   points.deducted      │ publisher    │
//! └──────────────┘                        └──────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a delivery may be seen more than once
//! - **Manual acknowledgement**: a delivery is settled only after its handler ran
//! - **One logical consumer per queue**: commands are never fanned out
//!
//! # Dyn Compatibility
//!
//! Both traits return `Pin<Box<dyn Future>>` so they can be shared as
//! `Arc<dyn CommandBus>` / `Arc<dyn EventBus>` between the publisher and
//! the consumers.

use crate::message::Envelope;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish to a destination
    #[error("Publish failed for '{destination}': {reason}")]
    PublishFailed {
        /// Queue name or routing key
        destination: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe or start consuming
    #[error("Subscription failed for '{queue}': {reason}")]
    SubscriptionFailed {
        /// Queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to settle (ack/nack) a delivery
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// A received message lacks mandatory metadata
    #[error("Malformed delivery: {0}")]
    MalformedDelivery(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// What to do with a delivery that was not processed successfully.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NackAction {
    /// Put it back for another attempt.
    Requeue,
    /// Remove it from normal processing.
    DeadLetter,
}

type SettleFuture = Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>>;

/// Broker-specific settlement of one delivery.
pub trait Acknowledger: Send {
    /// Positive acknowledgement.
    fn ack(self: Box<Self>) -> SettleFuture;

    /// Negative acknowledgement.
    fn nack(self: Box<Self>, action: NackAction, reason: String) -> SettleFuture;
}

/// One received message, settled exactly once via [`ack`](Self::ack) or
/// [`nack`](Self::nack).
///
/// Dropping a delivery without settling it behaves like a consumer crash:
/// the broker redelivers it.
pub struct Delivery {
    /// The received message.
    pub envelope: Envelope,
    /// 1-based delivery attempt for this message.
    pub attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery with its settlement handle.
    #[must_use]
    pub fn new(envelope: Envelope, attempt: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            attempt,
            acker,
        }
    }

    /// Whether this message was delivered before.
    #[must_use]
    pub const fn redelivered(&self) -> bool {
        self.attempt > 1
    }

    /// Acknowledge successful processing.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::AckFailed`] if the broker rejects the settlement.
    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    /// Reject the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::AckFailed`] if the broker rejects the settlement.
    pub async fn nack(self, action: NackAction, reason: impl Into<String>) -> Result<(), BusError> {
        self.acker.nack(action, reason.into()).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>;

/// Point-to-point command transport.
pub trait CommandBus: Send + Sync {
    /// Send a command to a named durable queue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the broker did not accept it.
    fn send<'a>(&'a self, queue: &'a str, envelope: &'a Envelope) -> BusFuture<'a, ()>;

    /// Start consuming a queue. Each queue has one logical consumer group.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if consumption cannot start.
    fn consume<'a>(&'a self, queue: &'a str) -> BusFuture<'a, DeliveryStream>;
}

/// Topic-routed event transport.
pub trait EventBus: Send + Sync {
    /// Publish an event to the exchange under its routing key.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the broker did not accept it.
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BusFuture<'a, ()>;

    /// Bind the subscriber's durable queue to `binding_keys` and consume it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the binding cannot be made.
    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        binding_keys: &'a [String],
    ) -> BusFuture<'a, DeliveryStream>;
}
