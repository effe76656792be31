//! Event bus abstraction: durable publish and competing-consumer subscriptions.
//!
//! This module provides the [`EventBus`] trait the reconciliation engine needs
//! from a message broker, and the [`Delivery`] handle through which a worker
//! settles every message it receives.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   publish    ┌───────────────────┐
//! │ Owning       │─────────────►│ Broker stream     │
//! │ service      │◄─────────────│ (durable)         │
//! └──────────────┘   sequence   └─────────┬─────────┘
//!                                         │ deliver (queue group)
//!                             ┌───────────┴───────────┐
//!                             ▼                       ▼
//!                       ┌──────────┐            ┌──────────┐
//!                       │ worker 1 │            │ worker 2 │
//!                       └────┬─────┘            └────┬─────┘
//!                            │ ack / nak(delay) / term
//!                            ▼
//!                      back to the broker
//! ```
//!
//! # Key Principles
//!
//! - **Durable publish**: [`EventBus::publish`] resolves only once the broker has
//!   persisted the message, and returns its [`Sequence`] as proof
//! - **At-least-once delivery**: every message may be delivered more than once
//! - **Competing consumers**: members of one queue group share a subject's load,
//!   each message going to exactly one member
//! - **Broker-owned redelivery**: delay and delivery budget live in the
//!   [`Subscription`], never in handler code
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (in `replica-testing`): deterministic tests
//! - `RedpandaEventBus` (in `replica-redpanda`): Kafka-compatible production broker

use crate::event::Envelope;
use crate::redelivery::{Disposition, RedeliveryPolicy};
use crate::stream::Sequence;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to durably publish a message
    #[error("Publish failed for subject '{subject}': {reason}")]
    PublishFailed {
        /// The subject that failed
        subject: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a subject
    #[error("Subscription failed for subject '{subject}': {reason}")]
    SubscriptionFailed {
        /// The subject that failed to subscribe
        subject: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to settle (ack/nak/term) a delivery
    #[error("Failed to settle message on '{subject}': {reason}")]
    SettleFailed {
        /// Subject of the message
        subject: String,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Broker acknowledgment of a durable publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream (topic) the message was appended to.
    pub stream: String,
    /// Position of the message within its stream.
    pub sequence: Sequence,
}

/// Parameters of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Subject (topic) to consume.
    pub subject: String,
    /// Competing-consumer group. `None` means a private subscription.
    pub queue_group: Option<String>,
    /// Broker-side redelivery configuration.
    pub redelivery: RedeliveryPolicy,
}

impl Subscription {
    /// Subscribe to `subject` with the default redelivery policy.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            queue_group: None,
            redelivery: RedeliveryPolicy::default(),
        }
    }

    /// Join a competing-consumer group.
    #[must_use]
    pub fn queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    /// Use an explicit redelivery policy.
    #[must_use]
    pub const fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = policy;
        self
    }
}

/// Future returned by settlement operations.
pub type SettleFuture = Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send>>;

/// Broker-specific settlement of one delivered message.
///
/// Each method consumes the acknowledger: a message is settled exactly once.
pub trait Acknowledge: Send + Sync {
    /// Remove the message permanently.
    fn ack(self: Box<Self>) -> SettleFuture;

    /// Ask for redelivery after `delay`, subject to the delivery budget.
    fn nak(self: Box<Self>, delay: Duration) -> SettleFuture;

    /// Discard the message permanently without redelivery.
    fn term(self: Box<Self>) -> SettleFuture;
}

/// A delivered message together with the means to settle it.
pub struct Delivery {
    envelope: Envelope,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Pair an envelope with its broker acknowledger.
    #[must_use]
    pub fn new(envelope: Envelope, acker: Box<dyn Acknowledge>) -> Self {
        Self { envelope, acker }
    }

    /// The delivered message.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Settle the message according to `disposition`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SettleFailed`] if the broker could not record the
    /// settlement. The message is then redelivered by the broker, which the
    /// version gate tolerates.
    pub async fn settle(self, disposition: Disposition) -> Result<(), EventBusError> {
        match disposition {
            Disposition::Ack => self.acker.ack().await,
            Disposition::Nak(delay) => self.acker.nak(delay).await,
            Disposition::Term => self.acker.term().await,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` so one bus can be shared by every
/// worker and command handler of a process.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so services can hold an `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Durably append a message to `subject`.
    ///
    /// `key` selects the ordering partition on brokers that have one; using the
    /// entity id keeps all messages of one entity in one stream.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker did not confirm
    /// persistence. Callers must then treat the message as not published.
    fn publish(
        &self,
        subject: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, EventBusError>> + Send + '_>>;

    /// Subscribe to a subject and receive a stream of deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        subscription: Subscription,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>>;
}
