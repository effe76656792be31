//! Dead letters: messages the engine gave up on.
//!
//! A message becomes a dead letter when it is terminally discarded for a reason
//! other than being a stale duplicate, or when it is deferred on the last
//! delivery its budget allows (the broker drops it afterwards and the update is
//! lost). Recording these gives operators a view of the consistency gap.

use crate::event::Envelope;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// A message that will never be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// The message as delivered.
    pub envelope: Envelope,
    /// Failure class (`malformed`, `gap`, `store`, `publish`).
    pub class: String,
    /// Human-readable reason.
    pub reason: String,
    /// When the engine gave up.
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Create a dead letter for `envelope`.
    #[must_use]
    pub fn new(
        envelope: Envelope,
        class: impl Into<String>,
        reason: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            envelope,
            class: class.into(),
            reason: reason.into(),
            recorded_at,
        }
    }
}

/// Destination for dead letters.
///
/// # Dyn Compatibility
///
/// Returns `Pin<Box<dyn Future>>` so a router can hold `Arc<dyn DeadLetterSink>`.
pub trait DeadLetterSink: Send + Sync {
    /// Record a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the letter could not be stored. Callers log and
    /// carry on: losing the record must not block the broker.
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeadLetters;

impl DeadLetterSink for LogDeadLetters {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            tracing::warn!(
                subject = %letter.envelope.subject,
                attempt = letter.envelope.delivery_attempt,
                class = %letter.class,
                reason = %letter.reason,
                "Dead letter"
            );
            Ok(())
        })
    }
}
