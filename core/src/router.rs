//! Subject routing and broker settlement.
//!
//! The router is the only place where reconciliation outcomes meet the broker.
//! It dispatches a delivery to the handler registered for its subject, maps
//! the outcome to a [`Disposition`], records dead letters, and settles the
//! delivery. Nothing else acks, naks or terms.

use crate::apply::Applied;
use crate::dead_letter::{DeadLetter, DeadLetterSink, LogDeadLetters};
use crate::environment::{Clock, SystemClock};
use crate::error::{Malformed, ReconcileError};
use crate::event::{self, Envelope};
use crate::event_bus::{Delivery, EventBusError, PublishAck};
use crate::reconcile::{Reconciler, SubjectRole};
use crate::redelivery::{Disposition, RedeliveryPolicy};
use crate::store::VersionedStore;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Successful handling of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// A replica row was written.
    Applied(Applied),
    /// A command ran and published its notification.
    Published(PublishAck),
    /// Nothing to do; the message is settled as processed.
    Skipped {
        /// Why nothing happened.
        reason: &'static str,
    },
}

/// Handler for the messages of one subject.
///
/// Handlers never touch the broker: they return an outcome and the router
/// settles the delivery from it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one message.
    ///
    /// # Errors
    ///
    /// Returns a [`ReconcileError`] whose class decides the broker disposition.
    async fn handle(&self, envelope: &Envelope) -> Result<Handled, ReconcileError>;
}

/// Decodes a snapshot of wire type `W` and runs it through a [`Reconciler`].
///
/// `W` is the shape published by the owning service; it is converted into the
/// locally stored entity before the gate runs.
pub struct ReplicaHandler<S, W> {
    reconciler: Reconciler<S>,
    role: SubjectRole,
    _wire: PhantomData<fn() -> W>,
}

impl<S, W> ReplicaHandler<S, W>
where
    S: VersionedStore,
    S::Entity: Serialize,
{
    /// Handle creation events.
    #[must_use]
    pub const fn creation(reconciler: Reconciler<S>) -> Self {
        Self::new(reconciler, SubjectRole::Creation)
    }

    /// Handle mutation events.
    #[must_use]
    pub const fn mutation(reconciler: Reconciler<S>) -> Self {
        Self::new(reconciler, SubjectRole::Mutation)
    }

    /// Handle events of the given role.
    #[must_use]
    pub const fn new(reconciler: Reconciler<S>, role: SubjectRole) -> Self {
        Self {
            reconciler,
            role,
            _wire: PhantomData,
        }
    }
}

#[async_trait]
impl<S, W> MessageHandler for ReplicaHandler<S, W>
where
    S: VersionedStore + 'static,
    S::Entity: Serialize,
    W: DeserializeOwned + Into<S::Entity> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> Result<Handled, ReconcileError> {
        let wire: W = event::decode(envelope)?;
        let entity: S::Entity = wire.into();
        let applied = self.reconciler.reconcile(&entity, self.role).await?;
        Ok(Handled::Applied(applied))
    }
}

/// Routes deliveries by subject and settles them.
pub struct SubjectRouter {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    policy: RedeliveryPolicy,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
}

impl SubjectRouter {
    /// Create an empty router using `policy` for deferrals.
    #[must_use]
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            handlers: HashMap::new(),
            policy,
            dead_letters: Arc::new(LogDeadLetters),
            clock: Arc::new(SystemClock),
        }
    }

    /// Register the handler for `subject`, replacing any previous one.
    #[must_use]
    pub fn route(mut self, subject: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(subject.into(), handler);
        self
    }

    /// Record dead letters into `sink` instead of only logging them.
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Use `clock` to timestamp dead letters.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Subjects with a registered handler, sorted.
    #[must_use]
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self.handlers.keys().cloned().collect();
        subjects.sort();
        subjects
    }

    /// Redelivery policy used for deferrals.
    #[must_use]
    pub const fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Run the handler for `envelope` without touching the broker.
    ///
    /// # Errors
    ///
    /// Returns [`Malformed::UnknownSubject`] if no handler is registered, or
    /// whatever the handler returns.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<Handled, ReconcileError> {
        let Some(handler) = self.handlers.get(&envelope.subject) else {
            return Err(Malformed::UnknownSubject(envelope.subject.clone()).into());
        };
        handler.handle(envelope).await
    }

    /// Dispatch `delivery`, settle it, and return the disposition used.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] only if the settlement itself failed. The
    /// broker then redelivers, which the version gate absorbs.
    pub async fn process(&self, delivery: Delivery) -> Result<Disposition, EventBusError> {
        let outcome = self.dispatch(delivery.envelope()).await;

        let disposition = match &outcome {
            Ok(_) => Disposition::Ack,
            Err(error) => error.disposition(&self.policy),
        };

        let envelope = delivery.envelope();
        match &outcome {
            Ok(handled) => {
                tracing::debug!(
                    subject = %envelope.subject,
                    attempt = envelope.delivery_attempt,
                    outcome = ?handled,
                    "Message processed"
                );
            },
            Err(error) => {
                self.report(envelope, error, disposition).await;
            },
        }

        metrics::counter!(
            "replica.messages",
            "subject" => envelope.subject.clone(),
            "disposition" => disposition.as_str()
        )
        .increment(1);

        delivery.settle(disposition).await?;
        Ok(disposition)
    }

    async fn report(&self, envelope: &Envelope, error: &ReconcileError, disposition: Disposition) {
        let attempt = envelope.delivery_attempt;

        if error.is_expected() && !error.is_dead_letter(attempt, &self.policy) {
            tracing::debug!(
                subject = %envelope.subject,
                attempt,
                class = error.class(),
                disposition = %disposition,
                error = %error,
                "Message not applied"
            );
            return;
        }

        if error.is_dead_letter(attempt, &self.policy) {
            tracing::warn!(
                subject = %envelope.subject,
                attempt,
                class = error.class(),
                disposition = %disposition,
                error = %error,
                "Message abandoned"
            );
            metrics::counter!(
                "replica.dead_letters",
                "subject" => envelope.subject.clone(),
                "class" => error.class()
            )
            .increment(1);

            let letter = DeadLetter::new(
                envelope.clone(),
                error.class(),
                error.to_string(),
                self.clock.now(),
            );
            if let Err(sink_error) = self.dead_letters.record(letter).await {
                tracing::error!(
                    subject = %envelope.subject,
                    error = %sink_error,
                    "Failed to record dead letter"
                );
            }
        } else {
            tracing::error!(
                subject = %envelope.subject,
                attempt,
                class = error.class(),
                disposition = %disposition,
                error = %error,
                "Message processing failed; redelivery requested"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event_bus::{Acknowledge, SettleFuture};
    use crate::store::StoreError;
    use crate::stream::{EntityId, Version};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixed(fn() -> Result<Handled, ReconcileError>);

    #[async_trait]
    impl MessageHandler for Fixed {
        async fn handle(&self, _envelope: &Envelope) -> Result<Handled, ReconcileError> {
            (self.0)()
        }
    }

    #[derive(Clone, Default)]
    struct Settled(Arc<Mutex<Vec<String>>>);

    struct Acker(Settled);

    impl Acknowledge for Acker {
        fn ack(self: Box<Self>) -> SettleFuture {
            self.0.0.lock().unwrap().push("ack".to_string());
            Box::pin(async { Ok(()) })
        }

        fn nak(self: Box<Self>, delay: Duration) -> SettleFuture {
            self.0.0.lock().unwrap().push(format!("nak:{}", delay.as_millis()));
            Box::pin(async { Ok(()) })
        }

        fn term(self: Box<Self>) -> SettleFuture {
            self.0.0.lock().unwrap().push("term".to_string());
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Default)]
    struct Letters(Mutex<Vec<DeadLetter>>);

    impl DeadLetterSink for Letters {
        fn record(
            &self,
            letter: DeadLetter,
        ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
            self.0.lock().unwrap().push(letter);
            Box::pin(async { Ok(()) })
        }
    }

    fn delivery(subject: &str, attempt: u32, settled: &Settled) -> Delivery {
        Delivery::new(
            Envelope::new(subject, b"{}".to_vec()).with_attempt(attempt),
            Box::new(Acker(settled.clone())),
        )
    }

    fn gap() -> Result<Handled, ReconcileError> {
        Err(ReconcileError::OrderingGap {
            kind: "ticket",
            id: EntityId::new(1),
            incoming: Version::new(2),
            stored: Some(Version::new(0)),
        })
    }

    fn stale() -> Result<Handled, ReconcileError> {
        Err(ReconcileError::StaleOrDuplicate {
            kind: "ticket",
            id: EntityId::new(1),
            incoming: Version::new(0),
            stored: Version::new(0),
        })
    }

    fn skipped() -> Result<Handled, ReconcileError> {
        Ok(Handled::Skipped { reason: "test" })
    }

    fn router(letters: Arc<Letters>) -> SubjectRouter {
        SubjectRouter::new(RedeliveryPolicy::new(Duration::from_millis(50), 3))
            .route("ok", Arc::new(Fixed(skipped)))
            .route("gap", Arc::new(Fixed(gap)))
            .route("stale", Arc::new(Fixed(stale)))
            .with_dead_letters(letters)
    }

    #[tokio::test]
    async fn success_is_acked() {
        let settled = Settled::default();
        let letters = Arc::new(Letters::default());
        let disposition = router(letters.clone())
            .process(delivery("ok", 1, &settled))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(*settled.0.lock().unwrap(), vec!["ack"]);
        assert!(letters.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gap_is_deferred_and_dead_lettered_only_on_final_attempt() {
        let settled = Settled::default();
        let letters = Arc::new(Letters::default());
        let router = router(letters.clone());

        router.process(delivery("gap", 1, &settled)).await.unwrap();
        assert!(letters.0.lock().unwrap().is_empty());

        router.process(delivery("gap", 3, &settled)).await.unwrap();
        assert_eq!(*settled.0.lock().unwrap(), vec!["nak:50", "nak:50"]);

        let letters = letters.0.lock().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].class, "gap");
        assert_eq!(letters[0].envelope.delivery_attempt, 3);
    }

    #[tokio::test]
    async fn stale_is_terminated_without_dead_letter() {
        let settled = Settled::default();
        let letters = Arc::new(Letters::default());

        let disposition = router(letters.clone())
            .process(delivery("stale", 1, &settled))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Term);
        assert!(letters.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_subject_is_terminated_and_dead_lettered() {
        let settled = Settled::default();
        let letters = Arc::new(Letters::default());

        let disposition = router(letters.clone())
            .process(delivery("nobody.listens", 1, &settled))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Term);
        assert_eq!(*settled.0.lock().unwrap(), vec!["term"]);
        assert_eq!(letters.0.lock().unwrap()[0].class, "malformed");
    }

    #[test]
    fn subjects_are_sorted() {
        let router = router(Arc::new(Letters::default()));
        assert_eq!(router.subjects(), vec!["gap", "ok", "stale"]);
    }
}
