//! In-memory broker with at-least-once redelivery.
//!
//! Mirrors the broker semantics the engine relies on:
//!
//! - every publish gets a per-subject sequence number
//! - subscribers sharing a queue group compete for messages (round robin);
//!   subscribers without a group each get every message
//! - `nak(delay)` redelivers the message after `delay` with its attempt
//!   incremented, until the subscription's `max_deliver` is spent
//! - `ack` and `term` remove the message
//! - a delivery dropped without being settled is abandoned
//!
//! Messages published to a subject nobody subscribes to are dropped.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use futures::Stream;
use replica_core::event::Envelope;
use replica_core::event_bus::{
    Acknowledge, Delivery, DeliveryStream, EventBus, EventBusError, PublishAck, SettleFuture,
    Subscription,
};
use replica_core::redelivery::RedeliveryPolicy;
use replica_core::stream::Sequence;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

/// How a delivered message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Acknowledged.
    Acked,
    /// Negatively acknowledged and scheduled for redelivery.
    Naked(Duration),
    /// Terminated.
    Termed,
    /// Negatively acknowledged on the last allowed delivery; dropped.
    Exhausted,
}

/// One settlement observed by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Subject of the message.
    pub subject: String,
    /// Sequence assigned at publish.
    pub sequence: Sequence,
    /// Delivery attempt that was settled.
    pub attempt: u32,
    /// What happened.
    pub outcome: SettleOutcome,
}

/// A message as published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Subject published to.
    pub subject: String,
    /// Ordering key.
    pub key: Option<String>,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Sequence assigned by the bus.
    pub sequence: Sequence,
}

impl Published {
    /// Payload parsed as JSON, for assertions.
    #[must_use]
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

struct Group {
    id: usize,
    members: Vec<mpsc::UnboundedSender<Delivery>>,
    next: usize,
    policy: RedeliveryPolicy,
}

#[derive(Default)]
struct BusState {
    sequences: HashMap<String, u64>,
    published: Vec<Published>,
    settlements: Vec<Settlement>,
    groups: HashMap<String, Vec<Group>>,
    named: HashMap<(String, String), usize>,
    next_group: usize,
    failing_publishes: usize,
}

struct Shared {
    state: Mutex<BusState>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Shared {
    /// Hand `envelope` to one member of group `group_id`. If the group has no
    /// live member left the message is finished.
    fn deliver(self: &Arc<Self>, group_id: usize, envelope: Envelope) {
        let mut state = self.state.lock().unwrap();
        let Some(group) = state
            .groups
            .get_mut(&envelope.subject)
            .and_then(|groups| groups.iter_mut().find(|g| g.id == group_id))
        else {
            self.finish();
            return;
        };

        let acker = InMemoryAcker {
            shared: Arc::clone(self),
            group_id,
            policy: group.policy,
            envelope: envelope.clone(),
            settled: false,
        };
        let mut delivery = Delivery::new(envelope, Box::new(acker));

        while !group.members.is_empty() {
            let index = group.next % group.members.len();
            group.next = group.next.wrapping_add(1);

            match group.members[index].send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    group.members.remove(index);
                    delivery = returned;
                },
            }
        }
        drop(state);
        // Dropping the unsent delivery finishes it.
        drop(delivery);
    }

    fn settle(&self, envelope: &Envelope, outcome: SettleOutcome) {
        let mut state = self.state.lock().unwrap();
        state.settlements.push(Settlement {
            subject: envelope.subject.clone(),
            sequence: envelope.sequence.unwrap_or(Sequence::new(0)),
            attempt: envelope.delivery_attempt,
            outcome,
        });
        drop(state);

        if !matches!(outcome, SettleOutcome::Naked(_)) {
            self.finish();
        }
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    group_id: usize,
    policy: RedeliveryPolicy,
    envelope: Envelope,
    settled: bool,
}

impl InMemoryAcker {
    fn settle(&mut self, outcome: SettleOutcome) {
        self.settled = true;
        self.shared.settle(&self.envelope, outcome);
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(
                subject = %self.envelope.subject,
                attempt = self.envelope.delivery_attempt,
                "Delivery dropped unsettled; abandoning message"
            );
            self.shared.finish();
        }
    }
}

impl Acknowledge for InMemoryAcker {
    fn ack(mut self: Box<Self>) -> SettleFuture {
        self.settle(SettleOutcome::Acked);
        Box::pin(async { Ok(()) })
    }

    fn nak(mut self: Box<Self>, delay: Duration) -> SettleFuture {
        if !self.policy.allows_redelivery(self.envelope.delivery_attempt) {
            tracing::debug!(
                subject = %self.envelope.subject,
                attempt = self.envelope.delivery_attempt,
                "Delivery budget exhausted; dropping message"
            );
            self.settle(SettleOutcome::Exhausted);
            return Box::pin(async { Ok(()) });
        }

        self.settle(SettleOutcome::Naked(delay));

        let shared = Arc::clone(&self.shared);
        let group_id = self.group_id;
        let attempt = self.envelope.delivery_attempt + 1;
        let envelope = self.envelope.clone().with_attempt(attempt);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.deliver(group_id, envelope);
        });
        Box::pin(async { Ok(()) })
    }

    fn term(mut self: Box<Self>) -> SettleFuture {
        self.settle(SettleOutcome::Termed);
        Box::pin(async { Ok(()) })
    }
}

/// In-memory [`EventBus`] for tests.
///
/// Cloning shares the underlying broker.
///
/// # Example
///
/// ```
/// use replica_testing::InMemoryEventBus;
/// use replica_core::event_bus::{EventBus, Subscription};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryEventBus::new();
/// let mut deliveries = bus.subscribe(Subscription::new("ticket.created")).await?;
///
/// let ack = bus.publish("ticket.created", Some("1"), b"{}".to_vec()).await?;
/// assert_eq!(ack.sequence.value(), 1);
///
/// let delivery = deliveries.next().await.unwrap()?;
/// assert_eq!(delivery.envelope().delivery_attempt, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryEventBus {
    shared: Arc<Shared>,
}

impl InMemoryEventBus {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Make the next `count` publishes fail with [`EventBusError::PublishFailed`].
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.state.lock().unwrap().failing_publishes = count;
    }

    /// Every message published so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<Published> {
        self.shared.state.lock().unwrap().published.clone()
    }

    /// Messages published to `subject`, in publish order.
    #[must_use]
    pub fn published_to(&self, subject: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.subject == subject)
            .collect()
    }

    /// Every settlement so far, in settlement order.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.state.lock().unwrap().settlements.clone()
    }

    /// Number of settlements on `subject` matching `predicate`.
    #[must_use]
    pub fn count(&self, subject: &str, predicate: impl Fn(&SettleOutcome) -> bool) -> usize {
        self.settlements()
            .iter()
            .filter(|s| s.subject == subject && predicate(&s.outcome))
            .count()
    }

    /// Messages delivered but not yet finally settled (pending redeliveries
    /// included).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every delivered message has been acked, termed, exhausted or
    /// abandoned.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn quiesce(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let idle = self.shared.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok()
    }

    fn subscribe_member(&self, subscription: &Subscription) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock().unwrap();

        let named_key = subscription
            .queue_group
            .as_ref()
            .map(|group| (subscription.subject.clone(), group.clone()));

        let existing = named_key
            .as_ref()
            .and_then(|key| state.named.get(key).copied());
        if let Some(group_id) = existing {
            if let Some(group) = state
                .groups
                .get_mut(&subscription.subject)
                .and_then(|groups| groups.iter_mut().find(|g| g.id == group_id))
            {
                group.members.push(tx);
                return rx;
            }
        }

        let id = state.next_group;
        state.next_group += 1;
        if let Some(key) = named_key {
            state.named.insert(key, id);
        }
        state
            .groups
            .entry(subscription.subject.clone())
            .or_default()
            .push(Group {
                id,
                members: vec![tx],
                next: 0,
                policy: subscription.redelivery,
            });
        rx
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        subject: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, EventBusError>> + Send + '_>> {
        let subject = subject.to_string();
        let key = key.map(str::to_string);

        Box::pin(async move {
            let (sequence, targets) = {
                let mut state = self.shared.state.lock().unwrap();
                if state.failing_publishes > 0 {
                    state.failing_publishes -= 1;
                    return Err(EventBusError::PublishFailed {
                        subject,
                        reason: "injected failure".to_string(),
                    });
                }

                let counter = state.sequences.entry(subject.clone()).or_insert(0);
                *counter += 1;
                let sequence = Sequence::new(*counter);

                state.published.push(Published {
                    subject: subject.clone(),
                    key,
                    payload: payload.clone(),
                    sequence,
                });

                let targets: Vec<usize> = state
                    .groups
                    .get(&subject)
                    .map(|groups| groups.iter().map(|g| g.id).collect())
                    .unwrap_or_default();
                (sequence, targets)
            };

            for group_id in targets {
                self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
                let envelope =
                    Envelope::new(subject.clone(), payload.clone()).with_sequence(sequence);
                self.shared.deliver(group_id, envelope);
            }

            Ok(PublishAck {
                stream: subject,
                sequence,
            })
        })
    }

    fn subscribe(
        &self,
        subscription: Subscription,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.subscribe_member(&subscription);
            let stream: Pin<Box<dyn Stream<Item = _> + Send>> = Box::pin(async_stream::stream! {
                while let Some(delivery) = rx.recv().await {
                    yield Ok(delivery);
                }
            });
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn policy(max_deliver: u32) -> RedeliveryPolicy {
        RedeliveryPolicy::new(Duration::from_millis(5), max_deliver)
    }

    #[tokio::test]
    async fn sequences_are_per_subject() {
        let bus = InMemoryEventBus::new();
        let a1 = bus.publish("a", None, vec![]).await.unwrap();
        let b1 = bus.publish("b", None, vec![]).await.unwrap();
        let a2 = bus.publish("a", None, vec![]).await.unwrap();

        assert_eq!(a1.sequence.value(), 1);
        assert_eq!(b1.sequence.value(), 1);
        assert_eq!(a2.sequence.value(), 2);
        assert_eq!(bus.published_to("a").len(), 2);
    }

    #[tokio::test]
    async fn queue_group_members_compete() {
        let bus = InMemoryEventBus::new();
        let sub = Subscription::new("t").queue_group("g");
        let mut first = bus.subscribe(sub.clone()).await.unwrap();
        let mut second = bus.subscribe(sub).await.unwrap();

        bus.publish("t", None, b"1".to_vec()).await.unwrap();
        bus.publish("t", None, b"2".to_vec()).await.unwrap();

        let d1 = first.next().await.unwrap().unwrap();
        let d2 = second.next().await.unwrap().unwrap();
        assert_eq!(d1.envelope().payload, b"1");
        assert_eq!(d2.envelope().payload, b"2");
    }

    #[tokio::test]
    async fn nak_redelivers_with_incremented_attempt_until_budget_spent() {
        let bus = InMemoryEventBus::new();
        let mut deliveries = bus
            .subscribe(Subscription::new("t").redelivery(policy(2)))
            .await
            .unwrap();
        bus.publish("t", None, vec![]).await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.envelope().delivery_attempt, 1);
        first
            .settle(replica_core::redelivery::Disposition::Nak(Duration::from_millis(5)))
            .await
            .unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.envelope().delivery_attempt, 2);
        second
            .settle(replica_core::redelivery::Disposition::Nak(Duration::from_millis(5)))
            .await
            .unwrap();

        assert!(bus.quiesce(Duration::from_secs(1)).await);
        assert_eq!(bus.count("t", |o| *o == SettleOutcome::Exhausted), 1);
    }

    #[tokio::test]
    async fn unsettled_delivery_is_abandoned_on_drop() {
        let bus = InMemoryEventBus::new();
        let mut deliveries = bus.subscribe(Subscription::new("t")).await.unwrap();
        bus.publish("t", None, vec![]).await.unwrap();
        assert_eq!(bus.in_flight(), 1);

        let delivery = deliveries.next().await.unwrap().unwrap();
        drop(delivery);

        assert_eq!(bus.in_flight(), 0);
        assert!(bus.quiesce(Duration::from_millis(100)).await);
        assert!(bus.settlements().is_empty());
    }

    #[tokio::test]
    async fn closed_subscription_abandons_queued_messages() {
        let bus = InMemoryEventBus::new();
        let deliveries = bus.subscribe(Subscription::new("t")).await.unwrap();
        bus.publish("t", None, b"1".to_vec()).await.unwrap();
        bus.publish("t", None, b"2".to_vec()).await.unwrap();
        assert_eq!(bus.in_flight(), 2);

        drop(deliveries);
        assert!(bus.quiesce(Duration::from_millis(100)).await);

        // Nobody is listening any more; the next publish is dropped at once.
        bus.publish("t", None, b"3".to_vec()).await.unwrap();
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn injected_publish_failure() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);

        assert!(bus.publish("t", None, vec![]).await.is_err());
        assert!(bus.publish("t", None, vec![]).await.is_ok());
        assert_eq!(bus.published().len(), 1);
    }
}
