//! Redpanda event bus for replica services.
//!
//! This crate implements the [`EventBus`] trait from `replica-core` on top of
//! rdkafka, so it works against Redpanda or any other Kafka-compatible broker.
//!
//! # Mapping
//!
//! | Engine concept | Kafka concept |
//! |---|---|
//! | subject | topic |
//! | sequence | partition offset |
//! | queue group | consumer group |
//! | ack / term | offset commit |
//! | nak(delay) | re-produce with attempt and not-before headers, then commit |
//!
//! Publishing keys every message by its entity id, so all messages of one
//! entity on one subject land in one partition.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - A partition's offset is committed only once the worker settled the message
//! - The subscription hands out one message at a time and waits for its
//!   settlement before fetching the next
//! - If the process crashes before a commit, the message is delivered again
//!
//! Kafka has no native negative acknowledgment. A nak therefore re-appends the
//! message to its topic with an incremented [`ATTEMPT_HEADER`] and a
//! [`NOT_BEFORE_HEADER`] deadline, and commits the original. The consumer waits
//! for the deadline when it reaches the copy. Once the policy's delivery budget
//! is spent, a nak commits without re-appending: the message is gone.
//!
//! # Example
//!
//! ```no_run
//! use replica_core::event_bus::{EventBus, Subscription};
//! use replica_redpanda::RedpandaEventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::new("localhost:9092")?;
//!
//! let ack = bus.publish("ticket.created", Some("42"), b"{}".to_vec()).await?;
//! println!("stored at {}", ack.sequence);
//!
//! let mut deliveries = bus
//!     .subscribe(Subscription::new("ticket.created").queue_group("orders-service"))
//!     .await?;
//! while let Some(Ok(delivery)) = deliveries.next().await {
//!     println!("received {}", delivery.envelope());
//!     delivery.settle(replica_core::redelivery::Disposition::Ack).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use replica_core::event::Envelope;
use replica_core::event_bus::{
    Acknowledge, Delivery, DeliveryStream, EventBus, EventBusError, PublishAck, SettleFuture,
    Subscription,
};
use replica_core::redelivery::{Disposition, RedeliveryPolicy};
use replica_core::stream::Sequence;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Header carrying the delivery attempt of a re-appended message.
pub const ATTEMPT_HEADER: &str = "replica-attempt";

/// Header carrying the earliest redelivery time, in Unix milliseconds.
pub const NOT_BEFORE_HEADER: &str = "replica-not-before";

/// Redpanda event bus implementation.
///
/// # Example
///
/// ```no_run
/// use replica_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Basic configuration
/// let bus = RedpandaEventBus::new("localhost:9092")?;
///
/// // Custom configuration
/// let bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a new Redpanda event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created from the given broker list.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: `"1"` or `"all"`.
    ///
    /// Default: `"all"`. A publish only resolves once the broker persisted the
    /// message, so weaker modes are not offered.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many deliveries may wait in a subscription's channel.
    ///
    /// Values below 1 are raised to 1. Default: 16
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set where a new queue group starts reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so messages published before the first worker
    /// of a group came up are still replicated. Private subscriptions always
    /// start at `"latest"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", acks)
            .set("enable.idempotence", "true")
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let buffer_size = self.buffer_size.unwrap_or(16);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            buffer_size,
            auto_offset_reset,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        subject: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, EventBusError>> + Send + '_>> {
        let subject = subject.to_string();
        let key = key.map(str::to_string);

        Box::pin(async move {
            let mut record = FutureRecord::<str, [u8]>::to(&subject).payload(&payload[..]);
            if let Some(key) = key.as_deref() {
                record = record.key(key);
            }

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        subject = %subject,
                        partition,
                        offset,
                        key = key.as_deref().unwrap_or(""),
                        "Message published"
                    );
                    Ok(PublishAck {
                        stream: format!("{subject}/{partition}"),
                        sequence: Sequence::new(offset.unsigned_abs()),
                    })
                },
                Err((kafka_error, _)) => {
                    tracing::error!(subject = %subject, error = %kafka_error, "Failed to publish message");
                    Err(EventBusError::PublishFailed {
                        subject,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        subscription: Subscription,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let group_id = consumer_group_for(&subscription);
            let offset_reset = if subscription.queue_group.is_some() {
                self.auto_offset_reset.as_str()
            } else {
                "latest"
            };
            let subject = subscription.subject.clone();

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    subject: subject.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[subject.as_str()])
                .map_err(|e| EventBusError::SubscriptionFailed {
                    subject: subject.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                subject = %subject,
                consumer_group = %group_id,
                offset_reset,
                max_deliver = subscription.redelivery.max_deliver,
                "Subscribed"
            );

            let (tx, mut rx) = mpsc::channel(self.buffer_size);
            let forwarder = Forwarder {
                consumer: Arc::new(consumer),
                producer: self.producer.clone(),
                timeout: self.timeout,
                policy: subscription.redelivery,
            };
            tokio::spawn(forwarder.run(tx));

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Consumer group for a subscription: the queue group, or a private name.
fn consumer_group_for(subscription: &Subscription) -> String {
    subscription.queue_group.clone().unwrap_or_else(|| {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!(
            "replica-private-{}-{}-{nanos}",
            subscription.subject,
            std::process::id()
        )
    })
}

/// Headers marking a re-appended message.
fn redelivery_headers(attempt: u32, not_before_ms: i64) -> OwnedHeaders {
    let attempt = attempt.to_string();
    let not_before = not_before_ms.to_string();
    OwnedHeaders::new()
        .insert(Header {
            key: ATTEMPT_HEADER,
            value: Some(attempt.as_str()),
        })
        .insert(Header {
            key: NOT_BEFORE_HEADER,
            value: Some(not_before.as_str()),
        })
}

fn header_value<'a, H: Headers>(headers: Option<&'a H>, name: &str) -> Option<&'a str> {
    headers?
        .iter()
        .find(|header| header.key == name)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
}

/// Delivery attempt of a message; 1 when it was never re-appended.
fn read_attempt<H: Headers>(headers: Option<&H>) -> u32 {
    header_value(headers, ATTEMPT_HEADER)
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|attempt| *attempt > 0)
        .unwrap_or(1)
}

fn read_not_before<H: Headers>(headers: Option<&H>) -> Option<i64> {
    header_value(headers, NOT_BEFORE_HEADER).and_then(|value| value.parse().ok())
}

fn commit_offset(
    consumer: &StreamConsumer,
    topic: &str,
    partition: i32,
    offset: i64,
) -> Result<(), EventBusError> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
        .and_then(|()| consumer.commit(&list, CommitMode::Async))
        .map_err(|e| EventBusError::SettleFailed {
            subject: topic.to_string(),
            reason: format!("Failed to commit offset {offset}: {e}"),
        })
}

/// Outcome reported by an acknowledger back to the forwarding task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    /// Move on to the next message.
    Done,
    /// The nak could not be recorded; deliver this message again.
    Retry,
}

/// Owns a consumer and hands its messages out one at a time.
struct Forwarder {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    timeout: Duration,
    policy: RedeliveryPolicy,
}

impl Forwarder {
    async fn run(self, tx: mpsc::Sender<Result<Delivery, EventBusError>>) {
        loop {
            // Detach right away: a borrowed message must not live across an await.
            let received = self.consumer.recv().await.map(|message| message.detach());
            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to receive message");
                    let error = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                    if tx.send(Err(error)).await.is_err() {
                        break;
                    }
                    continue;
                },
            };

            if !self.forward(message, &tx).await {
                break;
            }
        }

        tracing::debug!("Consumer task exiting");
    }

    /// Deliver one message until it is settled. Returns `false` once the
    /// subscriber is gone.
    async fn forward(
        &self,
        message: OwnedMessage,
        tx: &mpsc::Sender<Result<Delivery, EventBusError>>,
    ) -> bool {
        let mut attempt = read_attempt(message.headers());
        if let Some(not_before) = read_not_before(message.headers()) {
            let wait = not_before.saturating_sub(Utc::now().timestamp_millis());
            if wait > 0 {
                tokio::time::sleep(Duration::from_millis(wait.unsigned_abs())).await;
            }
        }

        loop {
            let (settled_tx, settled_rx) = oneshot::channel();
            let envelope = Envelope::new(message.topic(), message.payload().unwrap_or_default().to_vec())
                .with_attempt(attempt)
                .with_sequence(Sequence::new(message.offset().unsigned_abs()));
            let acker = KafkaAcker {
                consumer: Arc::clone(&self.consumer),
                producer: self.producer.clone(),
                timeout: self.timeout,
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().unwrap_or_default().to_vec(),
                attempt,
                policy: self.policy,
                settled: settled_tx,
            };

            if tx.send(Ok(Delivery::new(envelope, Box::new(acker)))).await.is_err() {
                // Subscriber gone: leave the offset uncommitted.
                return false;
            }

            match settled_rx.await {
                Ok(Settled::Done) => return true,
                Ok(Settled::Retry) | Err(_) => {
                    if !self.policy.allows_redelivery(attempt) {
                        tracing::warn!(
                            topic = message.topic(),
                            offset = message.offset(),
                            attempt,
                            "Delivery budget exhausted, discarding message"
                        );
                        if let Err(e) = commit_offset(
                            &self.consumer,
                            message.topic(),
                            message.partition(),
                            message.offset(),
                        ) {
                            tracing::warn!(error = %e, "Commit failed (message may be redelivered)");
                        }
                        return true;
                    }
                    tokio::time::sleep(self.policy.nak_delay).await;
                    attempt = attempt.saturating_add(1);
                },
            }
        }
    }
}

struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    timeout: Duration,
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    attempt: u32,
    policy: RedeliveryPolicy,
    settled: oneshot::Sender<Settled>,
}

impl KafkaAcker {
    fn commit(&self) -> Result<(), EventBusError> {
        commit_offset(&self.consumer, &self.topic, self.partition, self.offset)
    }

    async fn republish(&self, delay: Duration) -> Result<(), EventBusError> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let not_before = Utc::now().timestamp_millis().saturating_add(delay_ms);
        let next_attempt = self.attempt.saturating_add(1);

        let mut record = FutureRecord::<[u8], [u8]>::to(&self.topic)
            .payload(&self.payload[..])
            .headers(redelivery_headers(next_attempt, not_before));
        if let Some(key) = self.key.as_deref() {
            record = record.key(key);
        }

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| EventBusError::SettleFailed {
                subject: self.topic.clone(),
                reason: format!("Failed to re-append for redelivery: {e}"),
            })?;

        metrics::counter!("replica.redeliveries", "subject" => self.topic.clone()).increment(1);
        tracing::debug!(
            topic = %self.topic,
            offset = self.offset,
            next_attempt,
            not_before,
            "Message scheduled for redelivery"
        );
        Ok(())
    }

    async fn settle(self, disposition: Disposition) -> Result<(), EventBusError> {
        let (outcome, result) = match disposition {
            Disposition::Ack | Disposition::Term => (Settled::Done, self.commit()),
            Disposition::Nak(delay) if self.policy.allows_redelivery(self.attempt) => {
                match self.republish(delay).await {
                    Ok(()) => (Settled::Done, self.commit()),
                    Err(e) => (Settled::Retry, Err(e)),
                }
            },
            Disposition::Nak(_) => {
                tracing::warn!(
                    topic = %self.topic,
                    offset = self.offset,
                    attempt = self.attempt,
                    "Delivery budget exhausted, discarding message"
                );
                (Settled::Done, self.commit())
            },
        };

        if self.settled.send(outcome).is_err() {
            tracing::trace!("Consumer task already gone");
        }
        result
    }
}

impl Acknowledge for KafkaAcker {
    fn ack(self: Box<Self>) -> SettleFuture {
        Box::pin(self.settle(Disposition::Ack))
    }

    fn nak(self: Box<Self>, delay: Duration) -> SettleFuture {
        Box::pin(self.settle(Disposition::Nak(delay)))
    }

    fn term(self: Box<Self>) -> SettleFuture {
        Box::pin(self.settle(Disposition::Term))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
        assert_send::<KafkaAcker>();
        assert_sync::<KafkaAcker>();
    }

    #[test]
    fn build_without_brokers_fails() {
        assert!(matches!(
            RedpandaEventBus::builder().build(),
            Err(EventBusError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn queue_group_becomes_consumer_group() {
        let subscription = Subscription::new("ticket.created").queue_group("orders-service");
        assert_eq!(consumer_group_for(&subscription), "orders-service");
    }

    #[test]
    fn private_subscription_gets_its_own_group() {
        let group = consumer_group_for(&Subscription::new("order.updated"));
        assert!(group.starts_with("replica-private-order.updated-"));
    }

    #[test]
    fn redelivery_headers_are_read_back() {
        let headers = redelivery_headers(3, 1_700_000_000_000);
        assert_eq!(read_attempt(Some(&headers)), 3);
        assert_eq!(read_not_before(Some(&headers)), Some(1_700_000_000_000));
    }

    #[test]
    fn first_delivery_has_attempt_one() {
        assert_eq!(read_attempt::<OwnedHeaders>(None), 1);
        assert_eq!(read_not_before::<OwnedHeaders>(None), None);

        let garbage = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some("many"),
        });
        assert_eq!(read_attempt(Some(&garbage)), 1);

        let zero = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some("0"),
        });
        assert_eq!(read_attempt(Some(&zero)), 1);
    }
}
