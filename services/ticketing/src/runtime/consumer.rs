//! Subject consumer with automatic resubscription.
//!
//! ```text
//! loop {
//!     subscribe (queue group, redelivery policy)
//!         for each delivery: router.process(delivery)
//!     stream ended or subscribe failed: wait retry_delay
//! }
//! ```
//!
//! Settlement is entirely the router's business; the consumer only keeps the
//! stream alive and stops on the shutdown signal. A delivery that is not
//! settled when the consumer stops is redelivered by the broker.

use futures::StreamExt;
use replica_core::event_bus::{DeliveryStream, EventBus, Subscription};
use replica_core::router::SubjectRouter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// One worker consuming one subject.
pub struct SubjectConsumer {
    name: String,
    subscription: Subscription,
    bus: Arc<dyn EventBus>,
    router: Arc<SubjectRouter>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
}

impl SubjectConsumer {
    /// Create a consumer that resubscribes after 5 seconds.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        subscription: Subscription,
        bus: Arc<dyn EventBus>,
        router: Arc<SubjectRouter>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            subscription,
            bus,
            router,
            shutdown,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Set custom retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Consumer name, as used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(
            consumer = %self.name,
            subject = %self.subscription.subject,
            queue_group = ?self.subscription.queue_group,
            "Consumer started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                subscribed = self.bus.subscribe(self.subscription.clone()) => {
                    match subscribed {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, "Subscribed");
                            if self.process_stream(&mut stream).await {
                                break;
                            }
                            warn!(
                                consumer = %self.name,
                                retry_in = ?self.retry_delay,
                                "Delivery stream ended; resubscribing"
                            );
                        },
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                retry_in = ?self.retry_delay,
                                "Subscribe failed"
                            );
                        },
                    }
                    tokio::select! {
                        _ = self.shutdown.recv() => break,
                        () = tokio::time::sleep(self.retry_delay) => {},
                    }
                }
            }
        }

        info!(consumer = %self.name, "Consumer stopped");
    }

    /// Process deliveries until the stream ends (`false`) or shutdown (`true`).
    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return true,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(e) = self.router.process(delivery).await {
                            // The broker redelivers an unsettled message.
                            error!(consumer = %self.name, error = %e, "Settlement failed");
                        }
                    },
                    Some(Err(e)) => {
                        error!(consumer = %self.name, error = %e, "Error receiving delivery");
                    },
                    None => return false,
                },
            }
        }
    }
}
