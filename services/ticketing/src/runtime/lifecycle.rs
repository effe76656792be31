//! Process lifecycle and graceful shutdown.
//!
//! 1. **Startup**: spawn `workers` consumers for every routed subject, all in
//!    the service's queue group
//! 2. **Runtime**: process deliveries until Ctrl+C
//! 3. **Shutdown**: broadcast the signal, wait for consumers (bounded)
//!
//! A delivery in flight when its consumer stops is left unsettled and comes
//! back from the broker; the version gate absorbs the repeat.

use super::SubjectConsumer;
use replica_core::event_bus::{EventBus, Subscription};
use replica_core::router::SubjectRouter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A service's consumers, ready to start.
pub struct Application {
    name: String,
    bus: Arc<dyn EventBus>,
    router: Arc<SubjectRouter>,
    queue_group: String,
    workers: usize,
    retry_delay: Duration,
    shutdown_timeout: Duration,
}

impl Application {
    /// One worker per subject of `router`, consuming from `bus` in
    /// `queue_group`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn EventBus>,
        router: Arc<SubjectRouter>,
        queue_group: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            bus,
            router,
            queue_group: queue_group.into(),
            workers: 1,
            retry_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Competing workers per subject (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Delay before a consumer resubscribes.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// How long shutdown waits for consumers.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Spawn every consumer.
    #[must_use]
    pub fn start(self) -> RunningApplication {
        let (shutdown_tx, _) = broadcast::channel(1);
        let policy = *self.router.policy();

        let mut consumers = Vec::new();
        for subject in self.router.subjects() {
            for worker in 1..=self.workers {
                let subscription = Subscription::new(subject.as_str())
                    .queue_group(self.queue_group.as_str())
                    .redelivery(policy);
                let consumer = SubjectConsumer::new(
                    format!("{}/{subject}#{worker}", self.name),
                    subscription,
                    Arc::clone(&self.bus),
                    Arc::clone(&self.router),
                    shutdown_tx.subscribe(),
                )
                .with_retry_delay(self.retry_delay);
                consumers.push((consumer.name().to_string(), consumer.spawn()));
            }
        }

        info!(
            service = %self.name,
            queue_group = %self.queue_group,
            consumers = consumers.len(),
            nak_delay = ?policy.nak_delay,
            max_deliver = policy.max_deliver,
            "Consumers started"
        );

        RunningApplication {
            name: self.name,
            consumers,
            shutdown_tx,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    /// Start, run until Ctrl+C, then shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handler cannot be installed; the
    /// consumers are shut down first.
    pub async fn run(self) -> std::io::Result<()> {
        let running = self.start();
        let signal = tokio::signal::ctrl_c().await;
        if signal.is_ok() {
            info!(service = %running.name, "Shutdown signal received");
        }
        running.shutdown().await;
        signal
    }
}

/// Consumers of a started [`Application`].
pub struct RunningApplication {
    name: String,
    consumers: Vec<(String, JoinHandle<()>)>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl RunningApplication {
    /// Names of the running consumers.
    #[must_use]
    pub fn consumers(&self) -> Vec<&str> {
        self.consumers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Stop every consumer, waiting at most the shutdown timeout for each.
    pub async fn shutdown(self) {
        // Only fails when every consumer is already gone.
        let _ = self.shutdown_tx.send(());

        for (name, handle) in self.consumers {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(consumer = %name, error = %e, "Consumer task failed"),
                Err(_) => warn!(consumer = %name, "Consumer did not stop in time"),
            }
        }
        info!(service = %self.name, "Shutdown complete");
    }
}
