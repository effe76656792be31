//! # Replica Testing
//!
//! Testing utilities for services built on `replica-core`.
//!
//! This crate provides:
//! - [`InMemoryEventBus`]: broker with queue groups, sequences and delayed
//!   redelivery
//! - [`InMemoryVersionedStore`]: transactional versioned store
//! - [`InMemoryDeadLetters`]: dead-letter sink that keeps everything
//! - [`FixedClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use replica_testing::{InMemoryEventBus, InMemoryVersionedStore, test_clock};
//!
//! #[tokio::test]
//! async fn ticket_update_reaches_replica() {
//!     let bus = InMemoryEventBus::new();
//!     let tickets = InMemoryVersionedStore::<Ticket>::new();
//!     let service = OrdersService::start(bus.clone(), tickets.clone(), test_clock()).await;
//!
//!     bus.publish("ticket.created", Some("1"), ticket_json(1, 0)).await?;
//!     assert!(bus.quiesce(Duration::from_secs(1)).await);
//!     assert_eq!(tickets.version_of(EntityId::new(1)).await, Some(Version::new(0)));
//! }
//! ```

use chrono::{DateTime, Utc};
use replica_core::environment::Clock;

pub mod event_bus;
pub mod versioned_store;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use replica_core::dead_letter::{DeadLetter, DeadLetterSink};
    use replica_core::store::StoreError;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until advanced, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use replica_testing::mocks::FixedClock;
    /// use replica_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// assert_eq!(time1, clock.now());
    ///
    /// clock.advance(Duration::minutes(16));
    /// assert_eq!(clock.now() - time1, Duration::minutes(16));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward. Clones share the same time.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap();
            *time += by;
        }
    }

    impl Clock for FixedClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Dead-letter sink that keeps every letter in memory.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryDeadLetters {
        letters: Arc<Mutex<Vec<DeadLetter>>>,
    }

    impl InMemoryDeadLetters {
        /// Create an empty sink.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Every recorded letter, oldest first.
        #[must_use]
        #[allow(clippy::unwrap_used)]
        pub fn letters(&self) -> Vec<DeadLetter> {
            self.letters.lock().unwrap().clone()
        }

        /// Number of recorded letters.
        #[must_use]
        pub fn len(&self) -> usize {
            self.letters().len()
        }

        /// Whether nothing was recorded.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl DeadLetterSink for InMemoryDeadLetters {
        #[allow(clippy::unwrap_used)]
        fn record(
            &self,
            letter: DeadLetter,
        ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
            self.letters.lock().unwrap().push(letter);
            Box::pin(async { Ok(()) })
        }
    }
}

/// Test helpers.
pub mod helpers {
    use replica_core::event;
    use serde::Serialize;

    /// Encode `snapshot` under `subject`, for publishing test fixtures.
    ///
    /// # Panics
    ///
    /// Panics if the snapshot cannot be serialized.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn envelope_bytes<T: Serialize>(subject: &str, snapshot: &T) -> Vec<u8> {
        event::encode(subject, snapshot).expect("test snapshot should serialize")
    }

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use event_bus::{InMemoryEventBus, Published, SettleOutcome, Settlement};
pub use mocks::{FixedClock, InMemoryDeadLetters, test_clock};
pub use versioned_store::{InMemoryTransaction, InMemoryVersionedStore};
