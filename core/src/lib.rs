//! # Replica Core
//!
//! Version-gated reconciliation of replicated entities.
//!
//! Services that own an entity publish a full snapshot of it, carrying a
//! monotonically increasing version, every time it changes. Other services keep
//! a local replica of that entity and apply the snapshots they consume. The
//! broker delivers at least once and in no particular order, so every inbound
//! snapshot passes a version gate before it may touch the replica:
//!
//! - **Stale** snapshots (version not newer than stored) are discarded.
//! - **Early** snapshots (a predecessor is missing) are handed back to the
//!   broker for delayed redelivery.
//! - **Next-in-line** snapshots are applied with a compare-and-swap update.
//!
//! ## Modules
//!
//! - [`stream`]: identifiers, versions and broker sequence numbers
//! - [`event`]: envelope and subject-keyed JSON codec
//! - [`event_bus`]: broker abstraction with explicit settlement
//! - [`redelivery`]: redelivery policy and broker dispositions
//! - [`store`]: versioned store and transaction traits
//! - [`error`]: reconciliation error taxonomy
//! - [`reconcile`]: the version gate and the reconciler
//! - [`apply`]: transactional apply and publish-before-commit
//! - [`router`]: subject routing and settlement
//! - [`dead_letter`]: records of abandoned messages
//! - [`environment`]: injected clock
//!
//! ## Example
//!
//! ```ignore
//! use replica_core::prelude::*;
//!
//! let tickets = Reconciler::new(PostgresReplicaStore::<Ticket>::new(pool.clone()));
//! let router = SubjectRouter::new(RedeliveryPolicy::default())
//!     .route("ticket.created", Arc::new(ReplicaHandler::<_, Ticket>::creation(tickets)));
//!
//! let mut deliveries = bus.subscribe(Subscription::new("ticket.created")).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     router.process(delivery?).await?;
//! }
//! ```

pub mod apply;
pub mod dead_letter;
pub mod environment;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod reconcile;
pub mod redelivery;
pub mod router;
pub mod store;
pub mod stream;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Commonly used types, for glob import.
pub mod prelude {
    pub use crate::apply::{Applied, Change, Relay, TransactionalError, publish_within};
    pub use crate::dead_letter::{DeadLetter, DeadLetterSink};
    pub use crate::environment::{Clock, SystemClock};
    pub use crate::error::{Malformed, ReconcileError};
    pub use crate::event::{CodecError, Envelope};
    pub use crate::event_bus::{
        Acknowledge, Delivery, DeliveryStream, EventBus, EventBusError, PublishAck, Subscription,
    };
    pub use crate::reconcile::{Decision, Reconciler, SubjectRole, decide};
    pub use crate::redelivery::{Disposition, RedeliveryPolicy};
    pub use crate::router::{Handled, MessageHandler, ReplicaHandler, SubjectRouter};
    pub use crate::store::{
        InsertOutcome, StoreError, StoredVersion, UnitOfWork, Versioned, VersionedStore,
        VersionedTransaction,
    };
    pub use crate::stream::{EntityId, Sequence, Version};
}
