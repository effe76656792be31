//! Local store boundary for versioned entities.
//!
//! The reconciliation engine needs exactly four capabilities from the local
//! store, all defined here:
//!
//! - point lookup by id returning a minimal projection ([`StoredVersion`])
//! - insert-if-absent ([`VersionedTransaction::insert`])
//! - compare-and-swap update gated on a previously read version
//!   ([`VersionedTransaction::update_if_version`])
//! - a transaction wrapping the above plus an external publish ([`UnitOfWork`])
//!
//! # Implementations
//!
//! - `PostgresReplicaStore` (in `replica-postgres`): production
//! - `InMemoryVersionedStore` (in `replica-testing`): deterministic tests
//!
//! # Concurrency
//!
//! No entity state may be cached between the gate's lookup and the write: the
//! conditional update re-validates the version at write time, so two workers
//! racing on the same version see exactly one successful update.

use crate::stream::{EntityId, Version};
use std::future::Future;
use thiserror::Error;

/// Errors raised by a local store.
///
/// All variants are infrastructure failures; protocol outcomes (duplicate
/// insert, lost compare-and-swap) are reported through return values instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store unreachable or connection pool exhausted.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Query or write failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A stored row could not be mapped back to its entity.
    #[error("Corrupt row in '{table}': {reason}")]
    CorruptRow {
        /// Table holding the row.
        table: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// An entity whose local copy is governed by the version gate.
pub trait Versioned: Clone + Send + Sync + 'static {
    /// Entity kind, used in logs, metrics and error messages.
    const KIND: &'static str;

    /// Id assigned by the owning service.
    fn id(&self) -> EntityId;

    /// Version asserted by this snapshot.
    fn version(&self) -> Version;

    /// Whether this state is absorbing: no later mutation may apply to it.
    fn is_terminal(&self) -> bool {
        false
    }
}

/// Minimal projection returned by the gate's lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredVersion {
    /// Entity id.
    pub id: EntityId,
    /// Version currently stored.
    pub version: Version,
    /// Whether the stored state is absorbing.
    pub terminal: bool,
}

impl StoredVersion {
    /// Projection of a non-terminal entity.
    #[must_use]
    pub const fn new(id: EntityId, version: Version) -> Self {
        Self {
            id,
            version,
            terminal: false,
        }
    }

    /// Mark the projection as terminal.
    #[must_use]
    pub const fn terminal(mut self, terminal: bool) -> Self {
        self.terminal = terminal;
        self
    }

    /// Projection of a full entity.
    #[must_use]
    pub fn of<E: Versioned>(entity: &E) -> Self {
        Self::new(entity.id(), entity.version()).terminal(entity.is_terminal())
    }
}

/// Outcome of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was created.
    Inserted,
    /// A row with the same id already existed; nothing was written.
    AlreadyExists,
}

/// A unit of work that commits or rolls back as a whole.
///
/// Dropping a unit of work without committing rolls it back.
pub trait UnitOfWork: Send {
    /// Make every write of this unit durable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; nothing is then persisted.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Discard every write of this unit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store could not be told; the writes are
    /// discarded regardless.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Transactional access to one kind of versioned entity.
pub trait VersionedTransaction: UnitOfWork {
    /// Entity kind handled by this transaction.
    type Entity: Versioned;

    /// Id-only lookup within the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on infrastructure failure.
    fn lookup(
        &mut self,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<StoredVersion>, StoreError>> + Send;

    /// Full row lookup within the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on infrastructure failure.
    fn find(
        &mut self,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<Self::Entity>, StoreError>> + Send;

    /// Insert the entity unless a row with its id exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on infrastructure failure.
    fn insert(
        &mut self,
        entity: &Self::Entity,
    ) -> impl Future<Output = Result<InsertOutcome, StoreError>> + Send;

    /// Overwrite the row with `entity` only if its stored version is `expected`.
    ///
    /// Returns `false` when no row matched (another writer advanced the version).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on infrastructure failure.
    fn update_if_version(
        &mut self,
        entity: &Self::Entity,
        expected: Version,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// A store of versioned entities of one kind.
pub trait VersionedStore: Send + Sync {
    /// Entity kind held by this store.
    type Entity: Versioned;

    /// Transaction type.
    type Transaction: VersionedTransaction<Entity = Self::Entity>;

    /// Id-only lookup outside any transaction (the gate's read).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on infrastructure failure.
    fn lookup(
        &self,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<StoredVersion>, StoreError>> + Send;

    /// Full row lookup outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on infrastructure failure.
    fn get(
        &self,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<Self::Entity>, StoreError>> + Send;

    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if no transaction could be opened.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StoreError>> + Send;
}
