//! In-memory versioned store.
//!
//! Transactions take the store lock for their whole lifetime and work on a
//! copy of the rows that replaces the stored rows on commit. Reads outside a
//! transaction wait for the running transaction to finish, so a lookup never
//! sees uncommitted writes.

#![allow(clippy::missing_panics_doc)]

use replica_core::store::{
    InsertOutcome, StoreError, StoredVersion, UnitOfWork, Versioned, VersionedStore,
    VersionedTransaction,
};
use replica_core::stream::{EntityId, Version};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Rows<E> = BTreeMap<EntityId, E>;

/// In-memory [`VersionedStore`] for tests.
///
/// Cloning shares the rows.
#[derive(Debug)]
pub struct InMemoryVersionedStore<E> {
    rows: Arc<Mutex<Rows<E>>>,
    ids: Arc<AtomicI64>,
    failures: Arc<AtomicUsize>,
}

impl<E> Clone for InMemoryVersionedStore<E> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            ids: Arc::clone(&self.ids),
            failures: Arc::clone(&self.failures),
        }
    }
}

impl<E: Versioned> Default for InMemoryVersionedStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Versioned> InMemoryVersionedStore<E> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(BTreeMap::new())),
            ids: Arc::new(AtomicI64::new(0)),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a store holding `entities`.
    pub async fn with_rows(entities: impl IntoIterator<Item = E>) -> Self {
        let store = Self::new();
        store.seed(entities).await;
        store
    }

    /// Put `entities` into the store as if committed.
    pub async fn seed(&self, entities: impl IntoIterator<Item = E>) {
        let mut rows = self.rows.lock().await;
        for entity in entities {
            self.ids.fetch_max(entity.id().value(), Ordering::SeqCst);
            rows.insert(entity.id(), entity);
        }
    }

    /// Every committed row, ordered by id.
    pub async fn all(&self) -> Vec<E> {
        self.rows.lock().await.values().cloned().collect()
    }

    /// Committed version of `id`, for assertions.
    pub async fn version_of(&self, id: EntityId) -> Option<Version> {
        self.rows.lock().await.get(&id).map(Versioned::version)
    }

    /// Allocate the next id, above every seeded or allocated id.
    #[must_use]
    pub fn next_id(&self) -> EntityId {
        EntityId::new(self.ids.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Make the next `count` store operations (lookups and `begin`) fail with
    /// [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let consumed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

/// Transaction over an [`InMemoryVersionedStore`].
pub struct InMemoryTransaction<E> {
    guard: OwnedMutexGuard<Rows<E>>,
    working: Rows<E>,
}

impl<E: Versioned> InMemoryTransaction<E> {
    /// Rows as seen by this transaction, ordered by id.
    pub fn rows(&self) -> impl Iterator<Item = &E> {
        self.working.values()
    }
}

impl<E: Versioned> UnitOfWork for InMemoryTransaction<E> {
    async fn commit(mut self) -> Result<(), StoreError> {
        *self.guard = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<E: Versioned> VersionedTransaction for InMemoryTransaction<E> {
    type Entity = E;

    async fn lookup(&mut self, id: EntityId) -> Result<Option<StoredVersion>, StoreError> {
        Ok(self.working.get(&id).map(StoredVersion::of))
    }

    async fn find(&mut self, id: EntityId) -> Result<Option<E>, StoreError> {
        Ok(self.working.get(&id).cloned())
    }

    async fn insert(&mut self, entity: &E) -> Result<InsertOutcome, StoreError> {
        if self.working.contains_key(&entity.id()) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.working.insert(entity.id(), entity.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update_if_version(&mut self, entity: &E, expected: Version) -> Result<bool, StoreError> {
        match self.working.get_mut(&entity.id()) {
            Some(row) if row.version() == expected => {
                *row = entity.clone();
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}

impl<E: Versioned> VersionedStore for InMemoryVersionedStore<E> {
    type Entity = E;
    type Transaction = InMemoryTransaction<E>;

    async fn lookup(&self, id: EntityId) -> Result<Option<StoredVersion>, StoreError> {
        self.injected_failure()?;
        Ok(self.rows.lock().await.get(&id).map(StoredVersion::of))
    }

    async fn get(&self, id: EntityId) -> Result<Option<E>, StoreError> {
        self.injected_failure()?;
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn begin(&self) -> Result<InMemoryTransaction<E>, StoreError> {
        self.injected_failure()?;
        let guard = Arc::clone(&self.rows).lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTransaction { guard, working })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Row {
        id: EntityId,
        version: Version,
    }

    impl Versioned for Row {
        const KIND: &'static str = "row";

        fn id(&self) -> EntityId {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }
    }

    fn row(id: i64, version: u64) -> Row {
        Row {
            id: EntityId::new(id),
            version: Version::new(version),
        }
    }

    #[tokio::test]
    async fn committed_writes_are_visible() {
        let store = InMemoryVersionedStore::new();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.insert(&row(1, 0)).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(tx.insert(&row(1, 0)).await.unwrap(), InsertOutcome::AlreadyExists);
        tx.commit().await.unwrap();

        assert_eq!(store.version_of(EntityId::new(1)).await, Some(Version::new(0)));
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = InMemoryVersionedStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(&row(1, 0)).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.lookup(EntityId::new(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = InMemoryVersionedStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(&row(1, 0)).await.unwrap();
        }
        assert!(store.all().await.is_empty());
    }

    #[tokio::test]
    async fn update_is_guarded_by_expected_version() {
        let store = InMemoryVersionedStore::with_rows([row(1, 3)]).await;
        let mut tx = store.begin().await.unwrap();

        assert!(!tx.update_if_version(&row(1, 5), Version::new(4)).await.unwrap());
        assert!(tx.update_if_version(&row(1, 4), Version::new(3)).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.version_of(EntityId::new(1)).await, Some(Version::new(4)));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store: InMemoryVersionedStore<Row> = InMemoryVersionedStore::new();
        store.fail_next(1);

        assert!(matches!(
            store.lookup(EntityId::new(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.lookup(EntityId::new(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ids_continue_after_seeded_rows() {
        let store = InMemoryVersionedStore::with_rows([row(41, 0)]).await;
        assert_eq!(store.next_id(), EntityId::new(42));
        assert_eq!(store.next_id(), EntityId::new(43));
    }
}
