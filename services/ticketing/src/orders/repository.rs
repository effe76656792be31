//! Order queries beyond the versioned store contract.

use super::Order;
use crate::types::{OrderStatus, UserId};
use replica_core::store::{StoreError, Versioned, VersionedStore, VersionedTransaction};
use replica_core::stream::EntityId;
use replica_postgres::{PgEntity, PgTransaction, PostgresReplicaStore};
use replica_testing::{InMemoryTransaction, InMemoryVersionedStore};
use std::future::Future;

/// Allocates ids for entities this service owns.
pub trait IdAllocator: Send + Sync {
    /// A fresh id, never returned before.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the id source is unavailable.
    fn allocate_id(&self) -> impl Future<Output = Result<EntityId, StoreError>> + Send;
}

impl<E: PgEntity> IdAllocator for PostgresReplicaStore<E> {
    async fn allocate_id(&self) -> Result<EntityId, StoreError> {
        self.next_id().await
    }
}

impl<E: Versioned> IdAllocator for InMemoryVersionedStore<E> {
    async fn allocate_id(&self) -> Result<EntityId, StoreError> {
        Ok(self.next_id())
    }
}

/// Store of owned orders.
pub trait OrderRepository: VersionedStore<Entity = Order> + IdAllocator {
    /// Read `id` inside `tx`, locking it until the transaction ends.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on infrastructure failure.
    fn find_for_update(
        &self,
        tx: &mut Self::Transaction,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// The order currently reserving `ticket_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on infrastructure failure.
    fn reserving_order(
        &self,
        tx: &mut Self::Transaction,
        ticket_id: EntityId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// Every order placed by `user`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on infrastructure failure.
    fn orders_of(&self, user: &UserId) -> impl Future<Output = Result<Vec<Order>, StoreError>> + Send;
}

impl OrderRepository for PostgresReplicaStore<Order> {
    async fn find_for_update(
        &self,
        tx: &mut PgTransaction<Order>,
        id: EntityId,
    ) -> Result<Option<Order>, StoreError> {
        let rows = tx.select_where_for_update("id = $1", id.value()).await?;
        Ok(rows.into_iter().next())
    }

    async fn reserving_order(
        &self,
        tx: &mut PgTransaction<Order>,
        ticket_id: EntityId,
    ) -> Result<Option<Order>, StoreError> {
        let rows = tx
            .select_where_for_update("ticket_id = $1 AND status <> 'cancelled'", ticket_id.value())
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn orders_of(&self, user: &UserId) -> Result<Vec<Order>, StoreError> {
        self.select_where("user_id = $1", user.as_str().to_string()).await
    }
}

impl OrderRepository for InMemoryVersionedStore<Order> {
    async fn find_for_update(
        &self,
        tx: &mut InMemoryTransaction<Order>,
        id: EntityId,
    ) -> Result<Option<Order>, StoreError> {
        // The in-memory transaction already holds the whole store.
        tx.find(id).await
    }

    async fn reserving_order(
        &self,
        tx: &mut InMemoryTransaction<Order>,
        ticket_id: EntityId,
    ) -> Result<Option<Order>, StoreError> {
        Ok(tx
            .rows()
            .find(|order| order.ticket_id == ticket_id && order.status != OrderStatus::Cancelled)
            .cloned())
    }

    async fn orders_of(&self, user: &UserId) -> Result<Vec<Order>, StoreError> {
        let mut orders = self.all().await;
        orders.retain(|order| order.is_owned_by(user));
        Ok(orders)
    }
}
