//! Subject routing of each service.

use crate::orders::{ExpirationHandler, OrderRepository, OrderSnapshot, OrdersService};
use crate::payments::ReplicatedOrder;
use crate::subjects::{
    EXPIRATION_COMPLETE, ORDER_CANCELLED, ORDER_CREATED, ORDER_UPDATED, TICKET_CREATED,
    TICKET_UPDATED,
};
use crate::tickets::Ticket;
use replica_core::reconcile::Reconciler;
use replica_core::redelivery::RedeliveryPolicy;
use replica_core::router::{ReplicaHandler, SubjectRouter};
use replica_core::store::VersionedStore;
use std::sync::Arc;

/// Router of the orders service: ticket replication and order expiration.
#[must_use]
pub fn orders_router<O, T>(service: Arc<OrdersService<O, T>>, policy: RedeliveryPolicy) -> SubjectRouter
where
    O: OrderRepository + 'static,
    T: VersionedStore<Entity = Ticket> + Clone + 'static,
{
    let tickets = service.tickets().clone();
    SubjectRouter::new(policy)
        .route(
            TICKET_CREATED,
            Arc::new(ReplicaHandler::<T, Ticket>::creation(Reconciler::new(tickets.clone()))),
        )
        .route(
            TICKET_UPDATED,
            Arc::new(ReplicaHandler::<T, Ticket>::mutation(Reconciler::new(tickets))),
        )
        .route(EXPIRATION_COMPLETE, Arc::new(ExpirationHandler::new(service)))
}

/// Router of the payments service: order replication.
///
/// `order.updated` and `order.cancelled` both carry the full order snapshot
/// and go through the same version gate.
#[must_use]
pub fn payments_router<R>(orders: R, policy: RedeliveryPolicy) -> SubjectRouter
where
    R: VersionedStore<Entity = ReplicatedOrder> + Clone + 'static,
{
    SubjectRouter::new(policy)
        .route(
            ORDER_CREATED,
            Arc::new(ReplicaHandler::<R, OrderSnapshot>::creation(Reconciler::new(orders.clone()))),
        )
        .route(
            ORDER_UPDATED,
            Arc::new(ReplicaHandler::<R, OrderSnapshot>::mutation(Reconciler::new(orders.clone()))),
        )
        .route(
            ORDER_CANCELLED,
            Arc::new(ReplicaHandler::<R, OrderSnapshot>::mutation(Reconciler::new(orders))),
        )
}
