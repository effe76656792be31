//! `expiration.complete` handling.

use super::{Expiry, OrderRepository, OrdersService};
use crate::tickets::Ticket;
use async_trait::async_trait;
use replica_core::error::ReconcileError;
use replica_core::event::{self, Envelope};
use replica_core::router::{Handled, MessageHandler};
use replica_core::store::VersionedStore;
use replica_core::stream::EntityId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Payload of `expiration.complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationComplete {
    /// The order whose window elapsed.
    pub order_id: EntityId,
}

/// Cancels orders whose reservation window elapsed.
pub struct ExpirationHandler<O, T> {
    service: Arc<OrdersService<O, T>>,
}

impl<O, T> ExpirationHandler<O, T> {
    /// Handle expirations through `service`.
    #[must_use]
    pub const fn new(service: Arc<OrdersService<O, T>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<O, T> MessageHandler for ExpirationHandler<O, T>
where
    O: OrderRepository + 'static,
    T: VersionedStore<Entity = Ticket> + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> Result<Handled, ReconcileError> {
        let expiration: ExpirationComplete = event::decode(envelope)?;
        match self.service.expire_order(expiration.order_id).await? {
            Expiry::Cancelled { ack, .. } => Ok(Handled::Published(ack)),
            Expiry::AlreadyCancelled => Ok(Handled::Skipped {
                reason: "order already cancelled",
            }),
        }
    }
}
