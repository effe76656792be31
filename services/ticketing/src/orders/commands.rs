//! Commands originating in the orders service.
//!
//! Every mutation follows the same path: validate, write the order, publish
//! the snapshot, commit. The publish runs inside the transaction, so an order
//! change is never committed without its notification and the caller gets the
//! broker sequence as proof that downstream services will hear about it.

use super::{Order, OrderRepository, OrderSnapshot};
use crate::error::CommandError;
use crate::subjects::{ORDER_CANCELLED, ORDER_CREATED};
use crate::tickets::Ticket;
use crate::types::{Money, OrderStatus, UserId};
use replica_core::apply::publish_snapshot_within;
use replica_core::environment::Clock;
use replica_core::event_bus::{EventBus, PublishAck};
use replica_core::store::{InsertOutcome, UnitOfWork, Versioned, VersionedStore, VersionedTransaction};
use replica_core::stream::{EntityId, Sequence, Version};
use std::sync::Arc;

/// How long a new order reserves its ticket, in seconds.
pub const DEFAULT_EXPIRATION_WINDOW: i64 = 15 * 60;

/// Outcome of [`OrdersService::expire_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// The order was cancelled and the cancellation published.
    Cancelled {
        /// The order as stored now.
        order: Order,
        /// Broker acknowledgment of `order.cancelled`.
        ack: PublishAck,
    },
    /// The order was already cancelled; nothing was published.
    AlreadyCancelled,
}

/// The orders service's command side.
pub struct OrdersService<O, T> {
    orders: O,
    tickets: T,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    expiration_window: chrono::Duration,
}

impl<O, T> OrdersService<O, T>
where
    O: OrderRepository,
    T: VersionedStore<Entity = Ticket>,
{
    /// Create the service.
    #[must_use]
    pub fn new(orders: O, tickets: T, bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            orders,
            tickets,
            bus,
            clock,
            expiration_window: chrono::Duration::seconds(DEFAULT_EXPIRATION_WINDOW),
        }
    }

    /// Reserve tickets for `window` instead of the default.
    #[must_use]
    pub const fn with_expiration_window(mut self, window: chrono::Duration) -> Self {
        self.expiration_window = window;
        self
    }

    /// The order store.
    #[must_use]
    pub const fn orders(&self) -> &O {
        &self.orders
    }

    /// The ticket replica store.
    #[must_use]
    pub const fn tickets(&self) -> &T {
        &self.tickets
    }

    /// Place an order for `ticket_id` on behalf of `caller`.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotFound`]: the ticket is not known locally
    /// - [`CommandError::TicketReserved`]: another live order holds the ticket
    /// - [`CommandError::Store`] / [`CommandError::Publish`]: nothing was
    ///   committed
    pub async fn create_order(
        &self,
        caller: &UserId,
        ticket_id: EntityId,
    ) -> Result<(Order, Sequence), CommandError> {
        let ticket = self
            .tickets
            .get(ticket_id)
            .await?
            .ok_or(CommandError::NotFound {
                kind: Ticket::KIND,
                id: ticket_id,
            })?;

        let order = Order {
            id: self.orders.allocate_id().await?,
            version: Version::INITIAL,
            user_id: caller.clone(),
            ticket_id,
            status: OrderStatus::Created,
            expires_at: self.clock.now() + self.expiration_window,
        };

        let mut tx = self.orders.begin().await?;
        if self.orders.reserving_order(&mut tx, ticket_id).await?.is_some() {
            tx.rollback().await?;
            return Err(CommandError::TicketReserved(ticket_id));
        }
        if tx.insert(&order).await? == InsertOutcome::AlreadyExists {
            // Lost the race for the ticket to a concurrent order.
            tx.rollback().await?;
            return Err(CommandError::TicketReserved(ticket_id));
        }

        let key = order.id.to_string();
        let ack = publish_snapshot_within(
            tx,
            self.bus.as_ref(),
            ORDER_CREATED,
            Some(&key),
            &OrderSnapshot::of(&order, ticket.price),
        )
        .await?;

        tracing::info!(
            order_id = %order.id,
            ticket_id = %ticket_id,
            user_id = %caller,
            expires_at = %order.expires_at,
            sequence = %ack.sequence,
            "Order created"
        );
        Ok((order, ack.sequence))
    }

    /// Cancel `order_id` on behalf of its owner.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotFound`], [`CommandError::NotOwner`],
    ///   [`CommandError::TerminalState`]: nothing changed
    /// - [`CommandError::Conflict`]: the order changed underneath
    /// - [`CommandError::Store`] / [`CommandError::Publish`]: rolled back
    pub async fn cancel_order(
        &self,
        caller: &UserId,
        order_id: EntityId,
    ) -> Result<(Order, Sequence), CommandError> {
        let mut tx = self.orders.begin().await?;
        let Some(order) = self.orders.find_for_update(&mut tx, order_id).await? else {
            tx.rollback().await?;
            return Err(not_found(order_id));
        };
        if !order.is_owned_by(caller) {
            tx.rollback().await?;
            return Err(CommandError::NotOwner {
                kind: Order::KIND,
                id: order_id,
            });
        }
        if order.is_terminal() {
            tx.rollback().await?;
            return Err(CommandError::TerminalState {
                kind: Order::KIND,
                id: order_id,
            });
        }

        let (order, ack) = self.cancel_within(tx, &order).await?;
        tracing::info!(
            order_id = %order.id,
            user_id = %caller,
            version = %order.version,
            sequence = %ack.sequence,
            "Order cancelled"
        );
        Ok((order, ack.sequence))
    }

    /// Cancel `order_id` because its reservation window elapsed.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotFound`]: the order is unknown
    /// - [`CommandError::Conflict`], [`CommandError::Store`],
    ///   [`CommandError::Publish`]: nothing changed; retry later
    pub async fn expire_order(&self, order_id: EntityId) -> Result<Expiry, CommandError> {
        let mut tx = self.orders.begin().await?;
        let Some(order) = self.orders.find_for_update(&mut tx, order_id).await? else {
            tx.rollback().await?;
            return Err(not_found(order_id));
        };
        if order.is_terminal() {
            tx.rollback().await?;
            tracing::debug!(order_id = %order_id, "Order already cancelled; nothing to expire");
            return Ok(Expiry::AlreadyCancelled);
        }

        let (order, ack) = self.cancel_within(tx, &order).await?;
        tracing::info!(
            order_id = %order.id,
            version = %order.version,
            sequence = %ack.sequence,
            "Order expired"
        );
        Ok(Expiry::Cancelled { order, ack })
    }

    /// `order_id`, if `caller` placed it.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotFound`], [`CommandError::NotOwner`] or
    /// [`CommandError::Store`].
    pub async fn get_order(&self, caller: &UserId, order_id: EntityId) -> Result<Order, CommandError> {
        let order = self.orders.get(order_id).await?.ok_or_else(|| not_found(order_id))?;
        if !order.is_owned_by(caller) {
            return Err(CommandError::NotOwner {
                kind: Order::KIND,
                id: order_id,
            });
        }
        Ok(order)
    }

    /// Every order placed by `caller`.
    ///
    /// # Errors
    ///
    /// [`CommandError::Store`] on infrastructure failure.
    pub async fn list_orders(&self, caller: &UserId) -> Result<Vec<Order>, CommandError> {
        Ok(self.orders.orders_of(caller).await?)
    }

    /// Write the cancelled successor of `current` and publish it within `tx`.
    async fn cancel_within(
        &self,
        mut tx: O::Transaction,
        current: &Order,
    ) -> Result<(Order, PublishAck), CommandError> {
        let price = match self.ticket_price(current.ticket_id).await {
            Ok(price) => price,
            Err(error) => {
                tx.rollback().await?;
                return Err(error);
            },
        };

        let cancelled = current.cancelled();
        if !tx.update_if_version(&cancelled, current.version).await? {
            tx.rollback().await?;
            return Err(CommandError::Conflict {
                kind: Order::KIND,
                id: current.id,
                expected: current.version,
            });
        }

        let key = cancelled.id.to_string();
        let ack = publish_snapshot_within(
            tx,
            self.bus.as_ref(),
            ORDER_CANCELLED,
            Some(&key),
            &OrderSnapshot::of(&cancelled, price),
        )
        .await?;
        Ok((cancelled, ack))
    }

    async fn ticket_price(&self, ticket_id: EntityId) -> Result<Money, CommandError> {
        let ticket = self
            .tickets
            .get(ticket_id)
            .await?
            .ok_or(CommandError::NotFound {
                kind: Ticket::KIND,
                id: ticket_id,
            })?;
        Ok(ticket.price)
    }
}

const fn not_found(order_id: EntityId) -> CommandError {
    CommandError::NotFound {
        kind: Order::KIND,
        id: order_id,
    }
}
