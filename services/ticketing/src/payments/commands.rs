//! Commands originating in the payments service.

use super::{Payment, PaymentGateway, PaymentSnapshot, ReplicatedOrder};
use crate::error::CommandError;
use crate::orders::IdAllocator;
use crate::subjects::PAYMENT_CREATED;
use crate::types::UserId;
use replica_core::apply::publish_snapshot_within;
use replica_core::environment::Clock;
use replica_core::event_bus::EventBus;
use replica_core::store::{InsertOutcome, UnitOfWork, Versioned, VersionedStore, VersionedTransaction};
use replica_core::stream::{EntityId, Sequence, Version};
use std::sync::Arc;

/// The payments service's command side.
pub struct PaymentsService<R, P> {
    orders: R,
    payments: P,
    gateway: Arc<dyn PaymentGateway>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl<R, P> PaymentsService<R, P>
where
    R: VersionedStore<Entity = ReplicatedOrder>,
    P: VersionedStore<Entity = Payment> + IdAllocator,
{
    /// Create the service.
    #[must_use]
    pub fn new(
        orders: R,
        payments: P,
        gateway: Arc<dyn PaymentGateway>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            payments,
            gateway,
            bus,
            clock,
        }
    }

    /// The order replica store.
    #[must_use]
    pub const fn orders(&self) -> &R {
        &self.orders
    }

    /// The payment store.
    #[must_use]
    pub const fn payments(&self) -> &P {
        &self.payments
    }

    /// Charge `caller` for `order_id` and record the payment.
    ///
    /// The charge happens before the payment transaction opens.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotFound`]: the order has not been replicated
    /// - [`CommandError::NotOwner`]: the order belongs to someone else
    /// - [`CommandError::TerminalState`]: the order is cancelled
    /// - [`CommandError::ChargeFailed`]: the gateway refused; nothing recorded
    /// - [`CommandError::Store`] / [`CommandError::Publish`]: nothing recorded
    pub async fn create_payment(
        &self,
        caller: &UserId,
        order_id: EntityId,
        token: &str,
    ) -> Result<(Payment, Sequence), CommandError> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or(CommandError::NotFound {
                kind: ReplicatedOrder::KIND,
                id: order_id,
            })?;
        if order.user_id != *caller {
            return Err(CommandError::NotOwner {
                kind: ReplicatedOrder::KIND,
                id: order_id,
            });
        }
        if order.is_terminal() {
            return Err(CommandError::TerminalState {
                kind: ReplicatedOrder::KIND,
                id: order_id,
            });
        }

        let charge = self.gateway.charge(order.price, token).await.inspect_err(|error| {
            tracing::warn!(order_id = %order_id, error = %error, "Charge refused");
        })?;

        let payment = Payment {
            id: self.payments.allocate_id().await?,
            order_id,
            charge_id: charge.id,
            amount: charge.amount,
            created_at: self.clock.now(),
        };

        let mut tx = self.payments.begin().await?;
        if tx.insert(&payment).await? == InsertOutcome::AlreadyExists {
            tx.rollback().await?;
            return Err(CommandError::Conflict {
                kind: Payment::KIND,
                id: payment.id,
                expected: Version::INITIAL,
            });
        }

        let key = order_id.to_string();
        let ack = publish_snapshot_within(
            tx,
            self.bus.as_ref(),
            PAYMENT_CREATED,
            Some(&key),
            &PaymentSnapshot::from(&payment),
        )
        .await?;

        tracing::info!(
            payment_id = %payment.id,
            order_id = %order_id,
            charge_id = %payment.charge_id,
            amount = payment.amount.cents(),
            sequence = %ack.sequence,
            "Payment recorded"
        );
        Ok((payment, ack.sequence))
    }
}
