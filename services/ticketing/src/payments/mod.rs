//! Payments service: replicates orders, records payments.
//!
//! # Inbound subjects
//!
//! | Subject | Handling |
//! |---|---|
//! | `order.created` | order replica creation |
//! | `order.updated` | order replica mutation |
//! | `order.cancelled` | order replica mutation |
//!
//! # Outbound subjects
//!
//! `payment.created`, carrying a [`PaymentSnapshot`].

mod commands;
mod gateway;

pub use commands::PaymentsService;
pub use gateway::{Charge, DECLINED_TOKEN, GatewayError, MockPaymentGateway, PaymentGateway};

use crate::orders::OrderSnapshot;
use crate::types::{Money, OrderStatus, UserId};
use chrono::{DateTime, Utc};
use replica_core::store::{StoreError, Versioned};
use replica_core::stream::{EntityId, Version};
use replica_postgres::{PgEntity, PgQuery, version_from_db};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;

fn decode_error(error: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(error))
}

/// An order as replicated from the orders service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicatedOrder {
    /// Id assigned by the orders service.
    pub id: EntityId,
    /// Version asserted by the last applied snapshot.
    pub version: Version,
    /// Owner.
    pub user_id: UserId,
    /// Status.
    pub status: OrderStatus,
    /// Price of the reserved ticket.
    pub price: Money,
}

impl From<OrderSnapshot> for ReplicatedOrder {
    fn from(snapshot: OrderSnapshot) -> Self {
        Self {
            id: snapshot.id,
            version: snapshot.version,
            user_id: snapshot.user_id,
            status: snapshot.status,
            price: snapshot.ticket.price,
        }
    }
}

impl Versioned for ReplicatedOrder {
    const KIND: &'static str = "order";

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl PgEntity for ReplicatedOrder {
    const TABLE: &'static str = "order_replicas";
    const COLUMNS: &'static [&'static str] = &["user_id", "status", "price"];
    const TERMINAL_CONDITION: &'static str = "status = 'cancelled'";

    fn bind_columns<'q>(&'q self, query: PgQuery<'q>) -> Result<PgQuery<'q>, StoreError> {
        Ok(query
            .bind(self.user_id.as_str())
            .bind(self.status.as_str())
            .bind(self.price.to_db()?))
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let version = version_from_db(Self::TABLE, row.try_get("version")?).map_err(decode_error)?;
        let raw_status: String = row.try_get("status")?;
        let status = OrderStatus::parse(&raw_status).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown order status '{raw_status}'").into())
        })?;
        Ok(Self {
            id: EntityId::new(row.try_get("id")?),
            version,
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            status,
            price: Money::from_db(row.try_get("price")?).map_err(decode_error)?,
        })
    }
}

/// A recorded payment. Never updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    /// Allocated by this service.
    pub id: EntityId,
    /// Order paid for.
    pub order_id: EntityId,
    /// Gateway charge id.
    pub charge_id: String,
    /// Amount charged.
    pub amount: Money,
    /// When the payment was recorded.
    pub created_at: DateTime<Utc>,
}

impl Versioned for Payment {
    const KIND: &'static str = "payment";

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> Version {
        Version::INITIAL
    }
}

impl PgEntity for Payment {
    const TABLE: &'static str = "payments";
    const COLUMNS: &'static [&'static str] = &["order_id", "charge_id", "amount", "created_at"];

    fn bind_columns<'q>(&'q self, query: PgQuery<'q>) -> Result<PgQuery<'q>, StoreError> {
        Ok(query
            .bind(self.order_id.value())
            .bind(self.charge_id.as_str())
            .bind(self.amount.to_db()?)
            .bind(self.created_at))
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: EntityId::new(row.try_get("id")?),
            order_id: EntityId::new(row.try_get("order_id")?),
            charge_id: row.try_get("charge_id")?,
            amount: Money::from_db(row.try_get("amount")?).map_err(decode_error)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Payment snapshot published on `payment.created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSnapshot {
    /// Payment id.
    pub id: EntityId,
    /// Order paid for.
    pub order_id: EntityId,
    /// Gateway charge id.
    pub charge_id: String,
    /// Amount charged.
    pub amount: Money,
}

impl From<&Payment> for PaymentSnapshot {
    fn from(payment: &Payment) -> Self {
        Self {
            id: payment.id,
            order_id: payment.order_id,
            charge_id: payment.charge_id.clone(),
            amount: payment.amount,
        }
    }
}
