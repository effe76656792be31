//! Orders service: owns orders, replicates tickets, expires orders.
//!
//! # Inbound subjects
//!
//! | Subject | Handling |
//! |---|---|
//! | `ticket.created` | ticket replica creation |
//! | `ticket.updated` | ticket replica mutation |
//! | `expiration.complete` | [`OrdersService::expire_order`] |
//!
//! # Outbound subjects
//!
//! `order.created` and `order.cancelled`, each carrying an [`OrderSnapshot`]
//! published inside the transaction that wrote the order.

mod commands;
mod expiration;
mod repository;

pub use commands::{DEFAULT_EXPIRATION_WINDOW, Expiry, OrdersService};
pub use expiration::{ExpirationComplete, ExpirationHandler};
pub use repository::{IdAllocator, OrderRepository};

use crate::types::{Money, OrderStatus, UserId};
use chrono::{DateTime, Utc};
use replica_core::store::{StoreError, Versioned};
use replica_core::stream::{EntityId, Version};
use replica_postgres::{PgEntity, PgQuery, version_from_db};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;

/// An order owned by this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Allocated by this service.
    pub id: EntityId,
    /// 0 on creation, +1 on every mutation.
    pub version: Version,
    /// Owner.
    pub user_id: UserId,
    /// Reserved ticket.
    pub ticket_id: EntityId,
    /// Current status.
    pub status: OrderStatus,
    /// When the reservation lapses.
    pub expires_at: DateTime<Utc>,
}

impl Order {
    /// Whether `user` placed this order.
    #[must_use]
    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.user_id == user
    }

    /// The next version of this order, cancelled.
    #[must_use]
    pub fn cancelled(&self) -> Self {
        Self {
            version: self.version.next(),
            status: OrderStatus::Cancelled,
            ..self.clone()
        }
    }
}

impl Versioned for Order {
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

impl PgEntity for Order {
    const TABLE: &'static str = "orders";
    const COLUMNS: &'static [&'static str] = &["user_id", "ticket_id", "status", "expires_at"];
    const TERMINAL_CONDITION: &'static str = "status = 'cancelled'";

    fn bind_columns<'q>(&'q self, query: PgQuery<'q>) -> Result<PgQuery<'q>, StoreError> {
        Ok(query
            .bind(self.user_id.as_str())
            .bind(self.ticket_id.value())
            .bind(self.status.as_str())
            .bind(self.expires_at))
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let version = version_from_db(Self::TABLE, row.try_get("version")?)
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let raw_status: String = row.try_get("status")?;
        let status = OrderStatus::parse(&raw_status).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown order status '{raw_status}'").into())
        })?;
        Ok(Self {
            id: EntityId::new(row.try_get("id")?),
            version,
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            ticket_id: EntityId::new(row.try_get("ticket_id")?),
            status,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

/// The ticket as embedded in an order snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    /// Ticket id.
    pub id: EntityId,
    /// Ticket price at the time of the snapshot.
    pub price: Money,
}

/// Order snapshot published on `order.created` and `order.cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    /// Order id.
    pub id: EntityId,
    /// Order version.
    pub version: Version,
    /// Owner.
    pub user_id: UserId,
    /// Order status.
    pub status: OrderStatus,
    /// Expiry, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Reserved ticket.
    pub ticket: TicketRef,
}

impl OrderSnapshot {
    /// Snapshot of `order`, whose ticket costs `price`.
    #[must_use]
    pub fn of(order: &Order, price: Money) -> Self {
        Self {
            id: order.id,
            version: order.version,
            user_id: order.user_id.clone(),
            status: order.status,
            expires_at: Some(order.expires_at),
            ticket: TicketRef {
                id: order.ticket_id,
                price,
            },
        }
    }
}
