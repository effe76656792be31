//! Ticket replica held by the orders service.
//!
//! Tickets are owned by the tickets service; the orders service only applies
//! the snapshots it publishes on `ticket.created` and `ticket.updated`.

use crate::types::Money;
use replica_core::store::{StoreError, Versioned};
use replica_core::stream::{EntityId, Version};
use replica_postgres::{PgEntity, PgQuery, version_from_db};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;

/// A ticket as published by its owner and as stored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Id assigned by the tickets service.
    pub id: EntityId,
    /// Version asserted by the snapshot.
    pub version: Version,
    /// Display title.
    pub title: String,
    /// Price in cents.
    pub price: Money,
}

impl Ticket {
    /// Create a ticket snapshot.
    #[must_use]
    pub fn new(id: EntityId, version: Version, title: impl Into<String>, price: Money) -> Self {
        Self {
            id,
            version,
            title: title.into(),
            price,
        }
    }
}

impl Versioned for Ticket {
    const KIND: &'static str = "ticket";

    fn id(&self) -> EntityId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }
}

impl PgEntity for Ticket {
    const TABLE: &'static str = "tickets";
    const COLUMNS: &'static [&'static str] = &["title", "price"];

    fn bind_columns<'q>(&'q self, query: PgQuery<'q>) -> Result<PgQuery<'q>, StoreError> {
        Ok(query.bind(self.title.as_str()).bind(self.price.to_db()?))
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let version = version_from_db(Self::TABLE, row.try_get("version")?)
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let price = Money::from_db(row.try_get("price")?)
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        Ok(Self {
            id: EntityId::new(row.try_get("id")?),
            version,
            title: row.try_get("title")?,
            price,
        })
    }
}
