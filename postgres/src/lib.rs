//! `PostgreSQL` persistence for replica services.
//!
//! This crate provides:
//!
//! - [`PostgresReplicaStore`]: a generic [`VersionedStore`] over one table per
//!   entity kind, with insert-if-absent and version-guarded updates
//! - [`DeadLetterQueue`]: persistent [`DeadLetterSink`]
//! - [`connect`] and [`migrate`]: pool setup and schema migrations
//!
//! # Example
//!
//! ```ignore
//! use replica_postgres::{PostgresReplicaStore, connect, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/orders", 10, Duration::from_secs(5)).await?;
//!     migrate(&pool).await?;
//!     let tickets = PostgresReplicaStore::<Ticket>::new(pool);
//!     Ok(())
//! }
//! ```
//!
//! [`VersionedStore`]: replica_core::store::VersionedStore
//! [`DeadLetterSink`]: replica_core::dead_letter::DeadLetterSink

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;
mod replica_store;

pub use dead_letter_queue::{DeadLetterQueue, LetterState, StoredLetter};
pub use replica_store::{
    PgEntity, PgQuery, PgTransaction, PostgresReplicaStore, version_from_db, version_to_db,
};

use replica_core::store::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Map a sqlx error onto the store taxonomy.
///
/// Connectivity problems become [`StoreError::Unavailable`]; everything else
/// is a [`StoreError::DatabaseError`].
#[must_use]
pub fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        },
        other => StoreError::DatabaseError(other.to_string()),
    }
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if no connection could be established.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
    connect_timeout: Duration,
) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(connect_timeout)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Run the schema migrations.
///
/// Creates the replica, owned-entity and dead-letter tables if they don't
/// already exist.
///
/// # Errors
///
/// Returns [`StoreError::DatabaseError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Migration failed: {e}")))?;
    Ok(())
}
