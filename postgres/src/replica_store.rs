//! Generic versioned replica store.
//!
//! One table per entity kind, each with an `id BIGINT` primary key and a
//! `version BIGINT` column. The SQL is built from the entity's column list:
//!
//! | Operation | SQL |
//! |---|---|
//! | lookup | `SELECT version, (<terminal>) FROM t WHERE id = $1` |
//! | insert | `INSERT ... ON CONFLICT DO NOTHING` |
//! | update | `UPDATE t SET ... WHERE id = $1 AND version = $n` |
//!
//! The conditional update is what makes concurrent workers safe: whichever
//! transaction updates first wins, the other matches zero rows.
//!
//! An insert that hits any unique constraint, not only the primary key,
//! reports [`InsertOutcome::AlreadyExists`].

use crate::store_error;
use replica_core::store::{
    InsertOutcome, StoreError, StoredVersion, UnitOfWork, Versioned, VersionedStore,
    VersionedTransaction,
};
use replica_core::stream::{EntityId, Version};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use std::marker::PhantomData;

/// A query whose parameters are still being bound.
pub type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Mapping of a versioned entity onto its table.
///
/// # Example
///
/// ```ignore
/// impl PgEntity for Ticket {
///     const TABLE: &'static str = "tickets";
///     const COLUMNS: &'static [&'static str] = &["title", "price"];
///
///     fn bind_columns<'q>(&'q self, query: PgQuery<'q>) -> Result<PgQuery<'q>, StoreError> {
///         Ok(query.bind(self.title.as_str()).bind(self.price.to_db()?))
///     }
///
///     fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> { /* ... */ }
/// }
/// ```
pub trait PgEntity: Versioned {
    /// Table holding the rows.
    const TABLE: &'static str;

    /// Columns other than `id` and `version`, in the order
    /// [`bind_columns`](Self::bind_columns) binds them.
    const COLUMNS: &'static [&'static str];

    /// SQL boolean expression over the row marking it terminal.
    const TERMINAL_CONDITION: &'static str = "FALSE";

    /// Bind the values of [`COLUMNS`](Self::COLUMNS), in order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a value does not fit its column.
    fn bind_columns<'q>(&'q self, query: PgQuery<'q>) -> Result<PgQuery<'q>, StoreError>;

    /// Rebuild the entity from a `SELECT *` row.
    ///
    /// # Errors
    ///
    /// Returns [`sqlx::Error`] if a column is missing or has the wrong type.
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error>;
}

/// Convert a stored `BIGINT` version.
///
/// # Errors
///
/// Returns [`StoreError::CorruptRow`] for negative values.
pub fn version_from_db(table: &str, raw: i64) -> Result<Version, StoreError> {
    u64::try_from(raw)
        .map(Version::new)
        .map_err(|_| StoreError::CorruptRow {
            table: table.to_string(),
            reason: format!("negative version {raw}"),
        })
}

/// Convert a version for a `BIGINT` column.
///
/// # Errors
///
/// Returns [`StoreError::DatabaseError`] for versions beyond `i64::MAX`.
pub fn version_to_db(version: Version) -> Result<i64, StoreError> {
    i64::try_from(version.value())
        .map_err(|_| StoreError::DatabaseError(format!("version {version} out of range")))
}

fn lookup_sql<E: PgEntity>() -> String {
    format!(
        "SELECT version, ({}) AS terminal FROM {} WHERE id = $1",
        E::TERMINAL_CONDITION,
        E::TABLE
    )
}

fn select_sql<E: PgEntity>() -> String {
    format!("SELECT * FROM {} WHERE id = $1", E::TABLE)
}

fn insert_sql<E: PgEntity>() -> String {
    let columns = E::COLUMNS.join(", ");
    let placeholders = (3..3 + E::COLUMNS.len())
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ");
    let (sep, placeholders) = if E::COLUMNS.is_empty() {
        ("", String::new())
    } else {
        (", ", placeholders)
    };
    format!(
        "INSERT INTO {table} (id, version{sep}{columns}) VALUES ($1, $2{sep}{placeholders}) \
         ON CONFLICT DO NOTHING",
        table = E::TABLE,
    )
}

fn update_sql<E: PgEntity>() -> String {
    let assignments = std::iter::once("version = $2".to_string())
        .chain(
            E::COLUMNS
                .iter()
                .enumerate()
                .map(|(i, column)| format!("{column} = ${}", i + 3)),
        )
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {assignments} WHERE id = $1 AND version = ${}",
        E::TABLE,
        E::COLUMNS.len() + 3
    )
}

fn stored_version<E: PgEntity>(id: EntityId, row: &PgRow) -> Result<StoredVersion, StoreError> {
    let raw: i64 = row.try_get("version").map_err(store_error)?;
    let terminal: bool = row.try_get("terminal").map_err(store_error)?;
    Ok(StoredVersion::new(id, version_from_db(E::TABLE, raw)?).terminal(terminal))
}

fn entity_from_row<E: PgEntity>(row: &PgRow) -> Result<E, StoreError> {
    E::from_row(row).map_err(|e| StoreError::CorruptRow {
        table: E::TABLE.to_string(),
        reason: e.to_string(),
    })
}

async fn lookup_on<E: PgEntity>(
    conn: &mut PgConnection,
    id: EntityId,
) -> Result<Option<StoredVersion>, StoreError> {
    let row = sqlx::query(&lookup_sql::<E>())
        .bind(id.value())
        .fetch_optional(conn)
        .await
        .map_err(store_error)?;
    row.map(|row| stored_version::<E>(id, &row)).transpose()
}

async fn find_on<E: PgEntity>(conn: &mut PgConnection, id: EntityId) -> Result<Option<E>, StoreError> {
    let row = sqlx::query(&select_sql::<E>())
        .bind(id.value())
        .fetch_optional(conn)
        .await
        .map_err(store_error)?;
    row.map(|row| entity_from_row(&row)).transpose()
}

/// `PostgreSQL`-backed [`VersionedStore`] for entity kind `E`.
#[derive(Debug)]
pub struct PostgresReplicaStore<E> {
    pool: PgPool,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for PostgresReplicaStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: PgEntity> PostgresReplicaStore<E> {
    /// Create a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _entity: PhantomData,
        }
    }

    /// The underlying connection pool.
    ///
    /// Useful for custom queries.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Allocate an id from the table's serial sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the table has no serial `id` column or the
    /// query fails.
    pub async fn next_id(&self) -> Result<EntityId, StoreError> {
        let (id,): (i64,) = sqlx::query_as("SELECT nextval(pg_get_serial_sequence($1, 'id'))")
            .bind(E::TABLE)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(EntityId::new(id))
    }

    /// Rows matching a `WHERE` clause with one text or integer parameter.
    ///
    /// `clause` is trusted SQL supplied by the caller, never user input.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be mapped.
    pub async fn select_where<T>(&self, clause: &str, param: T) -> Result<Vec<E>, StoreError>
    where
        T: for<'e> sqlx::Encode<'e, Postgres> + sqlx::Type<Postgres> + Send + 'static,
    {
        let sql = format!("SELECT * FROM {} WHERE {clause} ORDER BY id", E::TABLE);
        let rows = sqlx::query(&sql)
            .bind(param)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows.iter().map(entity_from_row::<E>).collect()
    }
}

impl<E: PgEntity> VersionedStore for PostgresReplicaStore<E> {
    type Entity = E;
    type Transaction = PgTransaction<E>;

    async fn lookup(&self, id: EntityId) -> Result<Option<StoredVersion>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        lookup_on::<E>(&mut conn, id).await
    }

    async fn get(&self, id: EntityId) -> Result<Option<E>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        find_on::<E>(&mut conn, id).await
    }

    async fn begin(&self) -> Result<PgTransaction<E>, StoreError> {
        let tx = self.pool.begin().await.map_err(store_error)?;
        Ok(PgTransaction {
            tx,
            _entity: PhantomData,
        })
    }
}

/// Transaction of a [`PostgresReplicaStore`].
///
/// Dropping it without committing rolls it back.
pub struct PgTransaction<E> {
    tx: Transaction<'static, Postgres>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> PgTransaction<E> {
    /// The transaction's connection, for queries of the caller's own.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

impl<E: PgEntity> PgTransaction<E> {
    /// Rows matching a `WHERE` clause, read inside the transaction and locked
    /// until it ends.
    ///
    /// `clause` is trusted SQL supplied by the caller, never user input.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be mapped.
    pub async fn select_where_for_update<T>(
        &mut self,
        clause: &str,
        param: T,
    ) -> Result<Vec<E>, StoreError>
    where
        T: for<'e> sqlx::Encode<'e, Postgres> + sqlx::Type<Postgres> + Send + 'static,
    {
        let sql = format!("SELECT * FROM {} WHERE {clause} ORDER BY id FOR UPDATE", E::TABLE);
        let rows = sqlx::query(&sql)
            .bind(param)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_error)?;
        rows.iter().map(entity_from_row::<E>).collect()
    }
}

impl<E: PgEntity> UnitOfWork for PgTransaction<E> {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(store_error)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(store_error)
    }
}

impl<E: PgEntity> VersionedTransaction for PgTransaction<E> {
    type Entity = E;

    async fn lookup(&mut self, id: EntityId) -> Result<Option<StoredVersion>, StoreError> {
        lookup_on::<E>(&mut self.tx, id).await
    }

    async fn find(&mut self, id: EntityId) -> Result<Option<E>, StoreError> {
        find_on::<E>(&mut self.tx, id).await
    }

    async fn insert(&mut self, entity: &E) -> Result<InsertOutcome, StoreError> {
        let sql = insert_sql::<E>();
        let query = sqlx::query(&sql)
            .bind(entity.id().value())
            .bind(version_to_db(entity.version())?);
        let result = entity
            .bind_columns(query)?
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn update_if_version(&mut self, entity: &E, expected: Version) -> Result<bool, StoreError> {
        let sql = update_sql::<E>();
        let query = sqlx::query(&sql)
            .bind(entity.id().value())
            .bind(version_to_db(entity.version())?);
        let result = entity
            .bind_columns(query)?
            .bind(version_to_db(expected)?)
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected() == 1)
    }
}
