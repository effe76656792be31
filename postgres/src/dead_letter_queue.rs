//! Dead letters kept in `PostgreSQL`.
//!
//! Every letter starts `open`. An operator later either republishes the
//! message and marks the letter `replayed`, or gives up on it and marks it
//! `abandoned`. Closed letters stay in the table for audit.

use crate::store_error;
use chrono::{DateTime, Utc};
use replica_core::dead_letter::{DeadLetter, DeadLetterSink};
use replica_core::event::Envelope;
use replica_core::store::StoreError;
use replica_core::stream::Sequence;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

const COLUMNS: &str = "id, subject, payload, delivery_attempt, sequence, class, reason, \
                       state, recorded_at, closed_at, closed_by, note";

/// Where a dead letter is in its operator workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LetterState {
    /// Waiting for an operator.
    Open,
    /// The message was republished.
    Replayed,
    /// The message will never be applied.
    Abandoned,
}

impl LetterState {
    /// Value of the `state` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Replayed => "replayed",
            Self::Abandoned => "abandoned",
        }
    }

    fn from_column(raw: &str) -> Result<Self, StoreError> {
        [Self::Open, Self::Replayed, Self::Abandoned]
            .into_iter()
            .find(|state| state.as_str() == raw)
            .ok_or_else(|| StoreError::CorruptRow {
                table: "dead_letters".to_string(),
                reason: format!("unknown letter state '{raw}'"),
            })
    }
}

impl fmt::Display for LetterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dead letter as stored, with its workflow columns.
#[derive(Debug, Clone)]
pub struct StoredLetter {
    /// Row id.
    pub id: i64,
    /// The letter as recorded by the router.
    pub letter: DeadLetter,
    /// Workflow state.
    pub state: LetterState,
    /// When the letter left `open`.
    pub closed_at: Option<DateTime<Utc>>,
    /// Operator who closed it.
    pub closed_by: Option<String>,
    /// Free-form operator note.
    pub note: Option<String>,
}

/// [`DeadLetterSink`] writing to the `dead_letters` table, plus the
/// operator queries over it.
///
/// ```no_run
/// use replica_postgres::DeadLetterQueue;
///
/// # async fn triage(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let letters = DeadLetterQueue::new(pool);
/// for stored in letters.open(50).await? {
///     if stored.letter.class == "malformed" {
///         letters.abandon(stored.id, "ops", "payload cannot be repaired").await?;
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Queue over `pool`. The schema comes from [`crate::migrate`].
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store `letter` as `open` and return its row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    pub async fn push(&self, letter: &DeadLetter) -> Result<i64, StoreError> {
        let envelope = &letter.envelope;
        let sequence = envelope
            .sequence
            .map(|s| i64::try_from(s.value()).unwrap_or(i64::MAX));
        let attempt = i32::try_from(envelope.delivery_attempt).unwrap_or(i32::MAX);

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO dead_letters \
             (subject, payload, delivery_attempt, sequence, class, reason, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&envelope.subject)
        .bind(&envelope.payload)
        .bind(attempt)
        .bind(sequence)
        .bind(&letter.class)
        .bind(&letter.reason)
        .bind(letter.recorded_at)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        tracing::warn!(
            letter_id = id,
            subject = %envelope.subject,
            class = %letter.class,
            attempt = envelope.delivery_attempt,
            reason = %letter.reason,
            "Dead letter stored"
        );
        Ok(id)
    }

    /// Open letters, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    pub async fn open(&self, limit: u32) -> Result<Vec<StoredLetter>, StoreError> {
        self.in_state(LetterState::Open, limit).await
    }

    /// Letters in `state`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    pub async fn in_state(&self, state: LetterState, limit: u32) -> Result<Vec<StoredLetter>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM dead_letters WHERE state = $1 ORDER BY recorded_at, id LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows.iter().map(stored_letter).collect()
    }

    /// Open letters of one subject, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is corrupt.
    pub async fn open_for_subject(&self, subject: &str) -> Result<Vec<StoredLetter>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM dead_letters WHERE state = 'open' AND subject = $1 \
             ORDER BY recorded_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(subject)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows.iter().map(stored_letter).collect()
    }

    /// Number of open letters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn open_count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE state = 'open'")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(count)
    }

    /// Record that `operator` republished letter `id`.
    ///
    /// Returns `false` if the letter is unknown or already closed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub async fn mark_replayed(&self, id: i64, operator: &str, note: Option<&str>) -> Result<bool, StoreError> {
        self.close(id, LetterState::Replayed, operator, note).await
    }

    /// Record that `operator` gave up on letter `id`.
    ///
    /// Returns `false` if the letter is unknown or already closed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub async fn abandon(&self, id: i64, operator: &str, note: &str) -> Result<bool, StoreError> {
        self.close(id, LetterState::Abandoned, operator, Some(note)).await
    }

    async fn close(
        &self,
        id: i64,
        state: LetterState,
        operator: &str,
        note: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE dead_letters SET state = $1, closed_at = NOW(), closed_by = $2, note = $3 \
             WHERE id = $4 AND state = 'open'",
        )
        .bind(state.as_str())
        .bind(operator)
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        let closed = result.rows_affected() == 1;

        if closed {
            tracing::info!(letter_id = id, state = %state, operator, "Dead letter closed");
            metrics::counter!("replica.dead_letters.closed", "state" => state.as_str()).increment(1);
        }
        Ok(closed)
    }
}

fn stored_letter(row: &PgRow) -> Result<StoredLetter, StoreError> {
    let attempt: i32 = row.try_get("delivery_attempt").map_err(store_error)?;
    let sequence: Option<i64> = row.try_get("sequence").map_err(store_error)?;

    let mut envelope = Envelope::new(
        row.try_get::<String, _>("subject").map_err(store_error)?,
        row.try_get::<Vec<u8>, _>("payload").map_err(store_error)?,
    )
    .with_attempt(attempt.unsigned_abs());
    if let Some(sequence) = sequence {
        envelope = envelope.with_sequence(Sequence::new(sequence.unsigned_abs()));
    }

    let state: String = row.try_get("state").map_err(store_error)?;
    Ok(StoredLetter {
        id: row.try_get("id").map_err(store_error)?,
        letter: DeadLetter::new(
            envelope,
            row.try_get::<String, _>("class").map_err(store_error)?,
            row.try_get::<String, _>("reason").map_err(store_error)?,
            row.try_get("recorded_at").map_err(store_error)?,
        ),
        state: LetterState::from_column(&state)?,
        closed_at: row.try_get("closed_at").map_err(store_error)?,
        closed_by: row.try_get("closed_by").map_err(store_error)?,
        note: row.try_get("note").map_err(store_error)?,
    })
}

impl DeadLetterSink for DeadLetterQueue {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move { self.push(&letter).await.map(|_| ()) })
    }
}
