//! Transactional apply: the write half of reconciliation.
//!
//! A write decided by the gate runs inside one store transaction:
//!
//! ```text
//! begin ─► insert / update-if-version ─► [publish] ─► commit ─► (caller acks)
//!                    │                        │
//!                    └── zero rows ───────────┴── failure ─► rollback
//! ```
//!
//! The broker is acknowledged only after the commit. A crash between commit and
//! acknowledgment is safe: the redelivered message meets the gate again and
//! lands on `IgnoreStale`. A crash before commit leaves nothing behind and the
//! redelivery is retried cleanly.
//!
//! When the applied entity also feeds an outbound notification, the publish runs
//! after the write and before the commit; only a broker acknowledgment carrying
//! a sequence number lets the transaction commit ([`publish_within`]).

use crate::error::{Malformed, ReconcileError};
use crate::event::{self, CodecError};
use crate::event_bus::{EventBus, EventBusError, PublishAck};
use crate::reconcile::Decision;
use crate::store::{InsertOutcome, StoreError, UnitOfWork, Versioned, VersionedStore, VersionedTransaction};
use crate::stream::{EntityId, Version};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// What a successful write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Row inserted.
    Created,
    /// Row overwritten.
    Updated,
}

/// A successfully applied event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Entity kind.
    pub kind: &'static str,
    /// Entity id.
    pub id: EntityId,
    /// Version now stored.
    pub version: Version,
    /// Insert or update.
    pub change: Change,
    /// Acknowledgment of the outbound notification, if one was relayed.
    pub relayed: Option<PublishAck>,
}

/// Failure of a unit of work that ends in a publish.
#[derive(Error, Debug, Clone)]
pub enum TransactionalError {
    /// The outbound message was not durably appended; the unit was rolled back.
    #[error(transparent)]
    Publish(#[from] EventBusError),

    /// The unit could not be committed after the publish.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The outbound snapshot could not be encoded; the unit was rolled back.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<TransactionalError> for ReconcileError {
    fn from(error: TransactionalError) -> Self {
        match error {
            TransactionalError::Publish(e) => Self::PublishFailure(e),
            TransactionalError::Store(e) => Self::StoreFailure(e),
            TransactionalError::Codec(e) => Self::MalformedEnvelope(Malformed::Codec(e)),
        }
    }
}

/// Republishes every applied snapshot on a fixed subject.
#[derive(Clone)]
pub struct Relay {
    bus: Arc<dyn EventBus>,
    subject: String,
}

impl Relay {
    /// Relay applied snapshots to `subject` on `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }

    /// Subject relayed to.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Publish `payload` and commit `unit` only if the broker confirmed it.
///
/// On publish failure the unit is rolled back and the publish error returned,
/// so a local mutation is never committed without its notification.
///
/// # Errors
///
/// - [`TransactionalError::Publish`]: broker did not confirm; rolled back
/// - [`TransactionalError::Store`]: commit failed after a confirmed publish
pub async fn publish_within<U: UnitOfWork>(
    unit: U,
    bus: &dyn EventBus,
    subject: &str,
    key: Option<&str>,
    payload: Vec<u8>,
) -> Result<PublishAck, TransactionalError> {
    match bus.publish(subject, key, payload).await {
        Ok(ack) => {
            unit.commit().await?;
            metrics::counter!("replica.published", "subject" => subject.to_string()).increment(1);
            Ok(ack)
        },
        Err(publish_error) => {
            if let Err(rollback_error) = unit.rollback().await {
                tracing::warn!(
                    subject = %subject,
                    error = %rollback_error,
                    "Rollback after failed publish reported an error"
                );
            }
            Err(TransactionalError::Publish(publish_error))
        },
    }
}

/// Encode `snapshot` under `subject`, then [`publish_within`].
///
/// # Errors
///
/// Same as [`publish_within`], plus [`TransactionalError::Codec`] if the
/// snapshot cannot be encoded (the unit is rolled back).
pub async fn publish_snapshot_within<U, T>(
    unit: U,
    bus: &dyn EventBus,
    subject: &str,
    key: Option<&str>,
    snapshot: &T,
) -> Result<PublishAck, TransactionalError>
where
    U: UnitOfWork,
    T: Serialize + Sync,
{
    let payload = match event::encode(subject, snapshot) {
        Ok(payload) => payload,
        Err(codec_error) => {
            if let Err(rollback_error) = unit.rollback().await {
                tracing::warn!(
                    subject = %subject,
                    error = %rollback_error,
                    "Rollback after failed encode reported an error"
                );
            }
            return Err(TransactionalError::Codec(codec_error));
        },
    };
    publish_within(unit, bus, subject, key, payload).await
}

/// Execute a write decision for `entity`.
///
/// Called by the reconciler after the gate opened. Non-write decisions are a
/// programming error and are reported as the matching reconcile error.
///
/// # Errors
///
/// - [`ReconcileError::MalformedEnvelope`]: a concurrent creation won the insert
/// - [`ReconcileError::OrderingGap`]: a concurrent writer advanced the version
///   between the gate's read and this write
/// - [`ReconcileError::StoreFailure`] / [`ReconcileError::PublishFailure`]
pub async fn apply<S>(
    store: &S,
    decision: Decision,
    entity: &S::Entity,
    relay: Option<&Relay>,
) -> Result<Applied, ReconcileError>
where
    S: VersionedStore,
    S::Entity: Serialize,
{
    let kind = S::Entity::KIND;
    let id = entity.id();
    let version = entity.version();

    let mut tx = store.begin().await?;

    let change = match decision {
        Decision::Create => match tx.insert(entity).await? {
            InsertOutcome::Inserted => Change::Created,
            InsertOutcome::AlreadyExists => {
                tx.rollback().await?;
                return Err(ReconcileError::MalformedEnvelope(
                    Malformed::DuplicateCreation {
                        kind,
                        id,
                        stored: Version::INITIAL,
                    },
                ));
            },
        },
        Decision::ApplyUpdate { expected } => {
            if !tx.update_if_version(entity, expected).await? {
                tx.rollback().await?;
                tracing::debug!(
                    kind,
                    id = %id,
                    expected = %expected,
                    "Conditional update matched no row; version moved since the gate read it"
                );
                return Err(ReconcileError::OrderingGap {
                    kind,
                    id,
                    incoming: version,
                    stored: Some(expected),
                });
            }
            Change::Updated
        },
        other => {
            tx.rollback().await?;
            return Err(other
                .into_error(kind, id, version)
                .unwrap_or(ReconcileError::OrderingGap {
                    kind,
                    id,
                    incoming: version,
                    stored: None,
                }));
        },
    };

    let relayed = if let Some(relay) = relay {
        let key = id.to_string();
        let ack = publish_snapshot_within(
            tx,
            relay.bus.as_ref(),
            &relay.subject,
            Some(&key),
            entity,
        )
        .await?;
        Some(ack)
    } else {
        tx.commit().await?;
        None
    };

    tracing::debug!(
        kind,
        id = %id,
        version = %version,
        change = ?change,
        relayed = relayed.as_ref().map(|ack| ack.sequence.value()),
        "Event applied"
    );

    Ok(Applied {
        kind,
        id,
        version,
        change,
        relayed,
    })
}
