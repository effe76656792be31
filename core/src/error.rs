//! Reconciliation error taxonomy.
//!
//! Every failure of the inbound path is one of the four classes below, and
//! each class maps to exactly one broker [`Disposition`]. Reconciliation errors
//! never escape the broker boundary: they are translated into ack / nak / term
//! by [`ReconcileError::disposition`] and nothing else.
//!
//! | Class | Disposition | Alert? |
//! |---|---|---|
//! | `MalformedEnvelope` | term | yes (dead letter) |
//! | `StaleOrDuplicate` | term | no, expected under at-least-once |
//! | `OrderingGap` | nak(delay) | only once the budget is spent |
//! | `StoreFailure` / `PublishFailure` | nak(delay) | only once the budget is spent |

use crate::event::CodecError;
use crate::event_bus::EventBusError;
use crate::redelivery::{Disposition, RedeliveryPolicy};
use crate::store::StoreError;
use crate::stream::{EntityId, Version};
use thiserror::Error;

/// Why a message can never be processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Malformed {
    /// Payload could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No handler is registered for the subject.
    #[error("No handler for subject '{0}'")]
    UnknownSubject(String),

    /// Creation event does not carry the genesis version.
    #[error("{kind} {id}: creation event carries version {version}, expected 0")]
    NonGenesisCreation {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
        /// Version found on the event.
        version: Version,
    },

    /// Creation event for an id that already exists locally.
    #[error("{kind} {id}: already exists at version {stored}")]
    DuplicateCreation {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
        /// Version currently stored.
        stored: Version,
    },

    /// Mutation event for an entity in an absorbing state.
    #[error("{kind} {id}: terminal at version {stored}, rejecting version {incoming}")]
    TerminalState {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
        /// Version currently stored.
        stored: Version,
        /// Version found on the event.
        incoming: Version,
    },

    /// Event refers to an entity this service has never known.
    #[error("{kind} {id}: not found")]
    UnknownEntity {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
    },

    /// The command triggered by the event refused it for good.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Failure of the inbound reconciliation path.
#[derive(Error, Debug, Clone)]
pub enum ReconcileError {
    /// Never processable. Terminal discard.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] Malformed),

    /// Already applied, or an old duplicate. Terminal discard.
    #[error("{kind} {id}: version {incoming} is not newer than stored {stored}")]
    StaleOrDuplicate {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
        /// Version found on the event.
        incoming: Version,
        /// Version currently stored.
        stored: Version,
    },

    /// A predecessor has not been applied yet. Deferred.
    #[error("{kind} {id}: version {incoming} arrived before its predecessor (stored {stored:?})")]
    OrderingGap {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
        /// Version found on the event.
        incoming: Version,
        /// Version currently stored, `None` if the entity is not known yet.
        stored: Option<Version>,
    },

    /// Local store failed. Deferred.
    #[error("Store failure: {0}")]
    StoreFailure(#[from] StoreError),

    /// Outbound notification inside the transaction failed. Deferred.
    #[error("Publish failure: {0}")]
    PublishFailure(#[from] EventBusError),
}

impl From<CodecError> for ReconcileError {
    fn from(error: CodecError) -> Self {
        Self::MalformedEnvelope(Malformed::Codec(error))
    }
}

impl ReconcileError {
    /// The broker action for this failure.
    #[must_use]
    pub const fn disposition(&self, policy: &RedeliveryPolicy) -> Disposition {
        match self {
            Self::MalformedEnvelope(_) | Self::StaleOrDuplicate { .. } => Disposition::Term,
            Self::OrderingGap { .. } | Self::StoreFailure(_) | Self::PublishFailure(_) => {
                policy.defer()
            },
        }
    }

    /// Whether the failure is expected under at-least-once delivery.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(self, Self::StaleOrDuplicate { .. } | Self::OrderingGap { .. })
    }

    /// Whether a message failing this way on `attempt` is lost for good and
    /// should be recorded for operators.
    #[must_use]
    pub const fn is_dead_letter(&self, attempt: u32, policy: &RedeliveryPolicy) -> bool {
        match self {
            Self::MalformedEnvelope(_) => true,
            Self::StaleOrDuplicate { .. } => false,
            Self::OrderingGap { .. } | Self::StoreFailure(_) | Self::PublishFailure(_) => {
                policy.is_final_attempt(attempt)
            },
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn class(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "malformed",
            Self::StaleOrDuplicate { .. } => "stale",
            Self::OrderingGap { .. } => "gap",
            Self::StoreFailure(_) => "store",
            Self::PublishFailure(_) => "publish",
        }
    }
}
