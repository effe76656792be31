//! Errors of the command-side write path.
//!
//! Every variant is a cause the caller can tell apart: the API layer maps
//! `NotFound` to 404, `NotOwner` to 403, `TerminalState`, `TicketReserved` and
//! `Conflict` to 409, `ChargeFailed` to 402 and the infrastructure variants to
//! 5xx.

use crate::payments::GatewayError;
use replica_core::apply::TransactionalError;
use replica_core::error::{Malformed, ReconcileError};
use replica_core::event::CodecError;
use replica_core::event_bus::EventBusError;
use replica_core::store::StoreError;
use replica_core::stream::{EntityId, Version};
use thiserror::Error;

/// Failure of a command initiated through this service.
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    /// The entity does not exist locally.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
    },

    /// The caller does not own the entity.
    #[error("{kind} {id} belongs to another user")]
    NotOwner {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
    },

    /// The entity is in an absorbing state.
    #[error("{kind} {id} is cancelled")]
    TerminalState {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
    },

    /// The ticket is held by an order that is not cancelled.
    #[error("Ticket {0} is already reserved")]
    TicketReserved(EntityId),

    /// The payment gateway refused the charge.
    #[error("Charge failed: {0}")]
    ChargeFailed(#[from] GatewayError),

    /// Another writer changed the entity while the command ran.
    #[error("{kind} {id} was modified concurrently (expected version {expected})")]
    Conflict {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: EntityId,
        /// Version the command read.
        expected: Version,
    },

    /// Local store failed; nothing was changed.
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    /// The notification was not durably published; the change was rolled back.
    #[error("Publish failure: {0}")]
    Publish(#[from] EventBusError),

    /// The notification could not be encoded; the change was rolled back.
    #[error("Encode failure: {0}")]
    Encode(#[from] CodecError),
}

impl From<TransactionalError> for CommandError {
    fn from(error: TransactionalError) -> Self {
        match error {
            TransactionalError::Publish(e) => Self::Publish(e),
            TransactionalError::Store(e) => Self::Store(e),
            TransactionalError::Codec(e) => Self::Encode(e),
        }
    }
}

/// Classification of a command triggered by an inbound message.
///
/// Infrastructure failures and lost races are redelivered; anything the
/// command refused is discarded for good.
impl From<CommandError> for ReconcileError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::NotFound { kind, id } => Malformed::UnknownEntity { kind, id }.into(),
            CommandError::Conflict { kind, id, expected } => Self::OrderingGap {
                kind,
                id,
                incoming: expected.next(),
                stored: Some(expected),
            },
            CommandError::Store(e) => Self::StoreFailure(e),
            CommandError::Publish(e) => Self::PublishFailure(e),
            CommandError::Encode(e) => Malformed::Codec(e).into(),
            refused @ (CommandError::NotOwner { .. }
            | CommandError::TerminalState { .. }
            | CommandError::TicketReserved(_)
            | CommandError::ChargeFailed(_)) => Malformed::Rejected(refused.to_string()).into(),
        }
    }
}

impl CommandError {
    /// Whether the failure is caused by infrastructure rather than by the
    /// request.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Publish(_) | Self::Encode(_))
    }
}
