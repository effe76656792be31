//! Version reconciler: the gate every inbound event passes through.
//!
//! The gate compares the version asserted by an event with the version stored
//! locally and classifies the event into a [`Decision`]. The classification is a
//! pure function ([`decide`]) of the stored projection and the incoming version,
//! so the whole decision table is testable without a broker or a database.
//!
//! # Decision table
//!
//! | Subject role | Stored row | Incoming version | Decision |
//! |---|---|---|---|
//! | creation | any | `!= 0` | `RejectMalformed` (non-genesis) |
//! | creation | present | `0` | `RejectMalformed` (duplicate) |
//! | creation | absent | `0` | `Create` |
//! | mutation | absent | any | `DeferGap` |
//! | mutation | `v` | `<= v` | `IgnoreStale` |
//! | mutation | `v`, terminal | `> v` | `RejectMalformed` (terminal) |
//! | mutation | `v` | `> v + 1` | `DeferGap` |
//! | mutation | `v` | `v + 1` | `ApplyUpdate { expected: v }` |
//!
//! Per-entity total order comes from this gate alone: an event that arrives
//! early is deferred and redelivered by the broker until its predecessor has
//! been applied. No lock is held and no thread is dedicated to an entity.

use crate::apply::{self, Applied, Relay};
use crate::error::{Malformed, ReconcileError};
use crate::store::{StoredVersion, Versioned, VersionedStore};
use crate::stream::{EntityId, Version};
use serde::Serialize;

/// What a subject means for the entity it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectRole {
    /// The entity's first appearance (genesis snapshot, version 0).
    Creation,
    /// An update or cancellation of an existing entity.
    Mutation,
}

/// Why the gate rejected an event for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Creation event with a version other than 0.
    NonGenesisCreation {
        /// Version on the event.
        version: Version,
    },
    /// Creation event for an id already stored.
    DuplicateCreation {
        /// Version currently stored.
        stored: Version,
    },
    /// Mutation event for an entity in an absorbing state.
    TerminalState {
        /// Version currently stored.
        stored: Version,
    },
}

/// Outcome of the version gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Insert the genesis snapshot.
    Create,
    /// Overwrite the row, guarded on the stored version being `expected`.
    ApplyUpdate {
        /// Version read by the gate.
        expected: Version,
    },
    /// Already applied or an old duplicate.
    IgnoreStale {
        /// Version currently stored.
        stored: Version,
    },
    /// A predecessor is missing; try again later.
    DeferGap {
        /// Version currently stored, `None` if the entity is unknown.
        stored: Option<Version>,
    },
    /// Never applicable.
    RejectMalformed(Rejection),
}

impl Decision {
    /// Whether the decision leads to a store write.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::Create | Self::ApplyUpdate { .. })
    }

    /// Translate a non-write decision into the matching error.
    ///
    /// Returns `None` for `Create` and `ApplyUpdate`.
    #[must_use]
    pub const fn into_error(
        self,
        kind: &'static str,
        id: EntityId,
        incoming: Version,
    ) -> Option<ReconcileError> {
        match self {
            Self::Create | Self::ApplyUpdate { .. } => None,
            Self::IgnoreStale { stored } => Some(ReconcileError::StaleOrDuplicate {
                kind,
                id,
                incoming,
                stored,
            }),
            Self::DeferGap { stored } => Some(ReconcileError::OrderingGap {
                kind,
                id,
                incoming,
                stored,
            }),
            Self::RejectMalformed(rejection) => {
                let malformed = match rejection {
                    Rejection::NonGenesisCreation { version } => {
                        Malformed::NonGenesisCreation { kind, id, version }
                    },
                    Rejection::DuplicateCreation { stored } => {
                        Malformed::DuplicateCreation { kind, id, stored }
                    },
                    Rejection::TerminalState { stored } => Malformed::TerminalState {
                        kind,
                        id,
                        stored,
                        incoming,
                    },
                };
                Some(ReconcileError::MalformedEnvelope(malformed))
            },
        }
    }
}

/// Classify an incoming `(version, role)` against the stored projection.
///
/// # Examples
///
/// ```
/// use replica_core::reconcile::{Decision, SubjectRole, decide};
/// use replica_core::store::StoredVersion;
/// use replica_core::stream::{EntityId, Version};
///
/// let stored = StoredVersion::new(EntityId::new(42), Version::new(0));
///
/// assert_eq!(decide(None, Version::new(0), SubjectRole::Creation), Decision::Create);
/// assert_eq!(
///     decide(Some(stored), Version::new(1), SubjectRole::Mutation),
///     Decision::ApplyUpdate { expected: Version::new(0) }
/// );
/// assert_eq!(
///     decide(Some(stored), Version::new(2), SubjectRole::Mutation),
///     Decision::DeferGap { stored: Some(Version::new(0)) }
/// );
/// ```
#[must_use]
pub const fn decide(
    stored: Option<StoredVersion>,
    incoming: Version,
    role: SubjectRole,
) -> Decision {
    match role {
        SubjectRole::Creation => {
            if !incoming.is_initial() {
                return Decision::RejectMalformed(Rejection::NonGenesisCreation {
                    version: incoming,
                });
            }
            match stored {
                Some(row) => Decision::RejectMalformed(Rejection::DuplicateCreation {
                    stored: row.version,
                }),
                None => Decision::Create,
            }
        },
        SubjectRole::Mutation => {
            let Some(row) = stored else {
                return Decision::DeferGap { stored: None };
            };
            if incoming.value() <= row.version.value() {
                Decision::IgnoreStale {
                    stored: row.version,
                }
            } else if row.terminal {
                Decision::RejectMalformed(Rejection::TerminalState {
                    stored: row.version,
                })
            } else if !incoming.follows(row.version) {
                Decision::DeferGap {
                    stored: Some(row.version),
                }
            } else {
                Decision::ApplyUpdate {
                    expected: row.version,
                }
            }
        },
    }
}

/// Entity-kind-agnostic reconciler.
///
/// One reconciler serves one entity kind; the kind is selected by the store it
/// is built with. An optional [`Relay`] republishes every applied snapshot
/// inside the same transaction.
pub struct Reconciler<S> {
    store: S,
    relay: Option<Relay>,
}

impl<S> Reconciler<S>
where
    S: VersionedStore,
    S::Entity: Serialize,
{
    /// Create a reconciler over `store`.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store, relay: None }
    }

    /// Republish applied snapshots through `relay`.
    #[must_use]
    pub fn with_relay(mut self, relay: Relay) -> Self {
        self.relay = Some(relay);
        self
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Run the gate for `entity` and apply it if the gate opens.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::MalformedEnvelope`]: creation-protocol violation or
    ///   terminal target
    /// - [`ReconcileError::StaleOrDuplicate`]: already applied
    /// - [`ReconcileError::OrderingGap`]: predecessor missing, or a concurrent
    ///   writer advanced the version after the gate's read
    /// - [`ReconcileError::StoreFailure`] / [`ReconcileError::PublishFailure`]:
    ///   infrastructure
    pub async fn reconcile(
        &self,
        entity: &S::Entity,
        role: SubjectRole,
    ) -> Result<Applied, ReconcileError> {
        let id = entity.id();
        let incoming = entity.version();

        let stored = self.store.lookup(id).await?;
        let decision = decide(stored, incoming, role);

        tracing::trace!(
            kind = S::Entity::KIND,
            id = %id,
            incoming = %incoming,
            stored = ?stored.map(|row| row.version),
            decision = ?decision,
            "Version gate evaluated"
        );

        if let Some(error) = decision.into_error(S::Entity::KIND, id, incoming) {
            return Err(error);
        }

        apply::apply(&self.store, decision, entity, self.relay.as_ref()).await
    }
}
