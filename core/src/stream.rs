//! Entity identification, versioning and broker sequence types.
//!
//! Replicated entities are identified by an integer assigned by the service that
//! owns them ([`EntityId`]) and carry a monotonically increasing [`Version`].
//! Every durable publish is acknowledged with a per-stream [`Sequence`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `EntityId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid entity ID: {0}")]
pub struct ParseEntityIdError(String);

/// Identifier of a replicated entity.
///
/// The id is assigned by the owning service, never generated by a replica.
/// It is a newtype around `i64` so it maps directly onto a `BIGINT` column.
///
/// # Examples
///
/// ```
/// use replica_core::stream::EntityId;
///
/// let id = EntityId::new(42);
/// assert_eq!(id.value(), 42);
///
/// let parsed: EntityId = "42".parse().unwrap();
/// assert_eq!(parsed, id);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(i64);

impl EntityId {
    /// Create a new `EntityId`.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = ParseEntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<i64>() {
            Ok(id) if id > 0 => Ok(Self(id)),
            _ => Err(ParseEntityIdError(s.to_string())),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<EntityId> for i64 {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Entity version number used by the version gate.
///
/// Versions start at 0 (the genesis state published by a creation event) and
/// increase by exactly 1 for every applied mutation.
///
/// # Examples
///
/// ```
/// use replica_core::stream::Version;
///
/// let v0 = Version::INITIAL;
/// assert_eq!(v0.next(), Version::new(1));
/// assert!(v0.is_initial());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The genesis version carried by every creation event.
    pub const INITIAL: Self = Self(0);

    /// Version `value`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The only version a mutation of `self` may carry.
    ///
    /// Saturates at `u64::MAX`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Whether this is the genesis version.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }

    /// Whether `self` directly succeeds `stored`.
    #[must_use]
    pub const fn follows(self, stored: Self) -> bool {
        stored.0 < u64::MAX && self.0 == stored.0 + 1
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// Sequence number assigned by the broker to a durably appended message.
///
/// Sequences increase monotonically within one stream (a topic partition for
/// Kafka-compatible brokers). Callers treat a sequence as proof that the
/// message was persisted, not merely buffered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// Create a new `Sequence`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
