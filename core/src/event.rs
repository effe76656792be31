//! Envelope codec: raw broker messages to typed entity snapshots.
//!
//! Every message on the wire is a JSON object keyed by its subject name, whose
//! value is the snapshot of the entity the subject concerns:
//!
//! ```json
//! { "ticket.updated": { "id": 42, "version": 1, "title": "Concert", "price": 2000 } }
//! ```
//!
//! Decoding extracts the single key matching the envelope's subject. Anything
//! else (invalid JSON, missing key, snapshot of the wrong shape) is a
//! [`CodecError`], which the reconciliation engine always treats as a terminal
//! discard: no handler will ever be able to process that message.
//!
//! # Example
//!
//! ```
//! use replica_core::event::{Envelope, decode, encode};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Ticket { id: i64, version: u64, price: u64 }
//!
//! let ticket = Ticket { id: 42, version: 0, price: 1000 };
//! let payload = encode("ticket.created", &ticket).unwrap();
//!
//! let envelope = Envelope::new("ticket.created", payload);
//! let decoded: Ticket = decode(&envelope).unwrap();
//! assert_eq!(decoded, ticket);
//! ```

use crate::stream::Sequence;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for envelope encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload is not a JSON object.
    #[error("Payload for subject '{subject}' is not a JSON object: {reason}")]
    InvalidPayload {
        /// Subject the payload arrived on.
        subject: String,
        /// Parser message.
        reason: String,
    },

    /// Payload does not contain an entry for its own subject.
    #[error("Payload has no entry for subject '{0}'")]
    MissingSubjectKey(String),

    /// The snapshot under the subject key has the wrong shape.
    #[error("Snapshot for subject '{subject}' could not be decoded: {reason}")]
    InvalidSnapshot {
        /// Subject the payload arrived on.
        subject: String,
        /// Deserializer message.
        reason: String,
    },

    /// Failed to serialize a snapshot.
    #[error("Failed to encode snapshot for subject '{subject}': {reason}")]
    EncodeFailed {
        /// Subject being encoded.
        subject: String,
        /// Serializer message.
        reason: String,
    },
}

/// A message as delivered by the broker, before decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Subject (topic) the message was published on.
    pub subject: String,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// Delivery attempt, starting at 1 for the first delivery.
    pub delivery_attempt: u32,

    /// Broker sequence of the message, when the broker exposes one.
    pub sequence: Option<Sequence>,
}

impl Envelope {
    /// Create an envelope for a first delivery with no known sequence.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            delivery_attempt: 1,
            sequence: None,
        }
    }

    /// Set the delivery attempt.
    #[must_use]
    pub const fn with_attempt(mut self, delivery_attempt: u32) -> Self {
        self.delivery_attempt = delivery_attempt;
        self
    }

    /// Set the broker sequence.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ subject: {}, attempt: {}, size: {} bytes }}",
            self.subject,
            self.delivery_attempt,
            self.payload.len()
        )
    }
}

/// Encode a snapshot as `{ "<subject>": snapshot }`.
///
/// # Errors
///
/// Returns [`CodecError::EncodeFailed`] if the snapshot cannot be serialized.
pub fn encode<T: Serialize>(subject: &str, snapshot: &T) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(snapshot).map_err(|e| CodecError::EncodeFailed {
        subject: subject.to_string(),
        reason: e.to_string(),
    })?;

    let mut map = serde_json::Map::with_capacity(1);
    map.insert(subject.to_string(), value);

    serde_json::to_vec(&serde_json::Value::Object(map)).map_err(|e| CodecError::EncodeFailed {
        subject: subject.to_string(),
        reason: e.to_string(),
    })
}

/// Decode the snapshot stored under the envelope's own subject.
///
/// Other keys in the payload are ignored.
///
/// # Errors
///
/// - [`CodecError::InvalidPayload`]: not a JSON object
/// - [`CodecError::MissingSubjectKey`]: no entry (or `null`) for the subject
/// - [`CodecError::InvalidSnapshot`]: entry does not match `T`
pub fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, CodecError> {
    let subject = envelope.subject.as_str();

    let value: serde_json::Value =
        serde_json::from_slice(&envelope.payload).map_err(|e| CodecError::InvalidPayload {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;

    let serde_json::Value::Object(mut map) = value else {
        return Err(CodecError::InvalidPayload {
            subject: subject.to_string(),
            reason: "expected an object".to_string(),
        });
    };

    let snapshot = match map.remove(subject) {
        None | Some(serde_json::Value::Null) => {
            return Err(CodecError::MissingSubjectKey(subject.to_string()));
        },
        Some(snapshot) => snapshot,
    };

    serde_json::from_value(snapshot).map_err(|e| CodecError::InvalidSnapshot {
        subject: subject.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct TestSnapshot {
        id: i64,
        version: u64,
        title: String,
    }

    fn snapshot() -> TestSnapshot {
        TestSnapshot {
            id: 42,
            version: 0,
            title: "Concert".to_string(),
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn encoded_payload_is_keyed_by_subject() {
        let bytes = encode("ticket.created", &snapshot()).expect("encode should succeed");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("valid json");

        assert_eq!(value["ticket.created"]["id"], 42);
        assert_eq!(value["ticket.created"]["title"], "Concert");
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn decode_extracts_only_own_subject() {
        let payload = serde_json::json!({
            "ticket.updated": { "id": 1, "version": 9, "title": "Other" },
            "ticket.created": { "id": 42, "version": 0, "title": "Concert" },
        });
        let envelope = Envelope::new("ticket.created", payload.to_string().into_bytes());

        let decoded: TestSnapshot = decode(&envelope).expect("decode should succeed");
        assert_eq!(decoded, snapshot());
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let envelope = Envelope::new("ticket.created", b"not json".to_vec());
        let result = decode::<TestSnapshot>(&envelope);
        assert!(matches!(result, Err(CodecError::InvalidPayload { .. })));
    }

    #[test]
    fn decode_rejects_non_object() {
        let envelope = Envelope::new("ticket.created", b"[1, 2, 3]".to_vec());
        let result = decode::<TestSnapshot>(&envelope);
        assert!(matches!(result, Err(CodecError::InvalidPayload { .. })));
    }

    #[test]
    fn decode_rejects_missing_and_null_key() {
        let missing = Envelope::new("ticket.created", br#"{"ticket.updated": {}}"#.to_vec());
        assert_eq!(
            decode::<TestSnapshot>(&missing),
            Err(CodecError::MissingSubjectKey("ticket.created".to_string()))
        );

        let null = Envelope::new("ticket.created", br#"{"ticket.created": null}"#.to_vec());
        assert_eq!(
            decode::<TestSnapshot>(&null),
            Err(CodecError::MissingSubjectKey("ticket.created".to_string()))
        );
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let envelope = Envelope::new(
            "ticket.created",
            br#"{"ticket.created": {"id": "forty-two"}}"#.to_vec(),
        );
        let result = decode::<TestSnapshot>(&envelope);
        assert!(matches!(result, Err(CodecError::InvalidSnapshot { .. })));
    }

    #[test]
    fn envelope_display() {
        let envelope = Envelope::new("order.created", vec![1, 2, 3]).with_attempt(3);
        let display = format!("{envelope}");
        assert!(display.contains("order.created"));
        assert!(display.contains("attempt: 3"));
        assert!(display.contains("3 bytes"));
    }
}
