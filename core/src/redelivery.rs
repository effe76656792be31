//! Redelivery policy and per-message dispositions.
//!
//! The broker owns redelivery: it waits a fixed delay before handing a
//! negatively-acknowledged message to a worker again and permanently discards
//! the message once its delivery budget is spent. The reconciliation engine only
//! emits a [`Disposition`] for every message it handles.
//!
//! | Disposition | Broker action |
//! |---|---|
//! | [`Disposition::Ack`] | remove the message |
//! | [`Disposition::Nak`] | redeliver after the delay, while budget remains |
//! | [`Disposition::Term`] | remove the message, never redeliver |

use std::fmt;
use std::time::Duration;

/// Broker-side redelivery configuration, injected process-wide.
///
/// # Default Values
///
/// - `nak_delay`: 1 second
/// - `max_deliver`: 10 deliveries (the first delivery counts)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Delay before a negatively-acknowledged message is delivered again.
    pub nak_delay: Duration,
    /// Maximum number of deliveries of one message, including the first.
    pub max_deliver: u32,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            nak_delay: Duration::from_secs(1),
            max_deliver: 10,
        }
    }
}

impl RedeliveryPolicy {
    /// Create a policy with an explicit delay and budget.
    ///
    /// A `max_deliver` of 0 is treated as 1: every message is delivered once.
    #[must_use]
    pub const fn new(nak_delay: Duration, max_deliver: u32) -> Self {
        Self {
            nak_delay,
            max_deliver: if max_deliver == 0 { 1 } else { max_deliver },
        }
    }

    /// Whether a message on its `attempt`-th delivery may be delivered again.
    #[must_use]
    pub const fn allows_redelivery(&self, attempt: u32) -> bool {
        attempt < self.max_deliver
    }

    /// Whether `attempt` is the last delivery the budget allows.
    #[must_use]
    pub const fn is_final_attempt(&self, attempt: u32) -> bool {
        !self.allows_redelivery(attempt)
    }

    /// The disposition that requests a delayed redelivery.
    #[must_use]
    pub const fn defer(&self) -> Disposition {
        Disposition::Nak(self.nak_delay)
    }
}

/// What the broker should do with a handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove permanently.
    Ack,
    /// Not processable yet; redeliver after the delay.
    Nak(Duration),
    /// Never processable; discard permanently without redelivery.
    Term,
}

impl Disposition {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nak(_) => "nak",
            Self::Term => "term",
        }
    }

    /// Whether the message leaves the broker for good.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ack | Self::Term)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nak(delay) => write!(f, "nak({}ms)", delay.as_millis()),
            other => f.write_str(other.as_str()),
        }
    }
}
