//! Orders and payments services.
//!
//! Two cooperating services keep local copies of entities owned elsewhere and
//! publish the entities they own:
//!
//! ```text
//!  tickets service            orders service                 payments service
//! ┌──────────────┐ ticket.* ┌──────────────────┐ order.*   ┌──────────────────┐
//! │   (owner)    │─────────►│ ticket replicas  │──────────►│ order replicas   │
//! └──────────────┘          │ orders (owner)   │           │ payments (owner) │
//!  expiration service       └──────────────────┘           └────────┬─────────┘
//! ┌──────────────┐ expiration.complete ▲                            │
//! │              │─────────────────────┘                            ▼
//! └──────────────┘                                          payment.created
//! ```
//!
//! Every replicated snapshot goes through the version gate of
//! [`replica_core`]; every owned change is published inside the transaction
//! that writes it.
//!
//! # Modules
//!
//! - [`orders`]: order commands, ticket replica, expiration
//! - [`payments`]: order replica, payment commands, payment gateway
//! - [`app`]: subject routers of both services
//! - [`runtime`]: consumers and lifecycle
//! - [`config`], [`metrics`]: process setup

#![forbid(unsafe_code)]

pub mod app;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orders;
pub mod payments;
pub mod runtime;
pub mod subjects;
pub mod tickets;
pub mod types;

pub use config::{Config, ConfigError};
pub use error::CommandError;
pub use types::{Money, OrderStatus, UserId};
