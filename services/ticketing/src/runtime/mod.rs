//! Background consumers and process lifecycle.

mod consumer;
mod lifecycle;

pub use consumer::SubjectConsumer;
pub use lifecycle::{Application, RunningApplication};
