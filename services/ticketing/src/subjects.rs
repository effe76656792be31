//! Subject names. Each subject is also the broker topic.

/// A ticket was put on sale (ticket replica creation).
pub const TICKET_CREATED: &str = "ticket.created";

/// A ticket's title or price changed.
pub const TICKET_UPDATED: &str = "ticket.updated";

/// An order was placed (order replica creation).
pub const ORDER_CREATED: &str = "order.created";

/// An order changed without being cancelled.
pub const ORDER_UPDATED: &str = "order.updated";

/// An order was cancelled by its owner or by expiration.
pub const ORDER_CANCELLED: &str = "order.cancelled";

/// The expiration window of an order has elapsed.
pub const EXPIRATION_COMPLETE: &str = "expiration.complete";

/// A payment was recorded.
pub const PAYMENT_CREATED: &str = "payment.created";
