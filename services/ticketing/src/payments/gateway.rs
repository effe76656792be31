//! Payment gateway boundary.
//!
//! The real card processor is an external collaborator; the service only needs
//! to charge an amount against a client-side token and get back a charge id.

use crate::types::Money;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Token the mock gateway always declines.
pub const DECLINED_TOKEN: &str = "tok_declined";

/// Why a charge failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The card issuer refused the charge.
    #[error("Card declined: {0}")]
    Declined(String),

    /// The payment token is missing or malformed.
    #[error("Invalid payment token")]
    InvalidToken,

    /// The gateway could not be reached.
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

/// A successful charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    /// Gateway-assigned charge id.
    pub id: String,
    /// Amount charged.
    pub amount: Money,
}

/// Card processor.
pub trait PaymentGateway: Send + Sync {
    /// Charge `amount` against `token`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if nothing was charged.
    fn charge(
        &self,
        amount: Money,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Charge, GatewayError>> + Send + '_>>;
}

/// Gateway that approves every non-empty token except [`DECLINED_TOKEN`].
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    charges: AtomicU64,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway
    #[must_use]
    pub const fn new() -> Self {
        Self {
            charges: AtomicU64::new(0),
        }
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Number of approved charges.
    #[must_use]
    pub fn charges(&self) -> u64 {
        self.charges.load(Ordering::SeqCst)
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn charge(
        &self,
        amount: Money,
        token: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Charge, GatewayError>> + Send + '_>> {
        let token = token.to_string();
        Box::pin(async move {
            if token.is_empty() {
                return Err(GatewayError::InvalidToken);
            }
            if token == DECLINED_TOKEN {
                return Err(GatewayError::Declined("insufficient funds".to_string()));
            }

            let n = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
            let charge = Charge {
                id: format!("ch_mock_{n}"),
                amount,
            };
            tracing::info!(
                charge_id = %charge.id,
                amount = amount.cents(),
                "Mock charge approved"
            );
            Ok(charge)
        })
    }
}
