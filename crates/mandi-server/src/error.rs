//! Error taxonomy for the marketplace core.
//!
//! Four families, each with distinct handling:
//! - configuration: fatal to the request, surfaced immediately, never retried
//! - validation: rejected synchronously with an actionable payload, no mutation
//! - external: retried at most once, then degraded to a fallback
//! - protocol: stale/duplicate events, detected and rejected rather than re-applied

use mandi_common::Role;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Coarse error family, reported to clients alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Config,
    Validation,
    External,
    Protocol,
}

/// Errors produced by the session core.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} already has a customer")]
    SessionOccupied(String),

    #[error("floor price not set for product {0}")]
    MissingFloorPrice(String),

    #[error("unknown product: {0}")]
    UnknownProduct(String),

    #[error("operation requires the {required} role")]
    Unauthorized { required: Role },

    #[error(
        "cannot add {requested}kg of {product_id}: only {available}kg in stock, {in_cart}kg already in cart"
    )]
    StockExceeded {
        product_id: String,
        requested: Decimal,
        available: Decimal,
        in_cart: Decimal,
    },

    #[error("stock for {0} cannot be negative")]
    NegativeStock(String),

    #[error("quantity must be positive")]
    NonPositiveQuantity,

    #[error("price must be positive")]
    NonPositivePrice,

    #[error("out-of-order round {round} for {product_id}: last seen round {last_round}")]
    StaleRound {
        product_id: String,
        round: u32,
        last_round: u32,
    },

    #[error("negotiation for {0} is closed: {1}")]
    NegotiationClosed(String, &'static str),

    #[error("no negotiation awaiting a response for {0}")]
    NothingToRespond(String),

    #[error("payment reference {0} already settled")]
    DuplicateSettlement(String),

    #[error("no pending settlement for reference {0}")]
    UnknownSettlement(String),

    #[error("cart is empty, nothing to settle")]
    EmptyCart,

    #[error("payment verification failed for reference {0}")]
    VerificationFailed(String),

    #[error("external service failed: {0}")]
    External(String),
}

impl MarketError {
    /// Which family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::SessionNotFound(_) | MarketError::MissingFloorPrice(_) => {
                ErrorKind::Config
            }

            MarketError::SessionOccupied(_)
            | MarketError::UnknownProduct(_)
            | MarketError::Unauthorized { .. }
            | MarketError::StockExceeded { .. }
            | MarketError::NegativeStock(_)
            | MarketError::NonPositiveQuantity
            | MarketError::NonPositivePrice
            | MarketError::EmptyCart => ErrorKind::Validation,

            MarketError::StaleRound { .. }
            | MarketError::NegotiationClosed(_, _)
            | MarketError::NothingToRespond(_)
            | MarketError::DuplicateSettlement(_)
            | MarketError::UnknownSettlement(_)
            | MarketError::VerificationFailed(_) => ErrorKind::Protocol,

            MarketError::External(_) => ErrorKind::External,
        }
    }
}

/// Convenience alias used throughout the core.
pub type Result<T, E = MarketError> = std::result::Result<T, E>;
