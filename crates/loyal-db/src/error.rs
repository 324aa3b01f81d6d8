//! Error taxonomy for the storage capability.
//!
//! [`StoreError`] is infrastructure failure (connection, query, decode).
//! [`LedgerError`] and [`IntakeError`] carry the business outcomes callers
//! branch on; each wraps `StoreError` for the infrastructure case.

use loyal_schemas::{Points, UserId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend failure, with context attached at the failing call site.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    /// The caller asked for an operation the contract does not allow.
    #[error("invalid store request: {0}")]
    InvalidRequest(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The withdrawal reference does not pass the Luhn check.
    #[error("order number {0:?} fails the checksum")]
    InvalidOrderNumber(String),

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Points),

    #[error("insufficient funds: current={current} requested={requested}")]
    InsufficientFunds { current: Points, requested: Points },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<anyhow::Error> for LedgerError {
    fn from(e: anyhow::Error) -> Self {
        LedgerError::Store(StoreError::Backend(e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("order number is empty")]
    Empty,

    #[error("order number {0:?} fails the checksum")]
    InvalidChecksum(String),

    /// The number is already registered to a different user.
    #[error("order {number} is already registered by another user")]
    OrderConflict { number: String, owner: UserId },

    #[error(transparent)]
    Store(#[from] StoreError),
}
