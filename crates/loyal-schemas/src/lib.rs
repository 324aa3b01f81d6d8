//! loyal-schemas
//!
//! Shared data model: point amounts, orders and their status state machine,
//! balances, and withdrawal records. Pure types, no IO.

mod order;
mod points;

pub use order::{Order, OrderStatus, Transition};
pub use points::{Points, MICROS_PER_POINT};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User identity as issued by the authentication collaborator.
pub type UserId = i64;

/// Per-user ledger totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable points.
    pub current: Points,
    /// Lifetime total debited.
    pub withdrawn: Points,
}

/// Append-only record of a successful debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Reference tag supplied by the user; not necessarily an order in this system.
    pub order: String,
    pub sum: Points,
    pub processed_at: DateTime<Utc>,
}
