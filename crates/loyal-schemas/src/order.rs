//! Order record and its status state machine.
//!
//! # State diagram
//!
//! ```text
//!   create ──► NEW ──► PROCESSING
//!               │  \        │
//!               │   \       ├──► INVALID   (terminal)
//!               │    \      │
//!               │     └─────┴──► PROCESSED (terminal, accrual written with it)
//!               └──────────────► INVALID
//! ```
//!
//! Re-applying the current status is a no-op. Nothing moves backward: an
//! order that reached PROCESSING never returns to NEW, and terminal orders
//! are never revisited even if the accrual authority changes its answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Points, UserId};

// ---------------------------------------------------------------------------
// OrderStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Uploaded; the accrual authority has not started evaluating it.
    New,
    /// The accrual authority is evaluating the order.
    Processing,
    /// Rejected by the accrual authority. **Terminal.**
    Invalid,
    /// Accrual confirmed. **Terminal.**
    Processed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::New,
        OrderStatus::Processing,
        OrderStatus::Invalid,
        OrderStatus::Processed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OrderStatus::New),
            "PROCESSING" => Some(OrderStatus::Processing),
            "INVALID" => Some(OrderStatus::Invalid),
            "PROCESSED" => Some(OrderStatus::Processed),
            _ => None,
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    /// Outstanding orders form the reconciliation work queue.
    pub fn is_outstanding(&self) -> bool {
        !self.is_terminal()
    }

    /// Statuses from which `self` may be entered by a persisted transition.
    ///
    /// Storage backends use this as the guard of their conditional update so
    /// the state machine lives in one place.
    pub fn allowed_predecessors(&self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::New => &[],
            OrderStatus::Processing => &[OrderStatus::New],
            OrderStatus::Invalid | OrderStatus::Processed => {
                &[OrderStatus::New, OrderStatus::Processing]
            }
        }
    }

    /// Evaluate a requested move from `self` to `next`.
    pub fn transition(&self, next: OrderStatus) -> Transition {
        if *self == next {
            Transition::Unchanged
        } else if next.allowed_predecessors().contains(self) {
            Transition::Forward
        } else {
            Transition::Refused
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of checking a status move against the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Target equals the current status; nothing to persist.
    Unchanged,
    /// Legal forward move; persist it.
    Forward,
    /// Backward move or move out of a terminal status; ignore it.
    Refused,
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A loyalty order as held by the order store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Globally unique order number (Luhn-valid digits).
    pub number: String,
    pub user_id: UserId,
    pub status: OrderStatus,
    /// Zero unless `status == Processed`.
    pub accrual: Points,
    /// `true` once `accrual` has been applied to the owner's balance.
    pub credited: bool,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// A freshly uploaded order.
    pub fn new(number: impl Into<String>, user_id: UserId, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            number: number.into(),
            user_id,
            status: OrderStatus::New,
            accrual: Points::ZERO,
            credited: false,
            uploaded_at,
        }
    }

    /// Settled but the balance credit has not been applied yet.
    pub fn awaits_credit(&self) -> bool {
        self.status == OrderStatus::Processed && !self.credited
    }
}
