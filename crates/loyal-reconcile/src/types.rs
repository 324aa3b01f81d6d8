use std::time::Duration;

use loyal_schemas::{OrderStatus, Points, UserId};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Time between tick starts.
    pub poll_interval: Duration,
    /// Upper bound on concurrent authority calls within one tick.
    pub max_in_flight: usize,
}

/// Floor for deferred re-checks. A `Retry-After: 0` still waits this long.
pub const MIN_RECHECK_DELAY: Duration = Duration::from_secs(1);

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_in_flight: 8,
        }
    }
}

/// What reconciling one order did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderAction {
    /// Nothing persisted: same status, unknown to the authority, or a
    /// refused backward move.
    Unchanged,
    /// Status moved forward (PROCESSING or INVALID).
    Advanced { from: OrderStatus, to: OrderStatus },
    /// Settled as PROCESSED but the credit did not go through in this call.
    /// The next credit sweep applies it.
    Settled { accrual: Points },
    /// Settled and credited to the owner.
    Credited { user_id: UserId, amount: Points },
    /// Not polled: terminal, missing, or a deferred re-check is pending.
    Skipped,
    /// Rate limited; re-check after this many seconds.
    Deferred { after_secs: u64 },
    Failed { reason: String },
}

impl OrderAction {
    /// Deferral of at least [`MIN_RECHECK_DELAY`], in whole seconds.
    pub(crate) fn deferred(after: Duration) -> Self {
        OrderAction::Deferred {
            after_secs: after.max(MIN_RECHECK_DELAY).as_secs(),
        }
    }

    pub(crate) fn failed(reason: impl std::fmt::Display) -> Self {
        OrderAction::Failed {
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderReport {
    pub number: String,
    pub action: OrderAction,
}

/// Summary of one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Orders credited by the crash-recovery sweep.
    pub swept: usize,
    /// Listing outstanding orders failed; nothing was polled.
    pub listing_failed: bool,
    pub orders: Vec<OrderReport>,
}

impl TickReport {
    fn count(&self, pred: impl Fn(&OrderAction) -> bool) -> usize {
        self.orders.iter().filter(|r| pred(&r.action)).count()
    }

    pub fn advanced(&self) -> usize {
        self.count(|a| matches!(a, OrderAction::Advanced { .. }))
    }

    pub fn settled(&self) -> usize {
        self.count(|a| {
            matches!(
                a,
                OrderAction::Settled { .. } | OrderAction::Credited { .. }
            )
        })
    }

    pub fn deferred(&self) -> usize {
        self.count(|a| matches!(a, OrderAction::Deferred { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|a| matches!(a, OrderAction::Failed { .. }))
    }

    /// Orders that asked to be re-checked later, with their delay.
    pub fn deferrals(&self) -> impl Iterator<Item = (&str, Duration)> + '_ {
        self.orders.iter().filter_map(|r| match r.action {
            OrderAction::Deferred { after_secs } => {
                Some((r.number.as_str(), Duration::from_secs(after_secs)))
            }
            _ => None,
        })
    }

    pub fn is_quiet(&self) -> bool {
        self.swept == 0
            && !self.listing_failed
            && self
                .orders
                .iter()
                .all(|r| matches!(r.action, OrderAction::Unchanged | OrderAction::Skipped))
    }
}

/// Published on the optional event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconcileEvent {
    StatusChanged {
        number: String,
        user_id: UserId,
        from: OrderStatus,
        to: OrderStatus,
    },
    Credited {
        number: String,
        user_id: UserId,
        amount: Points,
    },
    Tick(TickReport),
}
