//! loyal-db
//!
//! The storage capability: [`OrderStore`] and [`BalanceLedger`], combined as
//! [`Storage`], with two implementations chosen at composition time:
//!
//! - [`PgStorage`]: Postgres via sqlx. Every multi-row mutation is one
//!   transaction; per-user balance mutations serialize on the balance row
//!   (`SELECT ... FOR UPDATE`).
//! - [`MemStorage`]: in-process maps guarded by one async mutex per user
//!   account. Used by tests and by the daemon when no database is configured.
//!
//! Crediting a settled order is idempotent: the `credited` flag on the order
//! flips in the same atomic unit that adds its accrual to the balance, so a
//! replayed settlement never credits twice.

mod error;
pub mod intake;
mod mem;
mod pg;

pub use error::{IntakeError, LedgerError, StoreError};
pub use mem::MemStorage;
pub use pg::{connect, connect_from_env, migrate, PgStorage, ENV_DB_URL};

use async_trait::async_trait;
use loyal_schemas::{Balance, Order, OrderStatus, Points, UserId, Withdrawal};

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Result of registering an order number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOrder {
    /// New order inserted in status NEW.
    Created(Order),
    /// The same user uploaded this number before; nothing changed.
    AlreadyOwned(Order),
    /// Another user owns this number; nothing changed.
    OwnedByOther { owner: UserId },
}

/// Result of a status mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// Persisted a forward move.
    Applied { from: OrderStatus, to: OrderStatus },
    /// Stored status already equals the target.
    Unchanged,
    /// Backward move or move out of a terminal status; nothing persisted.
    Refused { current: OrderStatus },
    /// No order with that number.
    Missing,
}

/// Result of crediting a settled order's accrual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    /// Accrual added to the owner's balance in this call.
    Credited {
        user_id: UserId,
        amount: Points,
        balance: Balance,
    },
    /// A previous call already credited this order.
    AlreadyCredited,
    /// Order is not PROCESSED; there is nothing to credit yet.
    NotSettled,
    /// No order with that number.
    Missing,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Order records and their status lifecycle.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Register `number` for `user_id`. Atomic with respect to concurrent
    /// registrations of the same number. Callers validate the checksum.
    async fn create_order(&self, user_id: UserId, number: &str) -> Result<CreateOrder, StoreError>;

    async fn order_by_number(&self, number: &str) -> Result<Option<Order>, StoreError>;

    /// Orders owned by `user_id`, newest first.
    async fn orders_by_user(&self, user_id: UserId) -> Result<Vec<Order>, StoreError>;

    /// Orders in NEW or PROCESSING: the reconciliation work queue.
    async fn outstanding_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// PROCESSED orders whose accrual has not been credited yet.
    async fn uncredited_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// Move an order to NEW, PROCESSING or INVALID if the state machine
    /// allows it. PROCESSED is only reachable through [`settle_order`].
    ///
    /// [`settle_order`]: OrderStore::settle_order
    async fn advance_status(
        &self,
        number: &str,
        status: OrderStatus,
    ) -> Result<StatusChange, StoreError>;

    /// Move an order to PROCESSED, writing `accrual` in the same statement.
    /// Terminal orders are left untouched.
    async fn settle_order(&self, number: &str, accrual: Points)
        -> Result<StatusChange, StoreError>;
}

/// Per-user balances and the withdrawal log.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Add `amount` (> 0) to the user's current balance, creating the
    /// balance record if needed. Returns the balance after the credit.
    async fn credit(&self, user_id: UserId, amount: Points) -> Result<Balance, LedgerError>;

    /// Credit a settled order's accrual to its owner exactly once.
    async fn credit_order(&self, number: &str) -> Result<CreditOutcome, StoreError>;

    /// Debit `amount` against `order_ref`: decrement current, increment
    /// withdrawn, and append a withdrawal as one atomic unit.
    async fn debit(
        &self,
        user_id: UserId,
        order_ref: &str,
        amount: Points,
    ) -> Result<Withdrawal, LedgerError>;

    /// Current totals; zeros for a user with no records.
    async fn balance(&self, user_id: UserId) -> Result<Balance, StoreError>;

    /// Withdrawal history, most recent first.
    async fn withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>, StoreError>;
}

/// The full storage capability consumed by the daemon and the reconciler.
pub trait Storage: OrderStore + BalanceLedger {}

impl<T: OrderStore + BalanceLedger> Storage for T {}

// ---------------------------------------------------------------------------
// Shared checks
// ---------------------------------------------------------------------------

/// Validation every [`BalanceLedger::debit`] runs before touching storage.
/// Returns the trimmed order reference.
pub(crate) fn precheck_debit(order_ref: &str, amount: Points) -> Result<&str, LedgerError> {
    let reference = order_ref.trim();
    if !loyal_checksum::is_valid(reference) {
        return Err(LedgerError::InvalidOrderNumber(reference.to_string()));
    }
    if !amount.is_positive() {
        return Err(LedgerError::NonPositiveAmount(amount));
    }
    Ok(reference)
}

pub(crate) fn precheck_credit(amount: Points) -> Result<(), LedgerError> {
    if !amount.is_positive() {
        return Err(LedgerError::NonPositiveAmount(amount));
    }
    Ok(())
}
