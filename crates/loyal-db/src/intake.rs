//! Intake boundary used by the HTTP layer.
//!
//! Normalizes and checksums user input before anything reaches storage, and
//! folds store outcomes into the cases a handler maps to status codes.

use loyal_schemas::{Order, Points, UserId, Withdrawal};
use tracing::info;

use crate::{BalanceLedger, CreateOrder, IntakeError, LedgerError, OrderStore};

/// Successful outcome of [`submit_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderIntake {
    /// Newly registered; the reconciler will pick it up.
    Accepted(Order),
    /// The same user uploaded this number before.
    AlreadyUploaded(Order),
}

impl OrderIntake {
    pub fn order(&self) -> &Order {
        match self {
            OrderIntake::Accepted(o) | OrderIntake::AlreadyUploaded(o) => o,
        }
    }
}

/// Register a raw order number for `user_id`.
pub async fn submit_order<S>(
    store: &S,
    user_id: UserId,
    raw_number: &str,
) -> Result<OrderIntake, IntakeError>
where
    S: OrderStore + ?Sized,
{
    let number = raw_number.trim();
    if number.is_empty() {
        return Err(IntakeError::Empty);
    }
    if !loyal_checksum::is_valid(number) {
        return Err(IntakeError::InvalidChecksum(number.to_string()));
    }

    match store.create_order(user_id, number).await? {
        CreateOrder::Created(order) => {
            info!(order = %order.number, user_id, "order registered");
            Ok(OrderIntake::Accepted(order))
        }
        CreateOrder::AlreadyOwned(order) => Ok(OrderIntake::AlreadyUploaded(order)),
        CreateOrder::OwnedByOther { owner } => Err(IntakeError::OrderConflict {
            number: number.to_string(),
            owner,
        }),
    }
}

/// Spend `sum` points against `order_ref`.
pub async fn withdraw<L>(
    ledger: &L,
    user_id: UserId,
    order_ref: &str,
    sum: Points,
) -> Result<Withdrawal, LedgerError>
where
    L: BalanceLedger + ?Sized,
{
    let withdrawal = ledger.debit(user_id, order_ref.trim(), sum).await?;
    info!(user_id, order = %withdrawal.order, sum = %withdrawal.sum, "withdrawal recorded");
    Ok(withdrawal)
}
