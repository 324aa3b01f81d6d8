//! In-process storage.
//!
//! Lock order: a user's account mutex, then the orders map. Balance
//! mutations for one user serialize on that user's account mutex; crediting
//! an order additionally holds the orders map while it flips `credited` and
//! adds the accrual, so no reader observes one without the other.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use loyal_schemas::{Balance, Order, OrderStatus, Points, Transition, UserId, Withdrawal};
use tokio::sync::Mutex;

use crate::{
    precheck_credit, precheck_debit, BalanceLedger, CreateOrder, CreditOutcome, LedgerError,
    OrderStore, StatusChange, StoreError,
};

#[derive(Debug, Default)]
struct Account {
    balance: Balance,
    /// Oldest first; reversed on read.
    withdrawals: Vec<Withdrawal>,
}

#[derive(Debug)]
struct StoredOrder {
    order: Order,
    /// Insertion sequence; breaks `uploaded_at` ties.
    seq: u64,
}

#[derive(Debug, Default)]
struct OrderTable {
    rows: HashMap<String, StoredOrder>,
    next_seq: u64,
}

/// Storage held in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemStorage {
    orders: Mutex<OrderTable>,
    accounts: Mutex<HashMap<UserId, Arc<Mutex<Account>>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn account(&self, user_id: UserId) -> Arc<Mutex<Account>> {
        let mut accounts = self.accounts.lock().await;
        Arc::clone(accounts.entry(user_id).or_default())
    }

    async fn existing_account(&self, user_id: UserId) -> Option<Arc<Mutex<Account>>> {
        self.accounts.lock().await.get(&user_id).cloned()
    }

    async fn collect_orders<F>(&self, keep: F) -> Vec<Order>
    where
        F: Fn(&Order) -> bool,
    {
        let table = self.orders.lock().await;
        let mut rows: Vec<&StoredOrder> = table.rows.values().filter(|r| keep(&r.order)).collect();
        rows.sort_by_key(|r| r.seq);
        rows.into_iter().map(|r| r.order.clone()).collect()
    }
}

#[async_trait]
impl OrderStore for MemStorage {
    async fn create_order(&self, user_id: UserId, number: &str) -> Result<CreateOrder, StoreError> {
        let mut table = self.orders.lock().await;
        if let Some(existing) = table.rows.get(number) {
            return Ok(if existing.order.user_id == user_id {
                CreateOrder::AlreadyOwned(existing.order.clone())
            } else {
                CreateOrder::OwnedByOther {
                    owner: existing.order.user_id,
                }
            });
        }

        let order = Order::new(number, user_id, Utc::now());
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(
            number.to_string(),
            StoredOrder {
                order: order.clone(),
                seq,
            },
        );
        Ok(CreateOrder::Created(order))
    }

    async fn order_by_number(&self, number: &str) -> Result<Option<Order>, StoreError> {
        let table = self.orders.lock().await;
        Ok(table.rows.get(number).map(|r| r.order.clone()))
    }

    async fn orders_by_user(&self, user_id: UserId) -> Result<Vec<Order>, StoreError> {
        let table = self.orders.lock().await;
        let mut rows: Vec<&StoredOrder> = table
            .rows
            .values()
            .filter(|r| r.order.user_id == user_id)
            .collect();
        rows.sort_by(|a, b| {
            b.order
                .uploaded_at
                .cmp(&a.order.uploaded_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(rows.into_iter().map(|r| r.order.clone()).collect())
    }

    async fn outstanding_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self.collect_orders(|o| o.status.is_outstanding()).await)
    }

    async fn uncredited_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self.collect_orders(Order::awaits_credit).await)
    }

    async fn advance_status(
        &self,
        number: &str,
        status: OrderStatus,
    ) -> Result<StatusChange, StoreError> {
        if status == OrderStatus::Processed {
            return Err(StoreError::InvalidRequest(
                "PROCESSED is only reachable through settle_order",
            ));
        }
        let mut table = self.orders.lock().await;
        let Some(row) = table.rows.get_mut(number) else {
            return Ok(StatusChange::Missing);
        };
        let from = row.order.status;
        Ok(match from.transition(status) {
            Transition::Unchanged => StatusChange::Unchanged,
            Transition::Refused => StatusChange::Refused { current: from },
            Transition::Forward => {
                row.order.status = status;
                StatusChange::Applied { from, to: status }
            }
        })
    }

    async fn settle_order(
        &self,
        number: &str,
        accrual: Points,
    ) -> Result<StatusChange, StoreError> {
        if accrual.is_negative() {
            return Err(StoreError::InvalidRequest("accrual must not be negative"));
        }
        let mut table = self.orders.lock().await;
        let Some(row) = table.rows.get_mut(number) else {
            return Ok(StatusChange::Missing);
        };
        let from = row.order.status;
        Ok(match from.transition(OrderStatus::Processed) {
            Transition::Unchanged => StatusChange::Unchanged,
            Transition::Refused => StatusChange::Refused { current: from },
            Transition::Forward => {
                row.order.status = OrderStatus::Processed;
                row.order.accrual = accrual;
                StatusChange::Applied {
                    from,
                    to: OrderStatus::Processed,
                }
            }
        })
    }
}

#[async_trait]
impl BalanceLedger for MemStorage {
    async fn credit(&self, user_id: UserId, amount: Points) -> Result<Balance, LedgerError> {
        precheck_credit(amount)?;
        let account = self.account(user_id).await;
        let mut acc = account.lock().await;
        acc.balance.current = acc
            .balance
            .current
            .checked_add(amount)
            .ok_or_else(|| anyhow!("balance overflow for user {user_id}"))?;
        Ok(acc.balance)
    }

    async fn credit_order(&self, number: &str) -> Result<CreditOutcome, StoreError> {
        let user_id = match self.order_by_number(number).await? {
            Some(order) => order.user_id,
            None => return Ok(CreditOutcome::Missing),
        };

        let account = self.account(user_id).await;
        let mut acc = account.lock().await;
        let mut table = self.orders.lock().await;
        let Some(row) = table.rows.get_mut(number) else {
            return Ok(CreditOutcome::Missing);
        };

        if row.order.credited {
            return Ok(CreditOutcome::AlreadyCredited);
        }
        if row.order.status != OrderStatus::Processed {
            return Ok(CreditOutcome::NotSettled);
        }

        let amount = row.order.accrual;
        let next = acc
            .balance
            .current
            .checked_add(amount)
            .ok_or_else(|| anyhow!("balance overflow for user {user_id}"))?;
        acc.balance.current = next;
        row.order.credited = true;

        Ok(CreditOutcome::Credited {
            user_id,
            amount,
            balance: acc.balance,
        })
    }

    async fn debit(
        &self,
        user_id: UserId,
        order_ref: &str,
        amount: Points,
    ) -> Result<Withdrawal, LedgerError> {
        let reference = precheck_debit(order_ref, amount)?;

        let account = self.account(user_id).await;
        let mut acc = account.lock().await;
        if acc.balance.current < amount {
            return Err(LedgerError::InsufficientFunds {
                current: acc.balance.current,
                requested: amount,
            });
        }

        let withdrawn = acc
            .balance
            .withdrawn
            .checked_add(amount)
            .ok_or_else(|| anyhow!("withdrawn overflow for user {user_id}"))?;
        let withdrawal = Withdrawal {
            order: reference.to_string(),
            sum: amount,
            processed_at: Utc::now(),
        };

        acc.balance.current -= amount;
        acc.balance.withdrawn = withdrawn;
        acc.withdrawals.push(withdrawal.clone());
        Ok(withdrawal)
    }

    async fn balance(&self, user_id: UserId) -> Result<Balance, StoreError> {
        match self.existing_account(user_id).await {
            Some(account) => Ok(account.lock().await.balance),
            None => Ok(Balance::default()),
        }
    }

    async fn withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>, StoreError> {
        match self.existing_account(user_id).await {
            Some(account) => {
                let acc = account.lock().await;
                Ok(acc.withdrawals.iter().rev().cloned().collect())
            }
            None => Ok(Vec::new()),
        }
    }
}
