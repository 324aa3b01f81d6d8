//! Postgres storage.
//!
//! Amounts are stored as BIGINT micros. Status mutations lock the order row
//! and decide the move with [`OrderStatus::transition`], so the state machine
//! is not duplicated in SQL. Balance mutations lock the balance row.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use loyal_schemas::{Balance, Order, OrderStatus, Points, Transition, UserId, Withdrawal};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{
    precheck_credit, precheck_debit, BalanceLedger, CreateOrder, CreditOutcome, LedgerError,
    OrderStore, StatusChange, StoreError,
};

/// Database URL variable read by [`connect_from_env`] and the DB scenario tests.
pub const ENV_DB_URL: &str = "LOYAL_DATABASE_URL";

const ORDER_COLUMNS: &str = "number, user_id, status, accrual_micros, credited, uploaded_at";

/// Connect to Postgres.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect to Postgres using `LOYAL_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Transactional storage backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_orders(&self, filter: &str, what: &'static str) -> Result<Vec<Order>> {
        let sql = format!("select {ORDER_COLUMNS} from orders {filter}");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("{what} failed"))?;
        rows.iter().map(order_from_row).collect()
    }

    async fn balance_in(&self, tx: &mut Transaction<'_, Postgres>, user_id: UserId) -> Result<Balance> {
        let row = sqlx::query(
            "select current_micros, withdrawn_micros from balances where user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .context("balance read failed")?;
        Ok(Balance {
            current: Points::new(row.try_get("current_micros")?),
            withdrawn: Points::new(row.try_get("withdrawn_micros")?),
        })
    }
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        number: row.try_get("number")?,
        user_id: row.try_get("user_id")?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid order status in db: {status}"))?,
        accrual: Points::new(row.try_get("accrual_micros")?),
        credited: row.try_get("credited")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

/// Lock an order row for the rest of the transaction.
async fn lock_order(tx: &mut Transaction<'_, Postgres>, number: &str) -> Result<Option<Order>> {
    let sql = format!("select {ORDER_COLUMNS} from orders where number = $1 for update");
    let row = sqlx::query(&sql)
        .bind(number)
        .fetch_optional(&mut **tx)
        .await
        .context("lock order failed")?;
    row.as_ref().map(order_from_row).transpose()
}

/// Ensure the balance row exists, then lock it.
async fn lock_balance(tx: &mut Transaction<'_, Postgres>, user_id: UserId) -> Result<Balance> {
    sqlx::query("insert into balances (user_id) values ($1) on conflict (user_id) do nothing")
        .bind(user_id)
        .execute(&mut **tx)
        .await
        .context("ensure balance row failed")?;

    let row = sqlx::query(
        r#"
        select current_micros, withdrawn_micros
        from balances
        where user_id = $1
        for update
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await
    .context("lock balance failed")?;

    Ok(Balance {
        current: Points::new(row.try_get("current_micros")?),
        withdrawn: Points::new(row.try_get("withdrawn_micros")?),
    })
}

/// Add `amount` to a locked balance row and return the new totals.
async fn add_to_balance(
    tx: &mut Transaction<'_, Postgres>,
    user_id: UserId,
    amount: Points,
) -> Result<Balance> {
    let row = sqlx::query(
        r#"
        update balances
        set current_micros = current_micros + $2
        where user_id = $1
        returning current_micros, withdrawn_micros
        "#,
    )
    .bind(user_id)
    .bind(amount.micros())
    .fetch_one(&mut **tx)
    .await
    .context("credit balance failed")?;

    Ok(Balance {
        current: Points::new(row.try_get("current_micros")?),
        withdrawn: Points::new(row.try_get("withdrawn_micros")?),
    })
}

#[async_trait]
impl OrderStore for PgStorage {
    async fn create_order(&self, user_id: UserId, number: &str) -> Result<CreateOrder, StoreError> {
        let sql = format!(
            r#"
            insert into orders (number, user_id, status)
            values ($1, $2, 'NEW')
            on conflict (number) do nothing
            returning {ORDER_COLUMNS}
            "#
        );
        let inserted = sqlx::query(&sql)
            .bind(number)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("create_order insert failed")?;

        if let Some(row) = inserted {
            return Ok(CreateOrder::Created(order_from_row(&row)?));
        }

        // Lost the insert to an existing row; report who owns it.
        let existing = self
            .order_by_number(number)
            .await?
            .ok_or_else(|| anyhow!("order {number} conflicted on insert but is missing"))?;
        Ok(if existing.user_id == user_id {
            CreateOrder::AlreadyOwned(existing)
        } else {
            CreateOrder::OwnedByOther {
                owner: existing.user_id,
            }
        })
    }

    async fn order_by_number(&self, number: &str) -> Result<Option<Order>, StoreError> {
        let sql = format!("select {ORDER_COLUMNS} from orders where number = $1");
        let row = sqlx::query(&sql)
            .bind(number)
            .fetch_optional(&self.pool)
            .await
            .context("order_by_number failed")?;
        Ok(row.as_ref().map(order_from_row).transpose()?)
    }

    async fn orders_by_user(&self, user_id: UserId) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "select {ORDER_COLUMNS} from orders where user_id = $1 order by uploaded_at desc, number desc"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("orders_by_user failed")?;
        Ok(rows.iter().map(order_from_row).collect::<Result<Vec<_>>>()?)
    }

    async fn outstanding_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .fetch_orders(
                "where status in ('NEW', 'PROCESSING') order by uploaded_at",
                "outstanding_orders",
            )
            .await?)
    }

    async fn uncredited_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .fetch_orders(
                "where status = 'PROCESSED' and not credited order by uploaded_at",
                "uncredited_orders",
            )
            .await?)
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

        let mut tx = self.pool.begin().await.context("advance_status begin failed")?;
        let Some(order) = lock_order(&mut tx, number).await? else {
            return Ok(StatusChange::Missing);
        };

        let change = match order.status.transition(status) {
            Transition::Unchanged => StatusChange::Unchanged,
            Transition::Refused => StatusChange::Refused {
                current: order.status,
            },
            Transition::Forward => {
                sqlx::query("update orders set status = $2 where number = $1")
                    .bind(number)
                    .bind(status.as_str())
                    .execute(&mut *tx)
                    .await
                    .context("advance_status update failed")?;
                StatusChange::Applied {
                    from: order.status,
                    to: status,
                }
            }
        };

        tx.commit().await.context("advance_status commit failed")?;
        Ok(change)
    }

    async fn settle_order(
        &self,
        number: &str,
        accrual: Points,
    ) -> Result<StatusChange, StoreError> {
        if accrual.is_negative() {
            return Err(StoreError::InvalidRequest("accrual must not be negative"));
        }

        let mut tx = self.pool.begin().await.context("settle_order begin failed")?;
        let Some(order) = lock_order(&mut tx, number).await? else {
            return Ok(StatusChange::Missing);
        };

        let change = match order.status.transition(OrderStatus::Processed) {
            Transition::Unchanged => StatusChange::Unchanged,
            Transition::Refused => StatusChange::Refused {
                current: order.status,
            },
            Transition::Forward => {
                sqlx::query(
                    r#"
                    update orders
                    set status = 'PROCESSED',
                        accrual_micros = $2
                    where number = $1
                    "#,
                )
                .bind(number)
                .bind(accrual.micros())
                .execute(&mut *tx)
                .await
                .context("settle_order update failed")?;
                StatusChange::Applied {
                    from: order.status,
                    to: OrderStatus::Processed,
                }
            }
        };

        tx.commit().await.context("settle_order commit failed")?;
        Ok(change)
    }
}

#[async_trait]
impl BalanceLedger for PgStorage {
    async fn credit(&self, user_id: UserId, amount: Points) -> Result<Balance, LedgerError> {
        precheck_credit(amount)?;

        let mut tx = self.pool.begin().await.context("credit begin failed")?;
        lock_balance(&mut tx, user_id).await?;
        let balance = add_to_balance(&mut tx, user_id, amount).await?;
        tx.commit().await.context("credit commit failed")?;
        Ok(balance)
    }

    async fn credit_order(&self, number: &str) -> Result<CreditOutcome, StoreError> {
        let mut tx = self.pool.begin().await.context("credit_order begin failed")?;

        let Some(order) = lock_order(&mut tx, number).await? else {
            return Ok(CreditOutcome::Missing);
        };
        if order.credited {
            return Ok(CreditOutcome::AlreadyCredited);
        }
        if order.status != OrderStatus::Processed {
            return Ok(CreditOutcome::NotSettled);
        }

        lock_balance(&mut tx, order.user_id).await?;
        let balance = if order.accrual.is_positive() {
            add_to_balance(&mut tx, order.user_id, order.accrual).await?
        } else {
            self.balance_in(&mut tx, order.user_id).await?
        };

        sqlx::query("update orders set credited = true where number = $1")
            .bind(number)
            .execute(&mut *tx)
            .await
            .context("credit_order mark credited failed")?;

        tx.commit().await.context("credit_order commit failed")?;
        debug!(order = %number, user_id = order.user_id, amount = %order.accrual, "order credited");

        Ok(CreditOutcome::Credited {
            user_id: order.user_id,
            amount: order.accrual,
            balance,
        })
    }

    async fn debit(
        &self,
        user_id: UserId,
        order_ref: &str,
        amount: Points,
    ) -> Result<Withdrawal, LedgerError> {
        let reference = precheck_debit(order_ref, amount)?;

        let mut tx = self.pool.begin().await.context("debit begin failed")?;
        let current = lock_balance(&mut tx, user_id).await?;
        if current.current < amount {
            // Dropping the transaction rolls it back.
            return Err(LedgerError::InsufficientFunds {
                current: current.current,
                requested: amount,
            });
        }

        sqlx::query(
            r#"
            update balances
            set current_micros = current_micros - $2,
                withdrawn_micros = withdrawn_micros + $2
            where user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(amount.micros())
        .execute(&mut *tx)
        .await
        .context("debit balance update failed")?;

        let row = sqlx::query(
            r#"
            insert into withdrawals (user_id, order_number, sum_micros)
            values ($1, $2, $3)
            returning processed_at
            "#,
        )
        .bind(user_id)
        .bind(reference)
        .bind(amount.micros())
        .fetch_one(&mut *tx)
        .await
        .context("debit withdrawal insert failed")?;
        let processed_at = row.try_get("processed_at").context("decode processed_at")?;

        tx.commit().await.context("debit commit failed")?;

        Ok(Withdrawal {
            order: reference.to_string(),
            sum: amount,
            processed_at,
        })
    }

    async fn balance(&self, user_id: UserId) -> Result<Balance, StoreError> {
        let row = sqlx::query(
            "select current_micros, withdrawn_micros from balances where user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("balance query failed")?;

        let Some(row) = row else {
            return Ok(Balance::default());
        };
        Ok(Balance {
            current: Points::new(row.try_get("current_micros").context("decode current")?),
            withdrawn: Points::new(row.try_get("withdrawn_micros").context("decode withdrawn")?),
        })
    }

    async fn withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>, StoreError> {
        let rows = sqlx::query(
            r#"
            select order_number, sum_micros, processed_at
            from withdrawals
            where user_id = $1
            order by processed_at desc, id desc
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("withdrawals query failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Withdrawal {
                order: row.try_get("order_number").context("decode order_number")?,
                sum: Points::new(row.try_get("sum_micros").context("decode sum_micros")?),
                processed_at: row.try_get("processed_at").context("decode processed_at")?,
            });
        }
        Ok(out)
    }
}

