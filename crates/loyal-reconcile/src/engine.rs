use std::collections::HashSet;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use loyal_accrual::{AccrualGateway, AccrualOutcome};
use loyal_db::{BalanceLedger, CreditOutcome, OrderStore, StatusChange, Storage, StoreError};
use loyal_schemas::{Order, OrderStatus, Points};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::{OrderAction, OrderReport, ReconcileConfig, ReconcileEvent, TickReport};

/// Polls the accrual authority and applies its answers to storage.
///
/// Cheap to clone; clones share the storage, gateway, event channel and the
/// set of pending deferred re-checks.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Storage>,
    gateway: Arc<dyn AccrualGateway>,
    cfg: ReconcileConfig,
    events: Option<broadcast::Sender<ReconcileEvent>>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Storage>,
        gateway: Arc<dyn AccrualGateway>,
        cfg: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            cfg,
            events: None,
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Publish status changes, credits and tick reports on `tx`.
    pub fn with_events(mut self, tx: broadcast::Sender<ReconcileEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.cfg
    }

    fn publish(&self, event: ReconcileEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }

    /// Credit every PROCESSED order whose accrual was never applied.
    /// Returns how many were credited by this call.
    pub async fn sweep_credits(&self) -> Result<usize, StoreError> {
        let mut credited = 0;
        for order in self.store.uncredited_orders().await? {
            match self.store.credit_order(&order.number).await {
                Ok(CreditOutcome::Credited {
                    user_id, amount, ..
                }) => {
                    warn!(order = %order.number, user_id, amount = %amount, "credited settled order missed earlier");
                    self.publish(ReconcileEvent::Credited {
                        number: order.number.clone(),
                        user_id,
                        amount,
                    });
                    credited += 1;
                }
                Ok(_) => {}
                Err(e) => error!(order = %order.number, error = %e, "credit sweep failed for order"),
            }
        }
        Ok(credited)
    }

    /// One full pass: credit sweep, then every outstanding order.
    pub async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.sweep_credits().await {
            Ok(n) => report.swept = n,
            Err(e) => error!(error = %e, "credit sweep failed"),
        }

        let orders = match self.store.outstanding_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                error!(error = %e, "listing outstanding orders failed; skipping tick");
                report.listing_failed = true;
                return report;
            }
        };

        report.orders = stream::iter(orders)
            .map(|order| async move {
                let action = if self.pending.lock().await.contains(&order.number) {
                    OrderAction::Skipped
                } else {
                    self.reconcile_order(&order).await
                };
                OrderReport {
                    number: order.number,
                    action,
                }
            })
            .buffer_unordered(self.cfg.max_in_flight.max(1))
            .collect()
            .await;

        if report.is_quiet() {
            debug!(orders = report.orders.len(), "reconcile tick: nothing changed");
        } else {
            info!(
                orders = report.orders.len(),
                swept = report.swept,
                advanced = report.advanced(),
                settled = report.settled(),
                deferred = report.deferred(),
                failed = report.failed(),
                "reconcile tick"
            );
        }
        self.publish(ReconcileEvent::Tick(report.clone()));
        report
    }

    /// Poll the authority for one order and apply the answer.
    pub async fn reconcile_order(&self, order: &Order) -> OrderAction {
        if order.status.is_terminal() {
            return OrderAction::Skipped;
        }
        let outcome = self.gateway.fetch_status(&order.number).await;
        match self.apply(order, outcome).await {
            Ok(action) => action,
            Err(e) => {
                error!(order = %order.number, error = %e, "applying accrual outcome failed");
                OrderAction::failed(e)
            }
        }
    }

    /// Re-read `number` and reconcile it unless it has reached a terminal
    /// status in the meantime.
    pub async fn recheck(&self, number: &str) -> OrderAction {
        match self.store.order_by_number(number).await {
            Ok(Some(order)) => self.reconcile_order(&order).await,
            Ok(None) => {
                warn!(order = %number, "deferred re-check: order disappeared");
                OrderAction::Skipped
            }
            Err(e) => {
                error!(order = %number, error = %e, "deferred re-check: reading order failed");
                OrderAction::failed(e)
            }
        }
    }

    async fn apply(&self, order: &Order, outcome: AccrualOutcome) -> Result<OrderAction, StoreError> {
        let number = order.number.as_str();
        match outcome {
            AccrualOutcome::Registered => self.advance(order, OrderStatus::New).await,
            AccrualOutcome::Processing => self.advance(order, OrderStatus::Processing).await,
            AccrualOutcome::Invalid => self.advance(order, OrderStatus::Invalid).await,
            AccrualOutcome::Processed(accrual) => self.settle(order, accrual).await,
            AccrualOutcome::NotFound => {
                warn!(order = %number, "order unknown to accrual authority");
                Ok(OrderAction::Unchanged)
            }
            AccrualOutcome::RateLimited(after) => {
                warn!(order = %number, retry_after_secs = after.as_secs(), "accrual authority rate limited");
                Ok(OrderAction::deferred(after))
            }
            AccrualOutcome::TransportError(reason) => {
                error!(order = %number, %reason, "accrual authority request failed");
                Ok(OrderAction::Failed { reason })
            }
        }
    }

    async fn advance(&self, order: &Order, target: OrderStatus) -> Result<OrderAction, StoreError> {
        let number = order.number.as_str();
        Ok(match self.store.advance_status(number, target).await? {
            StatusChange::Applied { from, to } => {
                info!(order = %number, %from, %to, "order status advanced");
                self.publish(ReconcileEvent::StatusChanged {
                    number: number.to_string(),
                    user_id: order.user_id,
                    from,
                    to,
                });
                OrderAction::Advanced { from, to }
            }
            StatusChange::Unchanged => OrderAction::Unchanged,
            StatusChange::Refused { current } => {
                debug!(order = %number, %current, requested = %target, "ignoring backward status");
                OrderAction::Unchanged
            }
            StatusChange::Missing => OrderAction::Skipped,
        })
    }

    async fn settle(&self, order: &Order, accrual: Points) -> Result<OrderAction, StoreError> {
        let number = order.number.as_str();
        let settled_now = match self.store.settle_order(number, accrual).await? {
            StatusChange::Applied { from, to } => {
                info!(order = %number, %from, accrual = %accrual, "order processed");
                self.publish(ReconcileEvent::StatusChanged {
                    number: number.to_string(),
                    user_id: order.user_id,
                    from,
                    to,
                });
                true
            }
            // Already PROCESSED: fall through so a missed credit is applied.
            StatusChange::Unchanged => false,
            StatusChange::Refused { current } => {
                warn!(order = %number, %current, "PROCESSED answer for a terminal order ignored");
                return Ok(OrderAction::Unchanged);
            }
            StatusChange::Missing => return Ok(OrderAction::Skipped),
        };

        match self.store.credit_order(number).await {
            Ok(CreditOutcome::Credited {
                user_id,
                amount,
                balance,
            }) => {
                info!(order = %number, user_id, amount = %amount, current = %balance.current, "accrual credited");
                self.publish(ReconcileEvent::Credited {
                    number: number.to_string(),
                    user_id,
                    amount,
                });
                Ok(OrderAction::Credited { user_id, amount })
            }
            Ok(_) if settled_now => Ok(OrderAction::Settled { accrual }),
            Ok(_) => Ok(OrderAction::Unchanged),
            Err(e) if settled_now => {
                error!(order = %number, error = %e, "credit after settlement failed; sweep will retry");
                Ok(OrderAction::Settled { accrual })
            }
            Err(e) => Err(e),
        }
    }

    /// Claim the deferred re-check slot for `number`. False if one is
    /// already pending.
    pub(crate) async fn claim_recheck(&self, number: &str) -> bool {
        self.pending.lock().await.insert(number.to_string())
    }

    pub(crate) async fn release_recheck(&self, number: &str) {
        self.pending.lock().await.remove(number);
    }

    /// Drop every claimed slot. Called once the re-check tasks are reaped.
    pub(crate) async fn clear_rechecks(&self) {
        self.pending.lock().await.clear();
    }

    /// Number of orders with a deferred re-check in flight.
    pub async fn pending_rechecks(&self) -> usize {
        self.pending.lock().await.len()
    }
}
