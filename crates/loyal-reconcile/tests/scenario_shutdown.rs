//! Stopping the reconciler with deferred re-checks still sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use loyal_accrual::{AccrualGateway, AccrualOutcome};
use loyal_db::{MemStorage, OrderStore};
use loyal_reconcile::{shutdown_channel, ReconcileConfig, Reconciler};
use loyal_schemas::OrderStatus;

/// Always asks the caller to come back in an hour.
#[derive(Default)]
struct AlwaysLimited {
    calls: AtomicUsize,
}

#[async_trait]
impl AccrualGateway for AlwaysLimited {
    async fn fetch_status(&self, _number: &str) -> AccrualOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        AccrualOutcome::RateLimited(Duration::from_secs(3600))
    }
}

async fn store_with_orders() -> Arc<MemStorage> {
    let store = Arc::new(MemStorage::new());
    store.create_order(1, "4561261212345467").await.unwrap();
    store.create_order(2, "18").await.unwrap();
    store
}

#[tokio::test(start_paused = true)]
async fn stop_returns_promptly_with_pending_recheck() {
    let store = store_with_orders().await;
    let authority = Arc::new(AlwaysLimited::default());
    let (_trigger, shutdown) = shutdown_channel();

    let handle =
        Reconciler::new(store.clone(), authority.clone(), ReconcileConfig::default()).start(shutdown);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(authority.calls.load(Ordering::SeqCst), 2);

    let before = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(1), handle.stop())
        .await
        .expect("stop should not wait for the re-check delay");
    assert!(tokio::time::Instant::now() - before < Duration::from_secs(1));

    let order = store.order_by_number("18").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::New);
}

#[tokio::test(start_paused = true)]
async fn external_shutdown_ends_the_task() {
    let store = store_with_orders().await;
    let authority = Arc::new(AlwaysLimited::default());
    let (trigger, shutdown) = shutdown_channel();

    let handle = Reconciler::new(store, authority.clone(), ReconcileConfig::default()).start(shutdown);
    tokio::time::sleep(Duration::from_secs(1)).await;

    trigger.trigger();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(handle.is_finished());

    // No further polling once stopped, even after the re-check delay.
    tokio::time::sleep(Duration::from_secs(7200)).await;
    assert_eq!(authority.calls.load(Ordering::SeqCst), 2);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_releases_recheck_slots_for_a_restart() {
    let store = store_with_orders().await;
    let authority = Arc::new(AlwaysLimited::default());
    let reconciler = Reconciler::new(store, authority.clone(), ReconcileConfig::default());
    let spare = reconciler.clone();

    let (_trigger, shutdown) = shutdown_channel();
    let handle = reconciler.start(shutdown);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(spare.pending_rechecks().await, 2);

    handle.stop().await;
    assert_eq!(spare.pending_rechecks().await, 0);

    // The first tick of the restarted loop polls both orders again.
    let (_trigger, shutdown) = shutdown_channel();
    let handle = spare.start(shutdown);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(authority.calls.load(Ordering::SeqCst), 4);

    handle.stop().await;
}
