//! Rate-limited orders are re-checked after Retry-After, on virtual time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use loyal_accrual::{AccrualGateway, AccrualOutcome};
use loyal_db::{BalanceLedger, MemStorage, OrderStore};
use loyal_reconcile::{shutdown_channel, ReconcileConfig, Reconciler};
use loyal_schemas::{OrderStatus, Points};
use tokio::time::Instant;

const O1: &str = "4561261212345467";

/// Pops scripted answers per order; repeats the last one. Records call times.
struct ScriptedAuthority {
    answers: Mutex<HashMap<String, VecDeque<AccrualOutcome>>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedAuthority {
    fn new(script: Vec<(&str, Vec<AccrualOutcome>)>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(
                script
                    .into_iter()
                    .map(|(n, a)| (n.to_string(), a.into()))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_for(&self, number: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == number)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl AccrualGateway for ScriptedAuthority {
    async fn fetch_status(&self, number: &str) -> AccrualOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((number.to_string(), Instant::now()));
        let mut answers = self.answers.lock().unwrap();
        match answers.get_mut(number) {
            Some(q) if q.len() > 1 => q.pop_front().unwrap(),
            Some(q) => q.front().cloned().unwrap_or(AccrualOutcome::NotFound),
            None => AccrualOutcome::NotFound,
        }
    }
}

fn config() -> ReconcileConfig {
    ReconcileConfig {
        poll_interval: Duration::from_secs(10),
        max_in_flight: 8,
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limited_order_is_rechecked_and_credited_once() {
    let store = Arc::new(MemStorage::new());
    store.create_order(1, O1).await.unwrap();
    let authority = ScriptedAuthority::new(vec![(
        O1,
        vec![
            AccrualOutcome::RateLimited(Duration::from_secs(5)),
            AccrualOutcome::Processed(Points::whole(300)),
        ],
    )]);

    let (_trigger, shutdown) = shutdown_channel();
    let started = Instant::now();
    let handle = Reconciler::new(store.clone(), authority.clone(), config()).start(shutdown);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let order = store.order_by_number(O1).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(authority.calls_for(O1).len(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let order = store.order_by_number(O1).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(order.accrual, Points::whole(300));
    assert!(order.credited);

    let calls = authority.calls_for(O1);
    assert_eq!(calls.len(), 2);
    assert!(calls[1] - started >= Duration::from_secs(5));

    // Several more ticks: the terminal order is never polled again.
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(authority.calls_for(O1).len(), 2);
    assert_eq!(store.balance(1).await.unwrap().current, Points::whole(300));

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn recheck_defers_again_on_repeated_429() {
    let store = Arc::new(MemStorage::new());
    store.create_order(1, O1).await.unwrap();
    let authority = ScriptedAuthority::new(vec![(
        O1,
        vec![
            AccrualOutcome::RateLimited(Duration::from_secs(3)),
            AccrualOutcome::RateLimited(Duration::from_secs(3)),
            AccrualOutcome::Processed(Points::whole(40)),
        ],
    )]);

    let (_trigger, shutdown) = shutdown_channel();
    let handle = Reconciler::new(store.clone(), authority.clone(), config()).start(shutdown);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(authority.calls_for(O1).len(), 3);
    let order = store.order_by_number(O1).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(store.balance(1).await.unwrap().current, Points::whole(40));

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn tick_does_not_poll_order_with_pending_recheck() {
    let store = Arc::new(MemStorage::new());
    store.create_order(1, O1).await.unwrap();
    let authority = ScriptedAuthority::new(vec![(
        O1,
        vec![
            AccrualOutcome::RateLimited(Duration::from_secs(25)),
            AccrualOutcome::Processing,
        ],
    )]);

    let (_trigger, shutdown) = shutdown_channel();
    let handle = Reconciler::new(store.clone(), authority.clone(), config()).start(shutdown);

    // Ticks at 10s and 20s skip the order; the re-check at 25s polls it.
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(authority.calls_for(O1).len(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(authority.calls_for(O1).len(), 2);
    let order = store.order_by_number(O1).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Processing);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn zero_retry_after_still_waits_between_rechecks() {
    let store = Arc::new(MemStorage::new());
    store.create_order(1, O1).await.unwrap();
    let authority = ScriptedAuthority::new(vec![(O1, vec![AccrualOutcome::RateLimited(Duration::ZERO)])]);

    let (_trigger, shutdown) = shutdown_channel();
    let cfg = ReconcileConfig {
        poll_interval: Duration::from_secs(3600),
        max_in_flight: 8,
    };
    let handle = Reconciler::new(store.clone(), authority.clone(), cfg).start(shutdown);

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    let calls = authority.calls_for(O1);
    // One tick at t=0, then one re-check per second.
    assert_eq!(calls.len(), 11, "{calls:?}");
    for pair in calls.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(1));
    }

    handle.stop().await;
}
