//! Concurrent credits and debits against one user must serialize: the final
//! balance equals initial + credits - successful debits and never dips below
//! zero.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use loyal_db::{BalanceLedger, CreditOutcome, LedgerError, MemStorage, OrderStore};
use loyal_schemas::Points;

const REF: &str = "4561261212345467";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_credits_and_debits_conserve_points() {
    let store = Arc::new(MemStorage::new());
    let user = 42;
    store.credit(user, Points::whole(100)).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..200 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                store.credit(user, Points::whole(3)).await.map(|_| (3, 0))
            } else {
                match store.debit(user, REF, Points::whole(7)).await {
                    Ok(_) => Ok((0, 7)),
                    Err(LedgerError::InsufficientFunds { .. }) => Ok((0, 0)),
                    Err(e) => Err(e),
                }
            }
        }));
    }

    let mut credited = 0i64;
    let mut debited = 0i64;
    for res in join_all(tasks).await {
        let (c, d) = res.expect("task join").expect("ledger op");
        credited += c;
        debited += d;
    }

    let balance = store.balance(user).await.unwrap();
    assert_eq!(balance.current, Points::whole(100 + credited - debited));
    assert_eq!(balance.withdrawn, Points::whole(debited));
    assert!(!balance.current.is_negative());

    let log = store.withdrawals(user).await.unwrap();
    assert_eq!(log.len() as i64, debited / 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_debits_never_overdraw() {
    let store = Arc::new(MemStorage::new());
    let user = 9;
    store.credit(user, Points::whole(50)).await.unwrap();

    let tasks = (0..20).map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.debit(user, REF, Points::whole(10)).await })
    });

    let ok = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.expect("task join"))
        .filter(|r| r.is_ok())
        .count();

    assert_eq!(ok, 5);
    let balance = store.balance(user).await.unwrap();
    assert_eq!(balance.current, Points::ZERO);
    assert_eq!(balance.withdrawn, Points::whole(50));
}

/// Order credits from reconciliation race the owner's withdrawals. Each order
/// is credited by two competing callers, as when a tick and the credit sweep
/// overlap.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn order_credits_race_withdrawals() {
    let store = Arc::new(MemStorage::new());
    let user = 77;
    store.credit(user, Points::whole(20)).await.unwrap();

    let mut numbers = Vec::new();
    for i in 0..40u32 {
        let payload = format!("9000{i:04}");
        let digit = loyal_checksum::check_digit(&payload).unwrap();
        let number = format!("{payload}{digit}");
        store.create_order(user, &number).await.unwrap();
        store.settle_order(&number, Points::whole(5)).await.unwrap();
        numbers.push(number);
    }

    let credits = numbers
        .iter()
        .chain(numbers.iter())
        .map(|number| {
            let store = Arc::clone(&store);
            let number = number.clone();
            tokio::spawn(async move {
                let outcome = store.credit_order(&number).await;
                (number, outcome)
            })
        })
        .collect::<Vec<_>>();
    let debits = (0..60)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                match store.debit(user, REF, Points::whole(4)).await {
                    Ok(_) => Ok(4i64),
                    Err(LedgerError::InsufficientFunds { .. }) => Ok(0),
                    Err(e) => Err(e),
                }
            })
        })
        .collect::<Vec<_>>();
    let observer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for _ in 0..200 {
                let b = store.balance(user).await.unwrap();
                assert!(!b.current.is_negative(), "balance went negative: {b:?}");
                tokio::task::yield_now().await;
            }
        })
    };

    let mut credits_per_order: HashMap<String, usize> = HashMap::new();
    for res in join_all(credits).await {
        let (number, outcome) = res.expect("task join");
        match outcome.expect("credit_order") {
            CreditOutcome::Credited { user_id, amount, .. } => {
                assert_eq!(user_id, user);
                assert_eq!(amount, Points::whole(5));
                *credits_per_order.entry(number).or_default() += 1;
            }
            CreditOutcome::AlreadyCredited => {}
            other => panic!("unexpected credit outcome {other:?}"),
        }
    }
    let debited: i64 = join_all(debits)
        .await
        .into_iter()
        .map(|r| r.expect("task join").expect("debit"))
        .sum();
    observer.await.expect("observer");

    // Exactly one of the two callers credited each order.
    assert_eq!(credits_per_order.len(), numbers.len());
    assert!(credits_per_order.values().all(|&n| n == 1));
    for number in &numbers {
        let order = store.order_by_number(number).await.unwrap().unwrap();
        assert!(order.credited, "{number} not credited");
    }
    assert!(store.uncredited_orders().await.unwrap().is_empty());

    let balance = store.balance(user).await.unwrap();
    assert_eq!(balance.current, Points::whole(20 + 40 * 5 - debited));
    assert_eq!(balance.withdrawn, Points::whole(debited));
    assert!(!balance.current.is_negative());
}
