//! Idempotency guard concurrency tests

use futures::future::join_all;
use orderguard::processing::{IdempotencyGuard, InMemoryIdempotencyGuard};
use proptest::prelude::*;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_check_and_mark_yields_single_winner() {
    let guard = Arc::new(InMemoryIdempotencyGuard::new());

    let tasks = (0..64).map(|_| {
        let guard = guard.clone();
        tokio::spawn(async move { guard.check_and_mark("order-1") })
    });

    let results: Vec<bool> = join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|first| **first).count(), 1);
    assert_eq!(guard.processed_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_ids_are_independent() {
    let guard = Arc::new(InMemoryIdempotencyGuard::new());

    let tasks = (0..32).flat_map(|i| {
        (0..4).map({
            let guard = guard.clone();
            move |_| {
                let guard = guard.clone();
                tokio::spawn(async move { guard.check_and_mark(&format!("order-{i}")) })
            }
        })
    });

    let winners = join_all(tasks)
        .await
        .into_iter()
        .filter(|result| matches!(result, Ok(true)))
        .count();

    assert_eq!(winners, 32);
    assert_eq!(guard.processed_count(), 32);
}

proptest! {
    #[test]
    fn prop_only_first_sighting_wins(ids in proptest::collection::vec("[a-z0-9-]{1,12}", 1..50)) {
        let guard = InMemoryIdempotencyGuard::new();
        let mut seen = std::collections::HashSet::new();

        for id in &ids {
            prop_assert_eq!(guard.check_and_mark(id), seen.insert(id.clone()));
        }
        prop_assert_eq!(guard.processed_count(), seen.len());
    }
}
