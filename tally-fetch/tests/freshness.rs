//! Stale-while-revalidate behavior.

use std::time::Duration;

use tally_core::{KeyPattern, KeyPredicate, OperationName, OperationPolicy, ReadSource};
use tally_fetch::{CacheConfig, CacheKey, FetchCache};
use tally_test_utils::fixtures::{entity_params, LIST_VOUCHERS};
use tally_test_utils::{eventually, CountingExecutor};

fn cache_with(executor: &CountingExecutor<String>, ttl: Duration) -> FetchCache<String> {
    let cache = FetchCache::new(CacheConfig::default()).unwrap();
    cache.configure(LIST_VOUCHERS, OperationPolicy::new(ttl)).unwrap();
    cache.register_executor(LIST_VOUCHERS, executor.clone()).unwrap();
    cache
}

#[tokio::test]
async fn test_stale_read_triggers_exactly_one_refresh() {
    let executor = CountingExecutor::echo().gated();
    let cache = cache_with(&executor, Duration::from_secs(60));
    let key = CacheKey::new(LIST_VOUCHERS, entity_params("E1")).unwrap();

    executor.open_gate(1);
    cache.fetch(LIST_VOUCHERS, entity_params("E1")).await.unwrap();
    let op = OperationName::new(LIST_VOUCHERS).unwrap();
    assert_eq!(cache.expire(&KeyPredicate::Operation(op)), 1);

    let first = cache.fetch_read(LIST_VOUCHERS, entity_params("E1")).await.unwrap();
    let second = cache.fetch_read(LIST_VOUCHERS, entity_params("E1")).await.unwrap();
    for read in [&first, &second] {
        assert_eq!(read.source(), ReadSource::StaleHit);
        assert!(read.is_stale());
        assert_eq!(read.value().as_str(), "{entity=E1}#1");
    }
    assert!(cache.is_in_flight(&key));

    executor.open_gate(1);
    eventually(|| {
        cache
            .store()
            .peek(&key)
            .is_some_and(|entry| entry.value().as_str() == "{entity=E1}#2")
    })
    .await;
    eventually(|| !cache.is_in_flight(&key)).await;
    assert_eq!(executor.calls(), 2);

    let third = cache.fetch_read(LIST_VOUCHERS, entity_params("E1")).await.unwrap();
    assert_eq!(third.source(), ReadSource::FreshHit);
    assert_eq!(third.value().as_str(), "{entity=E1}#2");
}

#[tokio::test]
async fn test_ttl_expiry_serves_stale_then_fresh() {
    let executor = CountingExecutor::echo();
    let cache = cache_with(&executor, Duration::from_millis(20));
    let key = CacheKey::new(LIST_VOUCHERS, entity_params("E1")).unwrap();

    cache.fetch(LIST_VOUCHERS, entity_params("E1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let read = cache.fetch_read(LIST_VOUCHERS, entity_params("E1")).await.unwrap();
    assert_eq!(read.source(), ReadSource::StaleHit);
    assert!(read.staleness() >= Duration::from_millis(20));

    eventually(|| executor.calls() == 2 && !cache.is_in_flight(&key)).await;
    let stats = cache.stats().cache;
    assert_eq!(stats.stale_hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_expire_pattern_scopes_to_context() {
    let executor = CountingExecutor::echo();
    let cache = cache_with(&executor, Duration::from_secs(60));

    cache.fetch(LIST_VOUCHERS, entity_params("E1")).await.unwrap();
    cache.fetch(LIST_VOUCHERS, entity_params("E2")).await.unwrap();

    let marked = cache
        .expire_pattern(
            &KeyPattern::exact(LIST_VOUCHERS).bind("entity"),
            &entity_params("E2"),
        )
        .unwrap();
    assert_eq!(marked, 1);

    let e1 = cache.fetch_read(LIST_VOUCHERS, entity_params("E1")).await.unwrap();
    let e2 = cache.fetch_read(LIST_VOUCHERS, entity_params("E2")).await.unwrap();
    assert_eq!(e1.source(), ReadSource::FreshHit);
    assert_eq!(e2.source(), ReadSource::StaleHit);
}
