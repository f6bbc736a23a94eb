use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{CacheKey, KeyPredicate, OperationName, Params};
use tally_storage::CacheStore;

fn voucher_key(entity: u32) -> CacheKey {
    let params = Params::builder()
        .param("entity", format!("E{}", entity))
        .param("page", 1i64)
        .build()
        .expect("build params");
    CacheKey::new("list-vouchers", params).expect("build key")
}

fn populated_store(entries: u32) -> CacheStore<Vec<String>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("build runtime");
    let store = CacheStore::new(Duration::from_secs(600));
    runtime.block_on(async {
        for i in 0..entries {
            store
                .put(voucher_key(i), Arc::new(vec![format!("V-{}", i)]), Duration::from_secs(60))
                .await;
        }
    });
    store
}

fn bench_store_get(c: &mut Criterion) {
    let store = populated_store(1_000);
    let hit = voucher_key(500);
    let miss = voucher_key(5_000);

    c.bench_function("store/get_hit", |b| {
        b.iter(|| black_box(store.get(black_box(&hit))));
    });
    c.bench_function("store/get_miss", |b| {
        b.iter(|| black_box(store.get(black_box(&miss))));
    });
}

fn bench_store_invalidate(c: &mut Criterion) {
    let op = OperationName::new("list-vouchers").expect("operation name");

    c.bench_function("store/delete_operation_1k", |b| {
        b.iter_batched(
            || populated_store(1_000),
            |store| black_box(store.delete(&KeyPredicate::Operation(op.clone()))),
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_store_get, bench_store_invalidate);
criterion_main!(benches);
