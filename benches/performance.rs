//! Performance benchmarks for the live store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use livestore::{MetaPatch, Store, StoreConfig, SubscriptionRegistry, Timestamp};
use serde_json::json;
use std::time::Duration;

fn filled_store(entries: usize) -> Store {
    let store = Store::new(StoreConfig::default());
    for i in 0..entries {
        store.set(
            &format!("rooms.r{}.members.m{}", i % 100, i),
            json!({"name": format!("member {}", i), "online": i % 2 == 0}),
        );
    }
    store
}

/// Benchmark writes of fresh values and touches of equal ones
fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set");

    group.bench_function("fresh_value", |b| {
        let store = Store::new(StoreConfig::default());
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            store.set(black_box("counter.value"), json!(i));
        });
    });

    group.bench_function("touch", |b| {
        let store = Store::new(StoreConfig::default());
        let value = json!({"nested": {"list": [1, 2, 3], "flag": true}});
        store.set("doc", value.clone());
        b.iter(|| store.set(black_box("doc"), value.clone()));
    });

    group.finish();
}

/// Benchmark reads with varying tree sizes
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    for entries in [100, 1_000, 10_000] {
        let store = filled_store(entries);
        group.bench_with_input(BenchmarkId::new("leaf", entries), &store, |b, store| {
            b.iter(|| store.get(black_box("rooms.r7.members.m7.name")));
        });
        group.bench_with_input(BenchmarkId::new("keys", entries), &store, |b, store| {
            b.iter(|| store.get(black_box("rooms.r7.members$keys")));
        });
    }

    group.finish();
}

/// Benchmark a sweep that expires half of the entries
fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");
    group.sample_size(20);

    for entries in [1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(entries), &entries, |b, &n| {
            b.iter_with_setup(
                || {
                    let store = filled_store(n / 2);
                    for i in 0..n / 2 {
                        store.set_with_meta(
                            &format!("expired.e{}", i),
                            json!(i),
                            MetaPatch::expires_at(Timestamp(1)),
                        );
                    }
                    store
                },
                |store| black_box(store.sweep()),
            );
        });
    }

    group.finish();
}

/// Benchmark immediate notification fan-out
fn bench_notify(c: &mut Criterion) {
    let mut group = c.benchmark_group("notify");

    for listeners in [1, 10, 100] {
        let registry = SubscriptionRegistry::new(Duration::from_millis(10));
        for _ in 0..listeners {
            registry.subscribe("feed", |value| {
                black_box(value);
            });
        }
        let value = json!({"n": 1});
        group.bench_with_input(
            BenchmarkId::new("listeners", listeners),
            &registry,
            |b, registry| {
                b.iter(|| registry.notify(black_box("feed"), Some(&value)));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_set, bench_get, bench_sweep, bench_notify);
criterion_main!(benches);
