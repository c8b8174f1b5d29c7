// Copyright 2024 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use sharedhash::*;

use std::time::Duration;

const KEYS: usize = 4096;

fn store() -> Store {
    Store::builder()
        .hash_power(16)
        .heap_size(64 * 1024 * 1024)
        .anonymous()
        .expect("failed to create store")
}

fn put_benchmark(c: &mut Criterion) {
    let store = store();
    let keys: Vec<String> = (0..KEYS).map(|i| format!("key-{i}")).collect();

    let mut group = c.benchmark_group("put");
    group.measurement_time(Duration::from_secs(2));
    group.throughput(Throughput::Elements(1));

    for value_len in [8, 64, 1024] {
        let value = vec![0xAB; value_len];
        let mut i = 0;
        group.bench_function(format!("{value_len} byte value"), |b| {
            b.iter(|| {
                let key = keys[i % KEYS].as_bytes();
                i += 1;
                store.put(key, &value, Duration::ZERO).expect("put failed");
            })
        });
    }
}

fn get_benchmark(c: &mut Criterion) {
    let store = store();
    let keys: Vec<String> = (0..KEYS).map(|i| format!("key-{i}")).collect();
    for key in &keys {
        store
            .put(key.as_bytes(), &[0xAB; 64], Duration::ZERO)
            .expect("put failed");
    }

    let mut group = c.benchmark_group("get");
    group.measurement_time(Duration::from_secs(2));
    group.throughput(Throughput::Elements(1));

    let mut i = 0;
    group.bench_function("hit", |b| {
        b.iter(|| {
            let key = keys[i % KEYS].as_bytes();
            i += 1;
            assert!(store.get(key).expect("get failed").is_some());
        })
    });

    group.bench_function("miss", |b| {
        b.iter(|| {
            assert!(store.get(b"missing").expect("get failed").is_none());
        })
    });
}

criterion_group!(benches, put_benchmark, get_benchmark);
criterion_main!(benches);
