//! Micro-benchmarks for the hot engine paths.

use criterion::{Criterion, criterion_group, criterion_main};
use tempfile::TempDir;

use concordkv::btree::BTreeEngine;
use concordkv::engine::StorageEngine;
use concordkv::lsm::{LsmConfig, LsmTree};

fn bench_btree_put_get(c: &mut Criterion) {
    let engine = BTreeEngine::new();
    for i in 0..10_000u32 {
        engine
            .put(format!("key-{i:08}").as_bytes(), b"value")
            .unwrap();
    }

    let mut i = 0u32;
    c.bench_function("btree_put", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            engine
                .put(format!("key-{:08}", i % 20_000).as_bytes(), b"value")
                .unwrap();
        })
    });

    let mut j = 0u32;
    c.bench_function("btree_get", |b| {
        b.iter(|| {
            j = j.wrapping_add(7);
            engine
                .get(format!("key-{:08}", j % 10_000).as_bytes())
                .unwrap()
        })
    });
}

fn bench_lsm_put_get(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let tree = LsmTree::open(
        tmp.path(),
        LsmConfig {
            sync_writes: false,
            ..LsmConfig::default()
        },
    )
    .unwrap();
    for i in 0..10_000u32 {
        tree.put(format!("key-{i:08}").as_bytes(), b"value").unwrap();
    }

    let mut i = 0u32;
    c.bench_function("lsm_put", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            tree.put(format!("key-{:08}", i % 20_000).as_bytes(), b"value")
                .unwrap();
        })
    });

    let mut j = 0u32;
    c.bench_function("lsm_get", |b| {
        b.iter(|| {
            j = j.wrapping_add(7);
            tree.get(format!("key-{:08}", j % 10_000).as_bytes())
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_btree_put_get, bench_lsm_put_get);
criterion_main!(benches);
