//! Adaptive fanout, hot-leaf cache, and the batch interface.

use crate::btree::{BTreeBatchReply, BTreeConfig, BTreeEngine, ORDER_MIN};
use crate::engine::{EngineError, StorageEngine};

#[test]
fn batch_sorts_and_replays_under_one_lock() {
    let engine = BTreeEngine::with_config(BTreeConfig {
        order: 4,
        adaptive: false,
        ..BTreeConfig::default()
    });
    engine.put(b"existing", b"old").unwrap();

    let mut batch = engine.batch();
    batch.put(b"zeta", b"1").unwrap();
    batch.put(b"alpha", b"2").unwrap();
    batch.delete(b"existing").unwrap();
    batch.get(b"alpha").unwrap();
    let replies = batch.execute().unwrap();

    // Replies follow the sorted key order: alpha(put), alpha(get)… the
    // stable sort keeps same-key submission order.
    assert_eq!(replies.len(), 4);
    assert!(replies.contains(&BTreeBatchReply::Removed { existed: true }));
    assert!(replies.contains(&BTreeBatchReply::Value(Some(b"2".to_vec()))));

    assert_eq!(engine.get(b"zeta").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"existing").unwrap(), None);
}

#[test]
fn batch_rejects_overflow() {
    let engine = BTreeEngine::with_config(BTreeConfig {
        max_batch_ops: 2,
        ..BTreeConfig::default()
    });
    let mut batch = engine.batch();
    batch.put(b"a", b"1").unwrap();
    batch.put(b"b", b"2").unwrap();
    assert!(matches!(batch.put(b"c", b"3"), Err(EngineError::BatchFull)));
}

#[test]
fn leaf_cache_hits_on_repeated_lookups() {
    let engine = BTreeEngine::with_config(BTreeConfig {
        order: 8,
        adaptive: false,
        cache_nodes: 64,
        ..BTreeConfig::default()
    });
    for i in 0..200u32 {
        engine.put(format!("{i:05}").as_bytes(), b"v").unwrap();
    }

    // First read of a cold leaf misses, subsequent reads of nearby keys hit.
    engine.get(b"00100").unwrap();
    let before = engine.leaf_cache_stats();
    engine.get(b"00100").unwrap();
    engine.get(b"00100").unwrap();
    let after = engine.leaf_cache_stats();
    assert!(after.hits >= before.hits + 2, "{before:?} -> {after:?}");
    assert!(after.cached_nodes > 0);
}

#[test]
fn leaf_cache_is_invalidated_by_structural_changes() {
    let engine = BTreeEngine::with_config(BTreeConfig {
        order: 4,
        adaptive: false,
        cache_nodes: 64,
        ..BTreeConfig::default()
    });
    for i in 0..50u32 {
        engine.put(format!("{i:05}").as_bytes(), b"v").unwrap();
    }
    engine.get(b"00025").unwrap();
    assert!(engine.leaf_cache_stats().cached_nodes > 0);

    // Force splits; stale leaf ids must not be trusted afterwards.
    for i in 50..200u32 {
        engine.put(format!("{i:05}").as_bytes(), b"v").unwrap();
    }
    for i in 0..200u32 {
        let key = format!("{i:05}");
        assert_eq!(
            engine.get(key.as_bytes()).unwrap(),
            Some(b"v".to_vec()),
            "wrong read for {key}"
        );
    }
}

#[test]
fn disabled_cache_never_records_traffic() {
    let engine = BTreeEngine::with_config(BTreeConfig {
        cache_nodes: 0,
        adaptive: false,
        ..BTreeConfig::default()
    });
    engine.put(b"k", b"v").unwrap();
    engine.get(b"k").unwrap();
    engine.get(b"k").unwrap();
    let stats = engine.leaf_cache_stats();
    assert_eq!(stats.hits + stats.misses, 0);
    assert_eq!(stats.cached_nodes, 0);
}

#[test]
fn adaptive_fanout_shrinks_under_flat_load() {
    // A read/overwrite-heavy window has load ≈ 0 < low_water, so the
    // order shrinks by 20 % at the evaluation point.
    let engine = BTreeEngine::with_config(BTreeConfig {
        order: 100,
        adaptive: true,
        adaptive_interval: 64,
        ..BTreeConfig::default()
    });
    let start_order = engine.current_order();
    for _ in 0..80 {
        engine.put(b"same-key", b"v").unwrap();
    }
    let shrunk = engine.current_order();
    assert!(shrunk < start_order, "{start_order} -> {shrunk}");
    assert!(shrunk >= ORDER_MIN);
}

#[test]
fn adaptive_fanout_respects_bounds() {
    let engine = BTreeEngine::with_config(BTreeConfig {
        order: ORDER_MIN,
        adaptive: true,
        adaptive_interval: 16,
        ..BTreeConfig::default()
    });
    for i in 0..200u32 {
        engine.put(format!("{i:04}").as_bytes(), b"v").unwrap();
    }
    assert!(engine.current_order() >= ORDER_MIN);
}
