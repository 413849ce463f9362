//! End-to-end scenarios across the public crate surface.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use concordkv::batch::{BatchWriter, WriteBatch};
use concordkv::cache::{Cache, CacheConfig, CachePolicy};
use concordkv::engine::{KeyRange, StorageEngine};
use concordkv::lsm::{LsmConfig, LsmTree};
use concordkv::query::{QueryOptions, RangeQueryManager};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_tree(dir: &std::path::Path) -> LsmTree {
    init_tracing();
    LsmTree::open(
        dir,
        LsmConfig {
            memtable_size: 8 * 1024,
            level0_file_limit: 3,
            base_level_bytes: 64 * 1024,
            ..LsmConfig::default()
        },
    )
    .expect("open tree")
}

#[test]
fn fruit_bowl_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(tmp.path());

    tree.put(b"apple", b"red").unwrap();
    tree.put(b"banana", b"yellow").unwrap();
    assert_eq!(tree.get(b"apple").unwrap(), Some(b"red".to_vec()));
    assert_eq!(tree.count().unwrap(), 2);

    tree.delete(b"apple").unwrap();
    assert_eq!(tree.get(b"apple").unwrap(), None);
    assert_eq!(tree.count().unwrap(), 1);

    tree.close().unwrap();
}

#[test]
fn ten_thousand_keys_flush_compact_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = small_tree(tmp.path());
        for i in 0..10_000u32 {
            let key = format!("key{i:04}");
            tree.put(key.as_bytes(), format!("val{key}").as_bytes())
                .unwrap();
        }
        tree.flush().unwrap();
        assert!(tree.wait_for_background_work(Duration::from_secs(60)));
        tree.compact().unwrap();

        // Compaction pushed data below level 0.
        let counts = tree.level_file_counts();
        assert!(counts[1..].iter().sum::<u32>() > 0, "{counts:?}");
        tree.close().unwrap();
    }

    let tree = small_tree(tmp.path());
    assert_eq!(
        tree.get(b"key0314").unwrap(),
        Some(b"valkey0314".to_vec())
    );
    let pairs = tree
        .range_scan(
            &KeyRange::between(b"key0100".to_vec(), b"key0105".to_vec(), true, true),
            0,
        )
        .unwrap();
    assert_eq!(pairs.len(), 6);
    for window in pairs.windows(2) {
        assert!(window[0].key < window[1].key);
    }
    tree.close().unwrap();
}

#[test]
fn batch_dedup_atomic_commit() {
    let tmp = TempDir::new().unwrap();
    let tree: Arc<dyn StorageEngine> = Arc::new(small_tree(tmp.path()));
    let writer = BatchWriter::new(Arc::clone(&tree));

    let mut batch = WriteBatch::with_defaults();
    batch.put(b"x", b"1").unwrap();
    batch.put(b"y", b"2").unwrap();
    batch.put(b"x", b"3").unwrap();
    batch.delete(b"y").unwrap();
    let result = writer.commit(batch).unwrap();

    assert_eq!(result.committed, 2);
    assert_eq!(result.failed, 0);
    // Dedup ran before logging: one WAL record per surviving key.
    assert_eq!(result.wal_writes, 2);
    assert_eq!(tree.get(b"x").unwrap(), Some(b"3".to_vec()));
    assert_eq!(tree.get(b"y").unwrap(), None);
}

#[test]
fn lru_cache_eviction_order() {
    init_tracing();
    let cache = Cache::new(CacheConfig {
        max_entries: 3,
        max_bytes: 1024 * 1024,
        policy: CachePolicy::Lru,
        default_ttl: None,
        cleanup_interval: None,
        eviction_factor: 0.0,
    });

    cache.set(b"a", b"1").unwrap();
    cache.set(b"b", b"2").unwrap();
    cache.set(b"c", b"3").unwrap();
    cache.get(b"a"); // a moves to the head; b is now the tail
    cache.set(b"d", b"4").unwrap();

    assert_eq!(cache.get(b"b"), None, "b should have been evicted");
    assert!(cache.get(b"a").is_some());
    assert!(cache.get(b"c").is_some());
    assert!(cache.get(b"d").is_some());
}

#[test]
fn crash_recovery_with_synced_wal() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = LsmTree::open(
            tmp.path(),
            LsmConfig {
                sync_writes: true,
                ..LsmConfig::default()
            },
        )
        .unwrap();
        for i in 0..1000u32 {
            tree.put(format!("key-{i:04}").as_bytes(), b"v").unwrap();
        }
        // Simulated kill: a fresh handle on the same directory without
        // close() — the old one is forgotten outright.
        std::mem::forget(tree);
    }

    let tree = LsmTree::open(
        tmp.path(),
        LsmConfig {
            sync_writes: true,
            ..LsmConfig::default()
        },
    )
    .unwrap();
    assert_eq!(tree.count().unwrap(), 1000);
    tree.close().unwrap();
}

#[test]
fn prefix_scan_with_distractor() {
    let tmp = TempDir::new().unwrap();
    let tree = small_tree(tmp.path());
    for i in 0..10u32 {
        tree.put(format!("user:{i}").as_bytes(), b"profile").unwrap();
    }
    tree.put(b"userX", b"not-a-user").unwrap();

    let pairs = tree.prefix_scan(b"user:").unwrap();
    assert_eq!(pairs.len(), 10);

    // The query manager agrees, with pagination on top.
    let tree: Arc<dyn StorageEngine> = Arc::new(tree);
    let manager = RangeQueryManager::new(tree);
    let page = manager
        .prefix_query(
            b"user:",
            &QueryOptions {
                limit: 4,
                ..QueryOptions::default()
            },
        )
        .unwrap();
    assert_eq!(page.pairs.len(), 4);
    assert!(page.has_more);
}

#[test]
fn concurrent_disjoint_writers_lose_nothing() {
    let tmp = TempDir::new().unwrap();
    let tree = Arc::new(small_tree(tmp.path()));
    let threads = 4;
    let per_thread = 500;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                for i in 0..per_thread {
                    let key = format!("writer{t}-key{i:05}");
                    tree.put(key.as_bytes(), b"v").unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(tree.wait_for_background_work(Duration::from_secs(60)));
    assert_eq!(tree.count().unwrap(), (threads * per_thread) as u64);
    for t in 0..threads {
        for i in (0..per_thread).step_by(127) {
            let key = format!("writer{t}-key{i:05}");
            assert_eq!(tree.get(key.as_bytes()).unwrap(), Some(b"v".to_vec()));
        }
    }
    tree.close().unwrap();
}

#[test]
fn scans_stay_stable_under_concurrent_writes() {
    let tmp = TempDir::new().unwrap();
    let tree = Arc::new(small_tree(tmp.path()));
    for i in 0..500u32 {
        tree.put(format!("stable-{i:04}").as_bytes(), b"v").unwrap();
    }

    let writer = {
        let tree = Arc::clone(&tree);
        std::thread::spawn(move || {
            for i in 0..2000u32 {
                tree.put(format!("noise-{i:05}").as_bytes(), b"n").unwrap();
            }
        })
    };

    // Scans race the writer; they must neither crash nor double-emit.
    for _ in 0..20 {
        let pairs = tree
            .range_scan(
                &KeyRange::half_open(b"stable-".to_vec(), b"stable-9999".to_vec()),
                0,
            )
            .unwrap();
        assert_eq!(pairs.len(), 500);
        for window in pairs.windows(2) {
            assert!(window[0].key < window[1].key, "duplicate or misorder");
        }
    }
    writer.join().unwrap();
    tree.close().unwrap();
}

#[test]
fn engine_contract_round_trip_for_every_kind() {
    use concordkv::config::Config;
    use concordkv::engine::EngineKind;
    use concordkv::factory::create_engine;

    init_tracing();
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = tmp.path().to_path_buf();

    for kind in [
        EngineKind::Array,
        EngineKind::Hash,
        EngineKind::RbTree,
        EngineKind::BTree,
        EngineKind::Lsm,
    ] {
        let engine = create_engine(kind, &config).unwrap();
        engine.put(b"shared-key", b"shared-value").unwrap();
        assert_eq!(
            engine.get(b"shared-key").unwrap(),
            Some(b"shared-value".to_vec()),
            "{kind} failed the round trip"
        );
        assert_eq!(engine.count().unwrap(), 1);
        engine.delete(b"shared-key").unwrap();
        assert_eq!(engine.count().unwrap(), 0);
        engine.close().unwrap();
    }
}
