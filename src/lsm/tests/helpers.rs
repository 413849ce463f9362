use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::lsm::{LsmConfig, LsmTree};

/// Tracing controlled by `RUST_LOG`; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config whose memtable never fills during a small test.
pub fn memtable_only_config() -> LsmConfig {
    init_tracing();
    LsmConfig {
        memtable_size: 1024 * 1024,
        ..LsmConfig::default()
    }
}

/// Tiny memtable: a handful of writes forces freeze + flush traffic.
pub fn small_buffer_config() -> LsmConfig {
    init_tracing();
    LsmConfig {
        memtable_size: 1024,
        base_level_bytes: 16 * 1024,
        ..LsmConfig::default()
    }
}

/// Synchronous-durability config for crash tests.
pub fn durable_config() -> LsmConfig {
    init_tracing();
    LsmConfig {
        sync_writes: true,
        ..memtable_only_config()
    }
}

pub fn open(path: &Path, config: LsmConfig) -> LsmTree {
    LsmTree::open(path, config).expect("open LSM tree")
}

/// Seeds `n` keys `prefix-{i:05}` → `value-{i}`.
pub fn seed(tree: &LsmTree, prefix: &str, n: usize) {
    use crate::engine::StorageEngine;
    for i in 0..n {
        tree.put(
            format!("{prefix}-{i:05}").as_bytes(),
            format!("value-{i}").as_bytes(),
        )
        .expect("seed put");
    }
}

pub fn settle(tree: &LsmTree) {
    assert!(
        tree.wait_for_background_work(Duration::from_secs(30)),
        "background work did not settle"
    );
}
