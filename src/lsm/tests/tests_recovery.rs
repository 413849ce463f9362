//! Crash-recovery behavior: WAL replay equivalence, recovery cursors,
//! and restart after flushes.

use tempfile::TempDir;

use super::helpers::{durable_config, init_tracing, memtable_only_config, open, seed, settle};
use crate::engine::{KeyRange, StorageEngine};
use crate::lsm::LsmConfig;

#[test]
fn unflushed_writes_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open(tmp.path(), durable_config());
        seed(&tree, "key", 100);
        tree.delete(b"key-00042").unwrap();
        // Simulated crash: the handle is dropped without close();
        // nothing was flushed to SSTables.
        drop(tree);
    }

    let tree = open(tmp.path(), durable_config());
    assert_eq!(tree.count().unwrap(), 99);
    assert_eq!(
        tree.get(b"key-00007").unwrap(),
        Some(b"value-7".to_vec())
    );
    assert_eq!(tree.get(b"key-00042").unwrap(), None);
}

#[test]
fn replay_equivalence_with_mixed_operations() {
    let tmp_a = TempDir::new().unwrap();
    let tmp_b = TempDir::new().unwrap();

    let ops: Vec<(bool, String, String)> = (0..200)
        .map(|i| {
            let key = format!("k{:03}", i % 50);
            (i % 7 == 3, key, format!("v{i}"))
        })
        .collect();

    // Tree A: crash (drop) then reopen.
    {
        let tree = open(tmp_a.path(), durable_config());
        for (is_delete, key, value) in &ops {
            if *is_delete {
                let _ = tree.delete(key.as_bytes());
            } else {
                tree.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
        }
        drop(tree);
    }
    let recovered = open(tmp_a.path(), durable_config());

    // Tree B: the same operations without a crash.
    let reference = open(tmp_b.path(), durable_config());
    for (is_delete, key, value) in &ops {
        if *is_delete {
            let _ = reference.delete(key.as_bytes());
        } else {
            reference.put(key.as_bytes(), value.as_bytes()).unwrap();
        }
    }

    let a: Vec<_> = recovered.range_scan(&KeyRange::all(), 0).unwrap();
    let b: Vec<_> = reference.range_scan(&KeyRange::all(), 0).unwrap();
    assert_eq!(a, b);
}

#[test]
fn sequence_source_continues_after_reopen() {
    let tmp = TempDir::new().unwrap();
    let seq_before;
    {
        let tree = open(tmp.path(), durable_config());
        seed(&tree, "key", 20);
        seq_before = tree.get_versioned(b"key-00019").unwrap().unwrap().1;
        drop(tree);
    }
    let tree = open(tmp.path(), durable_config());
    tree.put(b"after", b"v").unwrap();
    let (_, seq_after) = tree.get_versioned(b"after").unwrap().unwrap();
    assert!(
        seq_after > seq_before,
        "recovered seq {seq_after} did not advance past {seq_before}"
    );
}

#[test]
fn flushed_data_survives_restart_without_wal_replay() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open(tmp.path(), memtable_only_config());
        seed(&tree, "key", 50);
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    let tree = open(tmp.path(), memtable_only_config());
    assert_eq!(tree.count().unwrap(), 50);
    assert_eq!(
        tree.get(b"key-00031").unwrap(),
        Some(b"value-31".to_vec())
    );
}

#[test]
fn mixed_flushed_and_unflushed_state_recovers() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open(tmp.path(), durable_config());
        seed(&tree, "old", 30);
        tree.flush().unwrap();
        seed(&tree, "new", 30);
        // Crash with "old" in SSTables and "new" only in the WAL.
        drop(tree);
    }

    let tree = open(tmp.path(), durable_config());
    assert_eq!(tree.count().unwrap(), 60);
    assert_eq!(tree.get(b"old-00000").unwrap(), Some(b"value-0".to_vec()));
    assert_eq!(tree.get(b"new-00029").unwrap(), Some(b"value-29".to_vec()));
}

#[test]
fn wal_disabled_loses_unflushed_but_opens_cleanly() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let config = LsmConfig {
        enable_wal: false,
        ..LsmConfig::default()
    };
    {
        let tree = open(tmp.path(), config.clone());
        seed(&tree, "keep", 10);
        tree.flush().unwrap();
        seed(&tree, "lost", 10);
        drop(tree);
    }
    let tree = open(tmp.path(), config);
    assert_eq!(tree.count().unwrap(), 10);
    assert_eq!(tree.get(b"lost-00001").unwrap(), None);
}

#[test]
fn thousand_synced_puts_survive_simulated_kill() {
    let tmp = TempDir::new().unwrap();
    {
        let tree = open(tmp.path(), durable_config());
        seed(&tree, "durable", 1000);
        std::mem::forget(tree); // harsher than drop: no Drop cleanup at all
    }
    let tree = open(tmp.path(), durable_config());
    assert_eq!(tree.count().unwrap(), 1000);
    settle(&tree);
}
