use tempfile::TempDir;

use super::helpers::{memtable_only_config, open, seed, settle, small_buffer_config};
use crate::engine::{EngineError, KeyRange, StorageEngine};

#[test]
fn put_get_delete_round_trip() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());

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
fn delete_absent_key_reports_not_found() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());
    assert!(matches!(
        tree.delete(b"ghost"),
        Err(EngineError::KeyNotFound)
    ));
}

#[test]
fn update_requires_existing_key() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());
    assert!(matches!(
        tree.update(b"ghost", b"v"),
        Err(EngineError::KeyNotFound)
    ));
    tree.put(b"k", b"v1").unwrap();
    tree.update(b"k", b"v2").unwrap();
    assert_eq!(tree.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn seq_numbers_strictly_increase() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());
    tree.put(b"k", b"v1").unwrap();
    let (_, s1) = tree.get_versioned(b"k").unwrap().unwrap();
    tree.put(b"k", b"v2").unwrap();
    let (_, s2) = tree.get_versioned(b"k").unwrap().unwrap();
    assert!(s2 > s1);
}

#[test]
fn reads_span_frozen_tables_and_sstables() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), small_buffer_config());
    seed(&tree, "key", 300);
    settle(&tree);

    // Some keys now live in SSTables, some still in memtables.
    for i in (0..300).step_by(23) {
        let key = format!("key-{i:05}");
        assert_eq!(
            tree.get(key.as_bytes()).unwrap(),
            Some(format!("value-{i}").into_bytes()),
            "missing {key}"
        );
    }
    let counts = tree.level_file_counts();
    assert!(counts.iter().sum::<u32>() > 0, "expected flushed tables");
}

#[test]
fn tombstone_masks_older_layers() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());

    tree.put(b"k", b"v1").unwrap();
    tree.flush().unwrap(); // v1 now in an SSTable
    tree.put(b"k", b"v2").unwrap();
    tree.flush().unwrap(); // v2 in a second SSTable
    tree.delete(b"k").unwrap(); // tombstone in the memtable

    assert_eq!(tree.get(b"k").unwrap(), None);
    assert_eq!(tree.count().unwrap(), 0);

    // The tombstone survives its own flush too.
    tree.flush().unwrap();
    assert_eq!(tree.get(b"k").unwrap(), None);
}

#[test]
fn range_scan_merges_layers_in_order() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());
    for i in 0..10u32 {
        tree.put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
        if i == 4 {
            tree.flush().unwrap();
        }
    }

    let pairs = tree
        .range_scan(&KeyRange::half_open(b"k3".to_vec(), b"k7".to_vec()), 10)
        .unwrap();
    let keys: Vec<Vec<u8>> = pairs.into_iter().map(|p| p.key).collect();
    assert_eq!(
        keys,
        vec![b"k3".to_vec(), b"k4".to_vec(), b"k5".to_vec(), b"k6".to_vec()]
    );
}

#[test]
fn overwrite_across_flush_returns_newest() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());
    tree.put(b"k", b"old").unwrap();
    tree.flush().unwrap();
    tree.put(b"k", b"new").unwrap();

    assert_eq!(tree.get(b"k").unwrap(), Some(b"new".to_vec()));
    let pairs = tree.range_scan(&KeyRange::all(), 0).unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].value, b"new");
}

#[test]
fn prefix_scan_over_mixed_layers() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());
    for i in 0..10u32 {
        tree.put(format!("user:{i}").as_bytes(), b"x").unwrap();
    }
    tree.flush().unwrap();
    tree.put(b"userX", b"distractor").unwrap();

    let pairs = tree.prefix_scan(b"user:").unwrap();
    assert_eq!(pairs.len(), 10);
}

#[test]
fn closed_tree_rejects_operations() {
    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());
    tree.put(b"k", b"v").unwrap();
    tree.close().unwrap();
    assert!(matches!(
        tree.put(b"k2", b"v"),
        Err(EngineError::InvalidState(_))
    ));
    // close is idempotent
    tree.close().unwrap();
}

#[test]
fn batch_apply_writes_one_commit_marker() {
    use crate::engine::{BatchApplyOptions, BatchOp};

    let tmp = TempDir::new().unwrap();
    let tree = open(tmp.path(), memtable_only_config());
    let ops = vec![
        BatchOp::Put {
            key: b"x".to_vec(),
            value: b"1".to_vec(),
        },
        BatchOp::Put {
            key: b"y".to_vec(),
            value: b"2".to_vec(),
        },
        BatchOp::Delete {
            key: b"y".to_vec(),
        },
    ];
    let outcome = tree
        .apply_batch(
            &ops,
            &BatchApplyOptions {
                atomic: true,
                sync_wal: true,
                ..BatchApplyOptions::default()
            },
        )
        .unwrap();
    assert_eq!(outcome.applied, 3);
    assert_eq!(outcome.wal_records, 3);
    assert_eq!(tree.get(b"x").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get(b"y").unwrap(), None);
}
