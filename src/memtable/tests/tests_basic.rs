use crate::engine::KeyRange;
use crate::memtable::{MemtableError, MemtableLookup, MemtableSet};

fn table(max_size: usize) -> MemtableSet {
    MemtableSet::new(max_size, 5, false)
}

#[test]
fn apply_and_lookup() {
    let set = table(1024 * 1024);
    set.apply(b"k1", 1, Some(b"v1".to_vec())).unwrap();

    assert_eq!(
        set.lookup(b"k1"),
        MemtableLookup::Found {
            value: b"v1".to_vec(),
            seq: 1
        }
    );
    assert_eq!(set.lookup(b"missing"), MemtableLookup::Missing);
}

#[test]
fn newer_version_wins() {
    let set = table(1024 * 1024);
    set.apply(b"k", 1, Some(b"old".to_vec())).unwrap();
    set.apply(b"k", 2, Some(b"new".to_vec())).unwrap();
    assert_eq!(
        set.lookup(b"k"),
        MemtableLookup::Found {
            value: b"new".to_vec(),
            seq: 2
        }
    );
    // Only the latest version is retained.
    assert_eq!(set.active().entry_count(), 1);
}

#[test]
fn tombstone_is_reported_not_hidden() {
    let set = table(1024 * 1024);
    set.apply(b"k", 1, Some(b"v".to_vec())).unwrap();
    set.apply(b"k", 2, None).unwrap();
    assert_eq!(set.lookup(b"k"), MemtableLookup::Tombstone { seq: 2 });
}

#[test]
fn frozen_table_rejects_writes() {
    let set = table(1024 * 1024);
    set.apply(b"k", 1, Some(b"v".to_vec())).unwrap();
    let frozen = set.freeze_active().unwrap().unwrap();
    assert!(frozen.is_frozen());
    assert!(matches!(
        frozen.apply(b"k2", 2, Some(b"v".to_vec())),
        Err(MemtableError::Frozen)
    ));
    // Reads still see the frozen contents through the set.
    assert_eq!(
        set.lookup(b"k"),
        MemtableLookup::Found {
            value: b"v".to_vec(),
            seq: 1
        }
    );
}

#[test]
fn full_table_without_auto_freeze_errors() {
    let set = table(64);
    set.apply(b"k1", 1, Some(vec![b'x'; 16])).unwrap();
    assert!(matches!(
        set.apply(b"k2", 2, Some(vec![b'y'; 64])),
        Err(MemtableError::Full)
    ));
}

#[test]
fn scan_is_ordered_and_includes_tombstones() {
    let set = table(1024 * 1024);
    set.apply(b"c", 3, None).unwrap();
    set.apply(b"a", 1, Some(b"1".to_vec())).unwrap();
    set.apply(b"b", 2, Some(b"2".to_vec())).unwrap();

    let entries = set
        .active()
        .scan(&KeyRange::half_open(b"a".to_vec(), b"z".to_vec()));
    let keys: Vec<Vec<u8>> = entries.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    assert!(entries[2].1.is_tombstone());
}

#[test]
fn seq_bounds_track_mutations() {
    let set = table(1024 * 1024);
    set.apply(b"a", 10, Some(b"v".to_vec())).unwrap();
    set.apply(b"b", 12, None).unwrap();
    let active = set.active();
    assert_eq!(active.min_seq(), 10);
    assert_eq!(active.max_seq(), 12);
}

#[test]
fn snapshot_for_flush_does_not_mutate() {
    let set = table(1024 * 1024);
    for i in 0..20u32 {
        set.apply(format!("k{i:02}").as_bytes(), u64::from(i) + 1, Some(b"v".to_vec()))
            .unwrap();
    }
    let snapshot = set.active().snapshot_for_flush();
    assert_eq!(snapshot.len(), 20);
    assert_eq!(set.active().entry_count(), 20);
    // Snapshot is key-ordered.
    for window in snapshot.windows(2) {
        assert!(window[0].0 < window[1].0);
    }
}

#[test]
fn standalone_memtable_size_accounting_shrinks_on_overwrite() {
    let set = table(1024 * 1024);
    set.apply(b"k", 1, Some(vec![b'a'; 100])).unwrap();
    let big = set.active().approximate_size();
    set.apply(b"k", 2, Some(vec![b'a'; 10])).unwrap();
    let small = set.active().approximate_size();
    assert!(small < big);
}
