use tempfile::TempDir;

use crate::engine::KeyRange;
use crate::sstable::{SsTable, TableBuilder, TableBuilderConfig, TableEntry};

fn build_numbered(path: &std::path::Path, n: u32, block_size: usize) -> SsTable {
    let entries: Vec<TableEntry> = (0..n)
        .map(|i| TableEntry::put(format!("{i:06}"), format!("v{i}"), u64::from(i) + 1))
        .collect();
    TableBuilder::with_config(
        path,
        TableBuilderConfig {
            block_size,
            ..TableBuilderConfig::default()
        },
    )
    .build(entries.into_iter(), n as usize)
    .unwrap();
    SsTable::open(path).unwrap()
}

#[test]
fn full_scan_yields_everything_in_order() {
    let tmp = TempDir::new().unwrap();
    let table = build_numbered(&tmp.path().join("t.sst"), 500, 256);

    let keys: Vec<Vec<u8>> = table
        .scan(KeyRange::all())
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    assert_eq!(keys.len(), 500);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(key, format!("{i:06}").as_bytes());
    }
}

#[test]
fn bounded_scan_respects_range_edges() {
    let tmp = TempDir::new().unwrap();
    let table = build_numbered(&tmp.path().join("t.sst"), 300, 256);

    let keys: Vec<Vec<u8>> = table
        .scan(KeyRange::half_open(b"000100".to_vec(), b"000110".to_vec()))
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    assert_eq!(keys.len(), 10);
    assert_eq!(keys[0], b"000100");
    assert_eq!(keys[9], b"000109");

    let keys: Vec<Vec<u8>> = table
        .scan(KeyRange::between(
            b"000100".to_vec(),
            b"000110".to_vec(),
            true,
            true,
        ))
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    assert_eq!(keys.len(), 11);
    assert_eq!(keys[10], b"000110");
}

#[test]
fn scan_spanning_block_boundaries() {
    let tmp = TempDir::new().unwrap();
    // Tiny blocks force the range to straddle several of them.
    let table = build_numbered(&tmp.path().join("t.sst"), 200, 64);

    let keys: Vec<Vec<u8>> = table
        .scan(KeyRange::half_open(b"000050".to_vec(), b"000150".to_vec()))
        .unwrap()
        .map(|r| r.unwrap().key)
        .collect();
    assert_eq!(keys.len(), 100);
}

#[test]
fn scan_outside_key_space_is_empty() {
    let tmp = TempDir::new().unwrap();
    let table = build_numbered(&tmp.path().join("t.sst"), 50, 256);

    assert_eq!(
        table
            .scan(KeyRange::half_open(b"zzz".to_vec(), b"zzzz".to_vec()))
            .unwrap()
            .count(),
        0
    );
    assert_eq!(
        table
            .scan(KeyRange::half_open(b"!".to_vec(), b"!!".to_vec()))
            .unwrap()
            .count(),
        0
    );
}

#[test]
fn scan_includes_tombstones() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let entries = vec![
        TableEntry::put("a", "1", 1),
        TableEntry::tombstone("b", 2),
        TableEntry::put("c", "3", 3),
    ];
    TableBuilder::new(&path).build(entries.into_iter(), 3).unwrap();
    let table = SsTable::open(&path).unwrap();

    let scanned: Vec<TableEntry> = table
        .scan(KeyRange::all())
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(scanned.len(), 3);
    assert!(scanned[1].is_tombstone());
}
