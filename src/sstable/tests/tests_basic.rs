use tempfile::TempDir;

use crate::sstable::{
    Compression, SsTable, TableBuilder, TableBuilderConfig, TableEntry, TableError, TableGet,
};

fn entry(i: u32, seq: u64) -> TableEntry {
    TableEntry::put(format!("key-{i:06}"), format!("value-{i}"), seq)
}

#[test]
fn build_then_read_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");

    let entries: Vec<TableEntry> = (0u32..1000).map(|i| entry(i, u64::from(i) + 1)).collect();
    let summary = TableBuilder::new(&path)
        .build(entries.clone().into_iter(), entries.len())
        .unwrap();

    assert_eq!(summary.entry_count, 1000);
    assert_eq!(summary.min_seq, 1);
    assert_eq!(summary.max_seq, 1000);
    assert_eq!(summary.min_key, b"key-000000".to_vec());
    assert_eq!(summary.max_key, b"key-000999".to_vec());

    let table = SsTable::open(&path).unwrap();
    assert_eq!(table.entry_count(), 1000);
    assert_eq!(table.file_size(), summary.file_size);
    assert_eq!(
        table.key_bounds().unwrap(),
        (summary.min_key.clone(), summary.max_key.clone())
    );

    for i in (0u32..1000).step_by(37) {
        let got = table.get(format!("key-{i:06}").as_bytes()).unwrap();
        assert_eq!(
            got,
            TableGet::Found {
                value: format!("value-{i}").into_bytes(),
                seq: u64::from(i) + 1
            },
            "wrong result for key {i}"
        );
    }
    assert_eq!(table.get(b"key-999999").unwrap(), TableGet::Missing);
    assert_eq!(table.get(b"aaa").unwrap(), TableGet::Missing);
}

#[test]
fn tombstones_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");

    let entries = vec![
        TableEntry::put("alive", "v", 1),
        TableEntry::tombstone("dead", 2),
    ];
    TableBuilder::new(&path).build(entries.into_iter(), 2).unwrap();

    let table = SsTable::open(&path).unwrap();
    assert_eq!(
        table.get(b"alive").unwrap(),
        TableGet::Found {
            value: b"v".to_vec(),
            seq: 1
        }
    );
    assert_eq!(table.get(b"dead").unwrap(), TableGet::Tombstone { seq: 2 });
}

#[test]
fn lz4_tables_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");

    // Highly compressible values so the codec actually engages.
    let entries: Vec<TableEntry> = (0u32..500)
        .map(|i| TableEntry::put(format!("key-{i:06}"), vec![b'a'; 128], u64::from(i) + 1))
        .collect();
    let config = TableBuilderConfig {
        compression: Compression::Lz4,
        ..TableBuilderConfig::default()
    };
    let none_size = {
        let plain = tmp.path().join("plain.sst");
        TableBuilder::new(&plain)
            .build(entries.clone().into_iter(), entries.len())
            .unwrap()
            .file_size
    };
    let summary = TableBuilder::with_config(&path, config)
        .build(entries.clone().into_iter(), entries.len())
        .unwrap();
    assert!(
        summary.file_size < none_size,
        "lz4 table ({}) not smaller than plain ({none_size})",
        summary.file_size
    );

    let table = SsTable::open(&path).unwrap();
    for i in (0..500).step_by(61) {
        assert!(matches!(
            table.get(format!("key-{i:06}").as_bytes()).unwrap(),
            TableGet::Found { .. }
        ));
    }
}

#[test]
fn duplicate_keys_resolve_to_highest_seq() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");

    // Multi-version run: same key, newest first.
    let entries = vec![
        TableEntry::put("k", "newest", 9),
        TableEntry::put("k", "older", 5),
        TableEntry::tombstone("k", 2),
    ];
    TableBuilder::new(&path).build(entries.into_iter(), 3).unwrap();

    let table = SsTable::open(&path).unwrap();
    assert_eq!(
        table.get(b"k").unwrap(),
        TableGet::Found {
            value: b"newest".to_vec(),
            seq: 9
        }
    );
}

#[test]
fn empty_input_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let result = TableBuilder::new(&path).build(std::iter::empty(), 0);
    assert!(matches!(result, Err(TableError::InvalidInput(_))));
    assert!(!path.exists());
}

#[test]
fn unsorted_input_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let entries = vec![TableEntry::put("b", "1", 1), TableEntry::put("a", "2", 2)];
    let result = TableBuilder::new(&path).build(entries.into_iter(), 2);
    assert!(matches!(result, Err(TableError::InvalidInput(_))));
}

#[test]
fn small_block_size_produces_many_blocks() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let config = TableBuilderConfig {
        block_size: 128,
        ..TableBuilderConfig::default()
    };
    let entries: Vec<TableEntry> = (0..200).map(|i| entry(i, u64::from(i) + 1)).collect();
    TableBuilder::with_config(&path, config)
        .build(entries.into_iter(), 200)
        .unwrap();

    let table = SsTable::open(&path).unwrap();
    // Every key must still be reachable through the multi-block index.
    for i in 0..200 {
        assert!(
            matches!(
                table.get(format!("key-{i:06}").as_bytes()).unwrap(),
                TableGet::Found { .. }
            ),
            "key {i} unreachable"
        );
    }
}
