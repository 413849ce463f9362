use tempfile::TempDir;

use crate::wal::{Wal, WalConfig, WalRecord};

fn small_segment_config() -> WalConfig {
    WalConfig {
        segment_size: 256,
        sync_writes: false,
    }
}

fn put(seq: u64) -> WalRecord {
    WalRecord::Put {
        seq,
        key: format!("key-{seq:04}").into_bytes(),
        value: vec![b'v'; 32],
    }
}

#[test]
fn segments_rotate_at_size_limit() {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path(), small_segment_config()).unwrap();
    let first_id = wal.active_segment_id();
    for seq in 1..=50 {
        wal.append(&put(seq)).unwrap();
    }
    assert!(
        wal.active_segment_id() > first_id,
        "expected rotation past segment {first_id}"
    );

    let files = std::fs::read_dir(tmp.path()).unwrap().count();
    assert!(files > 1, "expected multiple segment files, got {files}");
}

#[test]
fn replay_spans_rotated_segments_in_order() {
    let tmp = TempDir::new().unwrap();
    {
        let wal = Wal::open(tmp.path(), small_segment_config()).unwrap();
        for seq in 1..=80 {
            wal.append(&put(seq)).unwrap();
        }
    }

    let wal = Wal::open(tmp.path(), small_segment_config()).unwrap();
    let seqs: Vec<u64> = wal
        .replay()
        .unwrap()
        .map(|r| r.unwrap().seq())
        .collect();
    assert_eq!(seqs, (1..=80).collect::<Vec<u64>>());
}

#[test]
fn prune_removes_only_covered_segments() {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path(), small_segment_config()).unwrap();
    for seq in 1..=60 {
        wal.append(&put(seq)).unwrap();
    }
    let files_before = std::fs::read_dir(tmp.path()).unwrap().count();
    assert!(files_before > 2);

    // Everything up to seq 30 is flushed; segments fully below the cutoff go.
    let removed = wal.prune(30).unwrap();
    assert!(removed > 0);
    let files_after = std::fs::read_dir(tmp.path()).unwrap().count();
    assert!(files_after < files_before);

    // Records above the cutoff are still replayable.
    let survivors: Vec<u64> = wal
        .replay()
        .unwrap()
        .map(|r| r.unwrap().seq())
        .collect();
    assert!(survivors.contains(&60));
    assert!(survivors.iter().all(|&seq| seq > 0));
}

#[test]
fn reopen_does_not_append_to_old_segments() {
    let tmp = TempDir::new().unwrap();
    let old_active;
    {
        let wal = Wal::open(tmp.path(), small_segment_config()).unwrap();
        wal.append(&put(1)).unwrap();
        old_active = wal.active_segment_id();
    }
    let wal = Wal::open(tmp.path(), small_segment_config()).unwrap();
    assert!(wal.active_segment_id() > old_active);
}
