//! Snapshot files: point-in-time dumps of the tree's logical contents.
//!
//! A **full** snapshot stores every live pair visible at the capture
//! sequence. An **incremental** snapshot stores the newest version —
//! tombstones included — of every key touched after a base sequence, so
//! applying it on top of the base reproduces the capture state.
//!
//! # File layout (little-endian, via [`crate::encoding`])
//!
//! ```text
//! u32 magic        0x534E4150 "SNAP" (full) / 0x494E4352 "INCR"
//! u32 version      1
//! u64 timestamp_us
//! u64 sequence     capture sequence
//! [u64 from_seq][u64 to_seq]          INCR only
//! entry*           key (length-prefixed), value (optional,
//!                  length-prefixed), u64 seq
//! u32 0xFFFF_FFFF  END marker (where a key length would start)
//! u32 crc32        over every preceding byte
//! ```
//!
//! Files are written next to the tree under `snapshots/` via temp +
//! rename.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use tracing::info;

use crate::encoding::{Decode, Encode};
use crate::engine::{EngineError, KeyRange};
use crate::sstable::TableEntry;
use crate::time;

use super::{LsmTree, SNAPSHOT_DIR};

/// Full-snapshot magic: `"SNAP"`.
pub const SNAPSHOT_MAGIC: u32 = 0x534E_4150;
/// Incremental-snapshot magic: `"INCR"`.
pub const INCREMENTAL_MAGIC: u32 = 0x494E_4352;
/// Supported snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

const END_MARKER: u32 = 0xFFFF_FFFF;

/// Which flavour a loaded snapshot file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Complete live state at the capture sequence.
    Full,
    /// Changes inside `(from_seq, to_seq]`.
    Incremental {
        /// Base sequence the delta applies on top of.
        from_seq: u64,
        /// Capture sequence.
        to_seq: u64,
    },
}

/// A decoded snapshot file.
#[derive(Debug)]
pub struct SnapshotContents {
    /// Flavour and sequence window.
    pub kind: SnapshotKind,
    /// Capture timestamp, microseconds since the epoch.
    pub timestamp_us: u64,
    /// Capture sequence.
    pub sequence: u64,
    /// Entries in key order; tombstones appear in incremental files.
    pub entries: Vec<TableEntry>,
}

fn encode_failure(e: crate::encoding::EncodingError) -> EngineError {
    EngineError::Internal(format!("snapshot encoding failed: {e}"))
}

fn write_snapshot_file(
    path: &Path,
    magic: u32,
    sequence: u64,
    window: Option<(u64, u64)>,
    entries: &[TableEntry],
) -> Result<(), EngineError> {
    let mut buf = Vec::new();
    magic.encode_to(&mut buf).map_err(encode_failure)?;
    SNAPSHOT_VERSION.encode_to(&mut buf).map_err(encode_failure)?;
    time::unix_micros()
        .encode_to(&mut buf)
        .map_err(encode_failure)?;
    sequence.encode_to(&mut buf).map_err(encode_failure)?;
    if let Some((from_seq, to_seq)) = window {
        from_seq.encode_to(&mut buf).map_err(encode_failure)?;
        to_seq.encode_to(&mut buf).map_err(encode_failure)?;
    }
    for entry in entries {
        entry.key.encode_to(&mut buf).map_err(encode_failure)?;
        entry.value.encode_to(&mut buf).map_err(encode_failure)?;
        entry.seq.encode_to(&mut buf).map_err(encode_failure)?;
    }
    END_MARKER.encode_to(&mut buf).map_err(encode_failure)?;

    let mut crc = Crc32::new();
    crc.update(&buf);
    buf.extend_from_slice(&crc.finalize().to_le_bytes());

    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            dir.sync_all()?;
        }
    }
    Ok(())
}

/// Parses and verifies a snapshot file.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<SnapshotContents, EngineError> {
    let mut bytes = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut bytes)?;
    if bytes.len() < 4 + 4 + 8 + 8 + 4 + 4 {
        return Err(EngineError::Corrupted("snapshot file too small".into()));
    }

    let crc_off = bytes.len() - 4;
    let stored_crc = u32::from_le_bytes([
        bytes[crc_off],
        bytes[crc_off + 1],
        bytes[crc_off + 2],
        bytes[crc_off + 3],
    ]);
    let mut crc = Crc32::new();
    crc.update(&bytes[..crc_off]);
    if crc.finalize() != stored_crc {
        return Err(EngineError::Corrupted("snapshot checksum mismatch".into()));
    }

    let body = &bytes[..crc_off];
    let decode_failure =
        |e: crate::encoding::EncodingError| EngineError::Corrupted(format!("snapshot decode: {e}"));

    let mut off = 0usize;
    let (magic, n) = u32::decode_from(&body[off..]).map_err(decode_failure)?;
    off += n;
    let (version, n) = u32::decode_from(&body[off..]).map_err(decode_failure)?;
    off += n;
    if version != SNAPSHOT_VERSION {
        return Err(EngineError::Corrupted(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let (timestamp_us, n) = u64::decode_from(&body[off..]).map_err(decode_failure)?;
    off += n;
    let (sequence, n) = u64::decode_from(&body[off..]).map_err(decode_failure)?;
    off += n;

    let kind = match magic {
        SNAPSHOT_MAGIC => SnapshotKind::Full,
        INCREMENTAL_MAGIC => {
            let (from_seq, n) = u64::decode_from(&body[off..]).map_err(decode_failure)?;
            off += n;
            let (to_seq, n) = u64::decode_from(&body[off..]).map_err(decode_failure)?;
            off += n;
            SnapshotKind::Incremental { from_seq, to_seq }
        }
        other => {
            return Err(EngineError::Corrupted(format!(
                "unknown snapshot magic {other:#010x}"
            )));
        }
    };

    let mut entries = Vec::new();
    loop {
        let (marker_probe, _) = u32::decode_from(&body[off..]).map_err(decode_failure)?;
        if marker_probe == END_MARKER {
            off += 4;
            break;
        }
        let (key, n) = Vec::<u8>::decode_from(&body[off..]).map_err(decode_failure)?;
        off += n;
        let (value, n) = Option::<Vec<u8>>::decode_from(&body[off..]).map_err(decode_failure)?;
        off += n;
        let (seq, n) = u64::decode_from(&body[off..]).map_err(decode_failure)?;
        off += n;
        entries.push(TableEntry { key, value, seq });
    }
    if off != crc_off {
        return Err(EngineError::Corrupted(
            "trailing bytes after snapshot end marker".into(),
        ));
    }

    Ok(SnapshotContents {
        kind,
        timestamp_us,
        sequence,
        entries,
    })
}

impl LsmTree {
    /// Writes a full snapshot of the live state and returns its path.
    pub fn create_snapshot(&self) -> Result<PathBuf, EngineError> {
        self.core.state.ensure_running()?;
        let sequence = self.core.seq.last_issued();
        let entries: Vec<TableEntry> = self
            .core
            .merged_entries(&KeyRange::all(), false)?
            .into_iter()
            .collect();
        let path = self
            .core
            .data_dir
            .join(SNAPSHOT_DIR)
            .join(format!("snapshot-{sequence:016}.snap"));
        write_snapshot_file(&path, SNAPSHOT_MAGIC, sequence, None, &entries)?;
        info!(path = %path.display(), sequence, entries = entries.len(), "snapshot written");
        Ok(path)
    }

    /// Writes an incremental snapshot of everything newer than
    /// `from_seq` (tombstones included) and returns its path.
    pub fn create_incremental_snapshot(&self, from_seq: u64) -> Result<PathBuf, EngineError> {
        self.core.state.ensure_running()?;
        let to_seq = self.core.seq.last_issued();
        let entries: Vec<TableEntry> = self
            .core
            .merged_entries(&KeyRange::all(), true)?
            .into_iter()
            .filter(|entry| entry.seq > from_seq)
            .collect();
        let path = self
            .core
            .data_dir
            .join(SNAPSHOT_DIR)
            .join(format!("snapshot-{to_seq:016}.incr"));
        write_snapshot_file(
            &path,
            INCREMENTAL_MAGIC,
            to_seq,
            Some((from_seq, to_seq)),
            &entries,
        )?;
        info!(
            path = %path.display(),
            from_seq,
            to_seq,
            entries = entries.len(),
            "incremental snapshot written"
        );
        Ok(path)
    }

    /// Replays a snapshot into this tree, preserving the captured
    /// sequence numbers and advancing the sequence source past them.
    pub fn restore_from_snapshot(&self, path: impl AsRef<Path>) -> Result<u64, EngineError> {
        self.core.state.ensure_running()?;
        let contents = load_snapshot(path)?;
        let applied = contents.entries.len() as u64;

        for entry in contents.entries {
            if let Some(wal) = &self.core.wal {
                let record = match &entry.value {
                    Some(value) => crate::wal::WalRecord::Put {
                        seq: entry.seq,
                        key: entry.key.clone(),
                        value: value.clone(),
                    },
                    None => crate::wal::WalRecord::Delete {
                        seq: entry.seq,
                        key: entry.key.clone(),
                    },
                };
                wal.append(&record)?;
            }
            self.core
                .apply_to_memtables(&entry.key, entry.seq, entry.value)?;
        }
        self.core.seq.advance_past(contents.sequence);
        info!(applied, sequence = contents.sequence, "snapshot restored");
        Ok(applied)
    }
}
