//! Write-ahead log: rotating, CRC-protected segments.
//!
//! Mutations are appended to the log *before* they touch the memtable, so
//! a crash can always be replayed back to the last durable record.
//!
//! # On-disk layout
//!
//! Segments live under the WAL directory as `wal-{id:016}.log`. Each
//! record is a fixed 32-byte header followed by the key and value bytes:
//!
//! ```text
//! u32 type        1=PUT, 2=DELETE, 3=CHECKPOINT, 4=COMMIT
//! u64 seq
//! u64 timestamp_us
//! u32 key_len
//! u32 value_len
//! u32 crc32       CRC32 over key ‖ value
//! [key bytes][value bytes]
//! ```
//!
//! # Rotation
//!
//! Exactly one segment is open for append. When its size crosses
//! [`WalConfig::segment_size`] the segment is closed and a new one with
//! the next id is opened. `open()` always starts a fresh segment rather
//! than appending to an existing one — a previous crash may have left a
//! torn tail, and appending after a tear would make those records
//! unreachable to replay.
//!
//! # Replay
//!
//! [`Wal::replay`] walks every segment in id order and yields the records
//! that verify. A torn or corrupt tail stops that segment with a `warn!`
//! (records before the tear are kept, the torn record is discarded) and
//! replay continues with the next segment. Only real I/O failures are
//! surfaced as errors.
//!
//! # Durability
//!
//! With [`WalConfig::sync_writes`] every append is followed by an fsync;
//! otherwise durability is deferred to [`Wal::sync`] (the engine's
//! `flush` fence).

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::error::ErrorCode;
use crate::time;

/// Byte size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 32;

/// Sanity cap applied to replayed key/value lengths; anything larger is
/// treated as a torn record.
const MAX_FIELD_LEN: u32 = 16 * 1024 * 1024;

const TYPE_PUT: u32 = 1;
const TYPE_DELETE: u32 = 2;
const TYPE_CHECKPOINT: u32 = 3;
const TYPE_COMMIT: u32 = 4;

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record exceeded the configured size limits.
    #[error("record too large ({0} bytes)")]
    RecordTooLarge(usize),

    /// A segment file name did not match `wal-{id:016}.log`.
    #[error("unrecognised WAL segment name: {0}")]
    BadSegmentName(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal WAL error: {0}")]
    Internal(String),
}

impl WalError {
    /// Maps onto the stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::IoError,
            Self::RecordTooLarge(_) => ErrorCode::InvalidParam,
            Self::BadSegmentName(_) => ErrorCode::File,
            Self::Internal(_) => ErrorCode::Sys,
        }
    }
}

/// WAL tuning knobs.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Segment rotation threshold in bytes.
    pub segment_size: u64,
    /// Fsync after every record.
    pub sync_writes: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: 16 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

/// A logical WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Store `key` → `value` at `seq`.
    Put {
        /// Sequence number of the mutation.
        seq: u64,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Tombstone for `key` at `seq`.
    Delete {
        /// Sequence number of the mutation.
        seq: u64,
        /// Key bytes.
        key: Vec<u8>,
    },
    /// Durability checkpoint marker.
    Checkpoint {
        /// Sequence number the checkpoint covers.
        seq: u64,
    },
    /// Batch commit marker.
    Commit {
        /// Highest sequence number in the committed batch.
        seq: u64,
    },
}

impl WalRecord {
    /// The sequence number carried by this record.
    pub fn seq(&self) -> u64 {
        match self {
            Self::Put { seq, .. }
            | Self::Delete { seq, .. }
            | Self::Checkpoint { seq }
            | Self::Commit { seq } => *seq,
        }
    }

    fn type_tag(&self) -> u32 {
        match self {
            Self::Put { .. } => TYPE_PUT,
            Self::Delete { .. } => TYPE_DELETE,
            Self::Checkpoint { .. } => TYPE_CHECKPOINT,
            Self::Commit { .. } => TYPE_COMMIT,
        }
    }

    fn payload(&self) -> (&[u8], &[u8]) {
        match self {
            Self::Put { key, value, .. } => (key.as_slice(), value.as_slice()),
            Self::Delete { key, .. } => (key.as_slice(), &[]),
            Self::Checkpoint { .. } | Self::Commit { .. } => (&[], &[]),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SegmentMeta {
    id: u64,
    /// Highest seq recorded in the segment; `None` until replay or an
    /// append has observed it.
    last_seq: Option<u64>,
}

struct ActiveSegment {
    file: File,
    id: u64,
    size: u64,
    last_seq: Option<u64>,
}

/// The write-ahead log over one directory of segments.
pub struct Wal {
    dir: PathBuf,
    config: WalConfig,
    /// Closed segments, ascending by id.
    closed: Mutex<Vec<SegmentMeta>>,
    active: Mutex<ActiveSegment>,
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("wal-{id:016}.log"))
}

fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}

impl Wal {
    /// Opens the WAL rooted at `dir`, creating the directory when absent.
    ///
    /// Pre-existing segments become the replay set; appends go to a fresh
    /// segment with the next id.
    pub fn open(dir: impl AsRef<Path>, config: WalConfig) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut existing: Vec<SegmentMeta> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = parse_segment_id(name) {
                existing.push(SegmentMeta { id, last_seq: None });
            }
        }
        existing.sort_by_key(|meta| meta.id);

        let next_id = existing.last().map_or(0, |meta| meta.id + 1);
        let active = Self::create_segment(&dir, next_id)?;
        info!(
            dir = %dir.display(),
            segments = existing.len(),
            active_id = next_id,
            "WAL opened"
        );

        Ok(Self {
            dir,
            config,
            closed: Mutex::new(existing),
            active: Mutex::new(active),
        })
    }

    fn create_segment(dir: &Path, id: u64) -> Result<ActiveSegment, WalError> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        debug!(path = %path.display(), id, "WAL segment created");
        Ok(ActiveSegment {
            file,
            id,
            size: 0,
            last_seq: None,
        })
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, ActiveSegment> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_closed(&self) -> std::sync::MutexGuard<'_, Vec<SegmentMeta>> {
        match self.closed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Serializes one record into its on-disk frame.
    fn encode_record(record: &WalRecord) -> Result<Vec<u8>, WalError> {
        let (key, value) = record.payload();
        if key.len() as u64 > u64::from(MAX_FIELD_LEN)
            || value.len() as u64 > u64::from(MAX_FIELD_LEN)
        {
            return Err(WalError::RecordTooLarge(key.len() + value.len()));
        }

        let mut crc = Crc32::new();
        crc.update(key);
        crc.update(value);
        let checksum = crc.finalize();

        let mut frame = Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len());
        frame.extend_from_slice(&record.type_tag().to_le_bytes());
        frame.extend_from_slice(&record.seq().to_le_bytes());
        frame.extend_from_slice(&time::unix_micros().to_le_bytes());
        frame.extend_from_slice(&(key.len() as u32).to_le_bytes());
        frame.extend_from_slice(&(value.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(key);
        frame.extend_from_slice(value);
        Ok(frame)
    }

    /// Appends one record, rotating the segment when it crossed the size
    /// limit. Fsyncs when `sync_writes` is set.
    pub fn append(&self, record: &WalRecord) -> Result<(), WalError> {
        let frame = Self::encode_record(record)?;

        let mut active = self.lock_active();
        if active.size > 0 && active.size + frame.len() as u64 > self.config.segment_size {
            self.rotate_locked(&mut active)?;
        }
        active.file.write_all(&frame)?;
        active.size += frame.len() as u64;
        active.last_seq = Some(record.seq());
        if self.config.sync_writes {
            active.file.sync_data()?;
        }
        trace!(seq = record.seq(), bytes = frame.len(), "WAL record appended");
        Ok(())
    }

    /// Appends a run of records and fsyncs once at the end when asked to.
    ///
    /// Used by the batch writer: per-record fsync would turn an N-entry
    /// batch into N disk round-trips.
    pub fn append_batch(&self, records: &[WalRecord], sync: bool) -> Result<usize, WalError> {
        let mut active = self.lock_active();
        let mut written = 0;
        for record in records {
            let frame = Self::encode_record(record)?;
            if active.size > 0 && active.size + frame.len() as u64 > self.config.segment_size {
                self.rotate_locked(&mut active)?;
            }
            active.file.write_all(&frame)?;
            active.size += frame.len() as u64;
            active.last_seq = Some(record.seq());
            written += 1;
        }
        if sync || self.config.sync_writes {
            active.file.sync_data()?;
        }
        Ok(written)
    }

    fn rotate_locked(&self, active: &mut ActiveSegment) -> Result<(), WalError> {
        active.file.sync_data()?;
        let next = Self::create_segment(&self.dir, active.id + 1)?;
        let old = std::mem::replace(active, next);
        self.lock_closed().push(SegmentMeta {
            id: old.id,
            last_seq: old.last_seq,
        });
        info!(closed_id = old.id, new_id = active.id, "WAL segment rotated");
        Ok(())
    }

    /// Fsyncs the active segment.
    pub fn sync(&self) -> Result<(), WalError> {
        self.lock_active().file.sync_data()?;
        Ok(())
    }

    /// Id of the segment currently open for append.
    pub fn active_segment_id(&self) -> u64 {
        self.lock_active().id
    }

    /// Streaming replay over every segment in id order.
    pub fn replay(&self) -> Result<WalReplay, WalError> {
        let mut ids: Vec<u64> = self.lock_closed().iter().map(|meta| meta.id).collect();
        // The active segment of a previous incarnation is in `closed`;
        // our own active segment is empty at open time but may hold
        // records if replay is called late — include it for completeness.
        ids.push(self.lock_active().id);
        ids.sort_unstable();
        Ok(WalReplay {
            dir: self.dir.clone(),
            ids,
            cursor: 0,
            current: None,
            segment_last_seq: None,
            observed: Vec::new(),
        })
    }

    /// Replays and feeds every record to `apply`, then records the
    /// per-segment high-water marks needed by [`Wal::prune`].
    pub fn replay_into(
        &self,
        mut apply: impl FnMut(WalRecord) -> Result<(), WalError>,
    ) -> Result<u64, WalError> {
        let mut replay = self.replay()?;
        let mut max_seq = 0;
        for record in replay.by_ref() {
            let record = record?;
            max_seq = max_seq.max(record.seq());
            apply(record)?;
        }
        let observed = replay.finish();
        let mut closed = self.lock_closed();
        for (id, last_seq) in observed {
            if let Some(meta) = closed.iter_mut().find(|meta| meta.id == id) {
                meta.last_seq = Some(last_seq);
            }
        }
        Ok(max_seq)
    }

    /// Unlinks closed segments whose records are all covered by
    /// `up_to_seq`. Segments with an unknown high-water mark are kept.
    pub fn prune(&self, up_to_seq: u64) -> Result<usize, WalError> {
        let mut removed = 0;
        let mut closed = self.lock_closed();
        closed.retain(|meta| {
            let prunable = matches!(meta.last_seq, Some(last) if last <= up_to_seq);
            if prunable {
                let path = segment_path(&self.dir, meta.id);
                match fs::remove_file(&path) {
                    Ok(()) => {
                        removed += 1;
                        debug!(id = meta.id, up_to_seq, "WAL segment pruned");
                        false
                    }
                    Err(e) => {
                        warn!(id = meta.id, error = %e, "failed to prune WAL segment");
                        true
                    }
                }
            } else {
                true
            }
        });
        Ok(removed)
    }

    /// Total bytes currently sitting in the active segment.
    pub fn active_segment_size(&self) -> u64 {
        self.lock_active().size
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(error = %e, "WAL sync failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Replay iterator
// ------------------------------------------------------------------------------------------------

/// Streaming replay cursor.
///
/// Yields verified records across all segments in id order. Corrupt or
/// torn tails terminate the affected segment with a `warn!`; the iterator
/// then moves on to the next segment. `Err` items are reserved for real
/// I/O failures.
pub struct WalReplay {
    dir: PathBuf,
    ids: Vec<u64>,
    cursor: usize,
    current: Option<(u64, BufReader<File>)>,
    segment_last_seq: Option<u64>,
    /// `(segment id, highest seq)` pairs for segments fully replayed.
    observed: Vec<(u64, u64)>,
}

enum FrameRead {
    Record(WalRecord),
    EndOfSegment,
    Torn(&'static str),
}

impl WalReplay {
    /// Consumes the cursor, returning the per-segment high-water marks
    /// observed during iteration.
    pub fn finish(mut self) -> Vec<(u64, u64)> {
        if let (Some((id, _)), Some(last)) = (&self.current, self.segment_last_seq.take()) {
            self.observed.push((*id, last));
        }
        self.observed
    }

    fn open_next_segment(&mut self) -> Result<bool, WalError> {
        while self.cursor < self.ids.len() {
            let id = self.ids[self.cursor];
            self.cursor += 1;
            let path = segment_path(&self.dir, id);
            match File::open(&path) {
                Ok(file) => {
                    self.current = Some((id, BufReader::new(file)));
                    self.segment_last_seq = None;
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(WalError::Io(e)),
            }
        }
        Ok(false)
    }

    fn read_frame(reader: &mut BufReader<File>) -> Result<FrameRead, WalError> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(FrameRead::EndOfSegment);
            }
            Err(e) => return Err(WalError::Io(e)),
        }

        let type_tag = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let seq = u64::from_le_bytes([
            header[4], header[5], header[6], header[7], header[8], header[9], header[10],
            header[11],
        ]);
        let _timestamp_us = u64::from_le_bytes([
            header[12], header[13], header[14], header[15], header[16], header[17], header[18],
            header[19],
        ]);
        let key_len = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        let value_len = u32::from_le_bytes([header[24], header[25], header[26], header[27]]);
        let stored_crc = u32::from_le_bytes([header[28], header[29], header[30], header[31]]);

        if !(TYPE_PUT..=TYPE_COMMIT).contains(&type_tag) {
            return Ok(FrameRead::Torn("unknown record type"));
        }
        if key_len > MAX_FIELD_LEN || value_len > MAX_FIELD_LEN {
            return Ok(FrameRead::Torn("implausible field length"));
        }

        let mut key = vec![0u8; key_len as usize];
        if let Err(e) = reader.read_exact(&mut key) {
            return if e.kind() == io::ErrorKind::UnexpectedEof {
                Ok(FrameRead::Torn("truncated key"))
            } else {
                Err(WalError::Io(e))
            };
        }
        let mut value = vec![0u8; value_len as usize];
        if let Err(e) = reader.read_exact(&mut value) {
            return if e.kind() == io::ErrorKind::UnexpectedEof {
                Ok(FrameRead::Torn("truncated value"))
            } else {
                Err(WalError::Io(e))
            };
        }

        let mut crc = Crc32::new();
        crc.update(&key);
        crc.update(&value);
        if crc.finalize() != stored_crc {
            return Ok(FrameRead::Torn("checksum mismatch"));
        }

        let record = match type_tag {
            TYPE_PUT => WalRecord::Put { seq, key, value },
            TYPE_DELETE => WalRecord::Delete { seq, key },
            TYPE_CHECKPOINT => WalRecord::Checkpoint { seq },
            _ => WalRecord::Commit { seq },
        };
        Ok(FrameRead::Record(record))
    }
}

impl Iterator for WalReplay {
    type Item = Result<WalRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.open_next_segment() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }

            let (id, reader) = self.current.as_mut()?;
            let id = *id;
            match Self::read_frame(reader) {
                Ok(FrameRead::Record(record)) => {
                    self.segment_last_seq = Some(record.seq());
                    return Some(Ok(record));
                }
                Ok(FrameRead::EndOfSegment) => {
                    if let Some(last) = self.segment_last_seq.take() {
                        self.observed.push((id, last));
                    }
                    self.current = None;
                }
                Ok(FrameRead::Torn(reason)) => {
                    warn!(
                        segment = id,
                        reason, "WAL replay stopped at torn record; truncating segment tail"
                    );
                    if let Some(last) = self.segment_last_seq.take() {
                        self.observed.push((id, last));
                    }
                    self.current = None;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
