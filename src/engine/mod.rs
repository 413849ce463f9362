//! The uniform engine contract.
//!
//! Every storage engine in the crate — array, hash, red–black tree,
//! B+Tree, and LSM-tree — implements [`StorageEngine`]. Callers pick an
//! engine through the [factory](crate::factory) and then speak one
//! vocabulary: point `put`/`get`/`delete`/`update`, `count`, ordered
//! `range_scan`/`prefix_scan`, snapshot iteration, and the
//! `flush`/`compact` lifecycle fences.
//!
//! # Guarantees common to all engines
//!
//! - Empty keys are rejected with [`EngineError::InvalidParam`].
//! - `get` returns an **owned** copy of the value; results never borrow
//!   engine internals, and container results own their element storage
//!   end to end.
//! - Every mutation receives a strictly increasing sequence number from
//!   the engine's own sequence source; reads can observe it through
//!   [`StorageEngine::get_versioned`].
//! - Unordered engines answer `range_scan` with
//!   [`EngineError::InvalidParam`]; the
//!   [query manager](crate::query) falls back to iterator scans for them.
//! - Every operation updates the engine's [`EngineStats`] counters.

pub mod array;
pub mod hash;
pub mod rbtree;

#[cfg(test)]
mod tests;

use std::io;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use thiserror::Error;

use crate::error::ErrorCode;
use crate::time;

// ------------------------------------------------------------------------------------------------
// Engine identity and lifecycle
// ------------------------------------------------------------------------------------------------

/// Tag identifying a concrete engine implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// Linear array engine for tiny tables.
    Array,
    /// Sharded hash engine (unordered).
    Hash,
    /// Arena-backed red–black tree engine.
    RbTree,
    /// B+Tree engine.
    BTree,
    /// Log-structured merge tree engine.
    Lsm,
}

impl EngineKind {
    /// Parses a configuration selector string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "array" => Some(Self::Array),
            "hash" => Some(Self::Hash),
            "rbtree" => Some(Self::RbTree),
            "btree" => Some(Self::BTree),
            "lsm" => Some(Self::Lsm),
            _ => None,
        }
    }

    /// The canonical selector string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::Hash => "hash",
            Self::RbTree => "rbtree",
            Self::BTree => "btree",
            Self::Lsm => "lsm",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an engine handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Constructed but not yet serving operations.
    Init = 0,
    /// Open and serving operations.
    Running = 1,
    /// A fatal error occurred; only `close` is legal.
    Error = 2,
    /// Closed; all operations are rejected.
    Shutdown = 3,
}

/// Atomically updated [`EngineState`] cell.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Creates a cell in the given initial state.
    pub fn new(state: EngineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Reads the current state.
    pub fn get(&self) -> EngineState {
        match self.0.load(Ordering::SeqCst) {
            0 => EngineState::Init,
            1 => EngineState::Running,
            2 => EngineState::Error,
            _ => EngineState::Shutdown,
        }
    }

    /// Stores a new state.
    pub fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Returns an error unless the engine is `Running`.
    pub fn ensure_running(&self) -> Result<(), EngineError> {
        match self.get() {
            EngineState::Running => Ok(()),
            other => Err(EngineError::InvalidState(format!(
                "engine is {other:?}, expected Running"
            ))),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// User-facing error for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid argument (empty key, bad range, unknown selector, …).
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Key does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// Key already exists.
    #[error("key already exists")]
    KeyExists,

    /// Key exceeds the engine's length limit.
    #[error("key length {len} exceeds limit {max}")]
    KeyTooLong { len: usize, max: usize },

    /// Value exceeds the engine's length limit.
    #[error("value length {len} exceeds limit {max}")]
    ValueTooLarge { len: usize, max: usize },

    /// Operation attempted in an illegal lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation not supported by this engine.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Soft deadline exceeded; partial results may accompany this.
    #[error("operation timed out")]
    Timeout,

    /// Operation cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// Batch entry-count cap reached.
    #[error("batch is full")]
    BatchFull,

    /// Batch memory cap reached.
    #[error("batch memory limit exceeded")]
    BatchTooLarge,

    /// On-disk data failed integrity verification.
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// Background compaction failure surfaced to the caller.
    #[error("compaction failed: {0}")]
    CompactionFailed(String),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] crate::wal::WalError),

    /// Error from the memtable layer.
    #[error("memtable error: {0}")]
    Memtable(#[from] crate::memtable::MemtableError),

    /// Error from the SSTable layer.
    #[error("table error: {0}")]
    Table(#[from] crate::sstable::TableError),

    /// Error from the manifest.
    #[error("manifest error: {0}")]
    Manifest(#[from] crate::manifest::ManifestError),

    /// Internal invariant violation (poisoned lock, impossible state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Maps this error onto its stable numeric [`ErrorCode`].
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParam(_) => ErrorCode::InvalidParam,
            Self::KeyNotFound => ErrorCode::KeyNotFound,
            Self::KeyExists => ErrorCode::KeyExists,
            Self::KeyTooLong { .. } => ErrorCode::KeyTooLong,
            Self::ValueTooLarge { .. } => ErrorCode::InvalidParam,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::NotSupported(_) => ErrorCode::NotSupported,
            Self::Timeout => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::BatchFull => ErrorCode::BatchFull,
            Self::BatchTooLarge => ErrorCode::BatchTooLarge,
            Self::Corrupted(_) => ErrorCode::Corrupted,
            Self::CompactionFailed(_) => ErrorCode::CompactionFailed,
            Self::Io(_) => ErrorCode::IoError,
            Self::Wal(e) => e.code(),
            Self::Memtable(e) => e.code(),
            Self::Table(e) => e.code(),
            Self::Manifest(e) => e.code(),
            Self::Internal(_) => ErrorCode::Sys,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Atomic per-engine operation counters.
///
/// Updated by every operation; cheap enough to sit outside the engine's
/// data locks.
#[derive(Debug, Default)]
pub struct EngineStats {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    last_op_ms: AtomicU64,
}

impl EngineStats {
    /// Fresh zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a read of `bytes` payload bytes.
    pub fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_op_ms.store(time::unix_millis(), Ordering::Relaxed);
    }

    /// Records a write of `bytes` payload bytes.
    pub fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_op_ms.store(time::unix_millis(), Ordering::Relaxed);
    }

    /// Records a delete.
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.last_op_ms.store(time::unix_millis(), Ordering::Relaxed);
    }

    /// Takes a consistent-enough snapshot of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_count: self.reads.load(Ordering::Relaxed),
            write_count: self.writes.load(Ordering::Relaxed),
            delete_count: self.deletes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            last_operation_ms: self.last_op_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`EngineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Number of point reads served.
    pub read_count: u64,
    /// Number of puts/updates applied.
    pub write_count: u64,
    /// Number of deletes applied.
    pub delete_count: u64,
    /// Total value bytes returned to callers.
    pub bytes_read: u64,
    /// Total key+value bytes accepted from callers.
    pub bytes_written: u64,
    /// Wall-clock milliseconds of the most recent operation.
    pub last_operation_ms: u64,
}

// ------------------------------------------------------------------------------------------------
// Shared value types
// ------------------------------------------------------------------------------------------------

/// An owned key-value pair returned by scans and iterators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// The key bytes.
    pub key: Vec<u8>,
    /// The value bytes.
    pub value: Vec<u8>,
}

impl KvPair {
    /// Convenience constructor.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A key interval with per-endpoint inclusivity.
///
/// `None` endpoints are unbounded. The empty range (start > end) is legal
/// and simply matches nothing.
#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    /// Lower endpoint; `None` = unbounded below.
    pub start: Option<Vec<u8>>,
    /// Upper endpoint; `None` = unbounded above.
    pub end: Option<Vec<u8>>,
    /// Whether `start` itself is inside the range.
    pub start_inclusive: bool,
    /// Whether `end` itself is inside the range.
    pub end_inclusive: bool,
}

impl KeyRange {
    /// The unbounded range covering every key.
    pub fn all() -> Self {
        Self {
            start: None,
            end: None,
            start_inclusive: true,
            end_inclusive: false,
        }
    }

    /// A closed or half-open range between two concrete keys.
    pub fn between(
        start: impl Into<Vec<u8>>,
        end: impl Into<Vec<u8>>,
        start_inclusive: bool,
        end_inclusive: bool,
    ) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            start_inclusive,
            end_inclusive,
        }
    }

    /// The half-open range `[start, end)`.
    pub fn half_open(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self::between(start, end, true, false)
    }

    /// Whether `key` falls inside this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(start) = &self.start {
            match key.cmp(start.as_slice()) {
                std::cmp::Ordering::Less => return false,
                std::cmp::Ordering::Equal if !self.start_inclusive => return false,
                _ => {}
            }
        }
        if let Some(end) = &self.end {
            match key.cmp(end.as_slice()) {
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal if !self.end_inclusive => return false,
                _ => {}
            }
        }
        true
    }

    /// Bounds usable with `BTreeMap::range`.
    pub fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        let lo = match &self.start {
            None => Bound::Unbounded,
            Some(k) if self.start_inclusive => Bound::Included(k.as_slice()),
            Some(k) => Bound::Excluded(k.as_slice()),
        };
        let hi = match &self.end {
            None => Bound::Unbounded,
            Some(k) if self.end_inclusive => Bound::Included(k.as_slice()),
            Some(k) => Bound::Excluded(k.as_slice()),
        };
        (lo, hi)
    }

    /// True when the range can match nothing (start strictly above end,
    /// or equal endpoints with an exclusive side).
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => match s.cmp(e) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => !(self.start_inclusive && self.end_inclusive),
                std::cmp::Ordering::Less => false,
            },
            _ => false,
        }
    }
}

/// Snapshot cursor over an engine's live pairs in ascending key order
/// (insertion-order snapshot for unordered engines).
pub struct EngineIter {
    inner: Box<dyn Iterator<Item = KvPair> + Send>,
}

impl EngineIter {
    /// Wraps an iterator of owned pairs.
    pub fn new(inner: impl Iterator<Item = KvPair> + Send + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl Iterator for EngineIter {
    type Item = KvPair;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

// ------------------------------------------------------------------------------------------------
// Batch application
// ------------------------------------------------------------------------------------------------

/// One operation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Store or overwrite `key`.
    Put {
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove `key` (tombstone in the LSM).
    Delete {
        /// Key bytes.
        key: Vec<u8>,
    },
}

impl BatchOp {
    /// The key this operation targets.
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Approximate in-memory footprint of this operation.
    pub fn weight(&self) -> usize {
        match self {
            Self::Put { key, value } => key.len() + value.len(),
            Self::Delete { key } => key.len(),
        }
    }
}

/// Knobs for [`StorageEngine::apply_batch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchApplyOptions {
    /// Stop at the first failing entry instead of continuing.
    pub atomic: bool,
    /// Fsync the WAL once after the run (LSM only).
    pub sync_wal: bool,
    /// Soft deadline: once it expires, remaining entries fail with
    /// [`EngineError::Timeout`] instead of being attempted.
    pub timeout: Option<std::time::Duration>,
}

/// Outcome of a batch application.
#[derive(Debug, Default)]
pub struct BatchApplyOutcome {
    /// Entries applied successfully.
    pub applied: u64,
    /// Entries that failed (0 or, without `atomic`, possibly more).
    pub failed: u64,
    /// WAL records written on behalf of the batch.
    pub wal_records: u64,
    /// First failure, as `(entry index, error)`.
    pub first_error: Option<(usize, EngineError)>,
}

// ------------------------------------------------------------------------------------------------
// The contract
// ------------------------------------------------------------------------------------------------

/// Uniform operation surface implemented by every engine.
pub trait StorageEngine: Send + Sync {
    /// The engine's type tag.
    fn kind(&self) -> EngineKind;

    /// Current lifecycle state.
    fn state(&self) -> EngineState;

    /// Whether this engine maintains keys in lexicographic order (and so
    /// supports native `range_scan`).
    fn ordered(&self) -> bool;

    /// Stores or overwrites `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError>;

    /// Returns an owned copy of the value, or `None` when absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.get_versioned(key)?.map(|(value, _seq)| value))
    }

    /// Like [`get`](Self::get) but also reports the sequence number of
    /// the version read.
    fn get_versioned(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, EngineError>;

    /// Removes `key`. Returns [`EngineError::KeyNotFound`] when absent.
    fn delete(&self, key: &[u8]) -> Result<(), EngineError>;

    /// Overwrites `key`, failing with [`EngineError::KeyNotFound`] when
    /// the key does not already exist.
    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError>;

    /// Number of live (non-tombstone) keys.
    fn count(&self) -> Result<u64, EngineError>;

    /// Ordered scan of at most `limit` pairs inside `range`
    /// (`limit == 0` means unlimited). Unordered engines return
    /// [`EngineError::InvalidParam`].
    fn range_scan(&self, range: &KeyRange, limit: usize) -> Result<Vec<KvPair>, EngineError>;

    /// All pairs whose key starts with `prefix`, in ascending key order.
    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<KvPair>, EngineError>;

    /// Snapshot cursor over the live pairs.
    fn iter(&self) -> Result<EngineIter, EngineError>;

    /// Engine-specific maintenance (LSM: schedule compaction; trees:
    /// no-op).
    fn compact(&self) -> Result<(), EngineError>;

    /// Durability fence. The LSM freezes the active memtable, flushes
    /// every frozen one, and fsyncs the WAL; in-memory engines no-op.
    fn flush(&self) -> Result<(), EngineError>;

    /// Graceful shutdown; idempotent.
    fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Snapshot of the statistics counters.
    fn stats(&self) -> StatsSnapshot;

    /// Applies a pre-validated operation list.
    ///
    /// The default implementation loops over the single-entry APIs. The
    /// LSM engine overrides this to batch its WAL appends and fsync once.
    /// `Delete` of an absent key is not counted as a failure here — batch
    /// semantics treat it as a no-op tombstone.
    fn apply_batch(
        &self,
        ops: &[BatchOp],
        opts: &BatchApplyOptions,
    ) -> Result<BatchApplyOutcome, EngineError> {
        let deadline = opts.timeout.map(|t| std::time::Instant::now() + t);
        let mut outcome = BatchApplyOutcome::default();
        for (idx, op) in ops.iter().enumerate() {
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    outcome.failed += (ops.len() - idx) as u64;
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some((idx, EngineError::Timeout));
                    }
                    break;
                }
            }
            let res = match op {
                BatchOp::Put { key, value } => self.put(key, value),
                BatchOp::Delete { key } => match self.delete(key) {
                    Err(EngineError::KeyNotFound) => Ok(()),
                    other => other,
                },
            };
            match res {
                Ok(()) => outcome.applied += 1,
                Err(err) => {
                    outcome.failed += 1;
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some((idx, err));
                    }
                    if opts.atomic {
                        outcome.failed += (ops.len() - idx - 1) as u64;
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }
}

/// Rejects empty keys; shared by every engine's entry points.
pub(crate) fn check_key(key: &[u8]) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(EngineError::InvalidParam("empty key".into()));
    }
    Ok(())
}

/// The exclusive upper bound of the key interval sharing `prefix`.
///
/// Increments the last non-`0xFF` byte and truncates everything after it.
/// Returns `None` when every byte is `0xFF` (or the prefix is empty), in
/// which case the interval has no upper bound.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let cut = prefix.iter().rposition(|&b| b != 0xFF)?;
    let mut bound = prefix[..=cut].to_vec();
    bound[cut] += 1;
    Some(bound)
}

/// Monotonic sequence-number source owned by each engine handle.
#[derive(Debug)]
pub struct SequenceSource(AtomicU64);

impl SequenceSource {
    /// Starts issuing from `first`.
    pub fn starting_at(first: u64) -> Self {
        Self(AtomicU64::new(first))
    }

    /// Issues the next sequence number.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest sequence number issued so far (0 when none).
    pub fn last_issued(&self) -> u64 {
        self.0.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Fast-forwards the source so the next issue is `last_seen + 1`.
    /// Recovery-only; must precede any concurrent writes.
    pub fn advance_past(&self, last_seen: u64) {
        let mut current = self.0.load(Ordering::SeqCst);
        while current <= last_seen {
            match self.0.compare_exchange(
                current,
                last_seen + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}
