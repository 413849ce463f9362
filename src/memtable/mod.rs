//! In-memory write buffer of the LSM engine.
//!
//! A [`Memtable`] is an ordered map from key to the *latest* version of
//! that key: `(seq, value-or-tombstone)`. The WAL, not the memtable, is
//! the durability story — the engine appends there first and only then
//! calls into this module.
//!
//! [`MemtableSet`] owns one ACTIVE memtable and a bounded FIFO of FROZEN
//! ones. A write that would push the active table past `max_size`
//! freezes it (when auto-freeze is on), enqueues it, and swaps in a
//! fresh table. Once frozen, a table accepts no further mutation —
//! readers see a stable snapshot while the flush pipeline drains it to
//! an SSTable.
//!
//! Lookups probe ACTIVE first, then FROZEN newest → oldest; the first
//! table that knows the key answers, and a tombstone there masks any
//! older version further down the stack.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, trace};

use crate::engine::KeyRange;
use crate::error::ErrorCode;

/// Default freeze threshold: 4 MiB.
pub const DEFAULT_MAX_SIZE: usize = 4 * 1024 * 1024;
/// Default bound on the frozen FIFO.
pub const DEFAULT_MAX_FROZEN: usize = 5;

/// Errors from memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Write attempted against a frozen table.
    #[error("memtable is frozen")]
    Frozen,

    /// The active table is at capacity and auto-freeze is off.
    #[error("memtable is full; flush required")]
    Full,

    /// The frozen FIFO is at capacity; a flush must drain it first.
    #[error("frozen memtable limit reached")]
    FrozenLimit,
}

impl MemtableError {
    /// Maps onto the stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Frozen => ErrorCode::InvalidState,
            Self::Full | Self::FrozenLimit => ErrorCode::Busy,
        }
    }
}

/// Latest version of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemEntry {
    /// Sequence number of the mutation.
    pub seq: u64,
    /// Value bytes; `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
}

impl MemEntry {
    /// Whether this entry is a delete marker.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    fn weight(&self, key_len: usize) -> usize {
        key_len + self.value.as_ref().map_or(0, Vec::len) + std::mem::size_of::<Self>()
    }
}

/// Result of a memtable lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableLookup {
    /// Live value present at `seq`.
    Found {
        /// Owned copy of the value.
        value: Vec<u8>,
        /// Sequence number of the version read.
        seq: u64,
    },
    /// Key was deleted at `seq`; older layers must not resurrect it.
    Tombstone {
        /// Sequence number of the tombstone.
        seq: u64,
    },
    /// The table holds no version of the key.
    Missing,
}

struct MemtableCore {
    tree: BTreeMap<Vec<u8>, MemEntry>,
    bytes: usize,
}

/// One ordered in-memory table.
pub struct Memtable {
    /// Identity within its [`MemtableSet`]; newer tables have larger ids.
    id: u64,
    core: RwLock<MemtableCore>,
    max_size: usize,
    frozen: AtomicBool,
    max_seq: AtomicU64,
    min_seq: AtomicU64,
}

impl Memtable {
    fn new(id: u64, max_size: usize) -> Self {
        Self {
            id,
            core: RwLock::new(MemtableCore {
                tree: BTreeMap::new(),
                bytes: 0,
            }),
            max_size,
            frozen: AtomicBool::new(false),
            max_seq: AtomicU64::new(0),
            min_seq: AtomicU64::new(u64::MAX),
        }
    }

    fn read_core(&self) -> std::sync::RwLockReadGuard<'_, MemtableCore> {
        match self.core.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_core(&self) -> std::sync::RwLockWriteGuard<'_, MemtableCore> {
        match self.core.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Table identity within its set.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the table has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Highest sequence number applied (0 when empty).
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::SeqCst)
    }

    /// Lowest sequence number applied (`u64::MAX` when empty).
    pub fn min_seq(&self) -> u64 {
        self.min_seq.load(Ordering::SeqCst)
    }

    /// Approximate heap footprint of the stored entries.
    pub fn approximate_size(&self) -> usize {
        self.read_core().bytes
    }

    /// Number of versions held (tombstones included).
    pub fn entry_count(&self) -> usize {
        self.read_core().tree.len()
    }

    /// Applies one mutation. `value: None` records a tombstone.
    ///
    /// Fails with [`MemtableError::Frozen`] on a frozen table, or
    /// [`MemtableError::Full`] when the write would push a non-empty
    /// table past its size budget.
    pub fn apply(&self, key: &[u8], seq: u64, value: Option<Vec<u8>>) -> Result<(), MemtableError> {
        if self.is_frozen() {
            return Err(MemtableError::Frozen);
        }
        let entry = MemEntry { seq, value };
        let weight = entry.weight(key.len());

        let mut core = self.write_core();
        if core.bytes > 0 && core.bytes + weight > self.max_size {
            return Err(MemtableError::Full);
        }
        if let Some(old) = core.tree.insert(key.to_vec(), entry) {
            let old_weight = old.weight(key.len());
            core.bytes = core.bytes.saturating_sub(old_weight);
        }
        core.bytes += weight;
        drop(core);

        self.max_seq.fetch_max(seq, Ordering::SeqCst);
        self.min_seq.fetch_min(seq, Ordering::SeqCst);
        trace!(seq, key_len = key.len(), "memtable mutation applied");
        Ok(())
    }

    /// Marks the table frozen; all further writes are rejected.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Looks up the latest version of `key` in this table alone.
    pub fn lookup(&self, key: &[u8]) -> MemtableLookup {
        let core = self.read_core();
        match core.tree.get(key) {
            Some(entry) => match &entry.value {
                Some(value) => MemtableLookup::Found {
                    value: value.clone(),
                    seq: entry.seq,
                },
                None => MemtableLookup::Tombstone { seq: entry.seq },
            },
            None => MemtableLookup::Missing,
        }
    }

    /// Ordered snapshot of the versions inside `range` (tombstones
    /// included — the caller resolves visibility across layers).
    pub fn scan(&self, range: &KeyRange) -> Vec<(Vec<u8>, MemEntry)> {
        if range.is_empty() {
            return Vec::new();
        }
        let core = self.read_core();
        core.tree
            .range::<[u8], _>(range.bounds())
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Full ordered snapshot for the flush pipeline. Does not mutate the
    /// table; the entries are sufficient to rebuild this table's state.
    pub fn snapshot_for_flush(&self) -> Vec<(Vec<u8>, MemEntry)> {
        let core = self.read_core();
        core.tree
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }
}

/// Outcome of a [`MemtableSet::apply`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// The active table was frozen and replaced during this write.
    pub froze: bool,
    /// The frozen FIFO has reached the flush watermark.
    pub should_flush: bool,
}

/// Active + frozen memtable manager.
pub struct MemtableSet {
    max_size: usize,
    max_frozen: usize,
    auto_freeze: bool,
    next_id: AtomicU64,
    active: RwLock<Arc<Memtable>>,
    /// Newest first.
    frozen: RwLock<VecDeque<Arc<Memtable>>>,
}

impl MemtableSet {
    /// Creates a set with the given freeze threshold and FIFO bound.
    pub fn new(max_size: usize, max_frozen: usize, auto_freeze: bool) -> Self {
        Self {
            max_size,
            max_frozen: max_frozen.max(1),
            auto_freeze,
            next_id: AtomicU64::new(1),
            active: RwLock::new(Arc::new(Memtable::new(0, max_size))),
            frozen: RwLock::new(VecDeque::new()),
        }
    }

    fn read_active(&self) -> Arc<Memtable> {
        match self.active.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn read_frozen(&self) -> Vec<Arc<Memtable>> {
        match self.frozen.read() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Applies one mutation, freezing the active table when needed.
    pub fn apply(
        &self,
        key: &[u8],
        seq: u64,
        value: Option<Vec<u8>>,
    ) -> Result<ApplyOutcome, MemtableError> {
        match self.read_active().apply(key, seq, value.clone()) {
            Ok(()) => Ok(ApplyOutcome {
                froze: false,
                should_flush: self.should_flush(),
            }),
            Err(MemtableError::Full) if self.auto_freeze => {
                self.freeze_active()?;
                self.read_active().apply(key, seq, value)?;
                Ok(ApplyOutcome {
                    froze: true,
                    should_flush: self.should_flush(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Freezes the active table and swaps in a fresh one. Returns `None`
    /// when the active table was empty (a concurrent writer may already
    /// have frozen it) — there is nothing to flush in that case.
    ///
    /// Fails with [`MemtableError::FrozenLimit`] when the FIFO is full —
    /// the caller must drain a flush before retrying.
    pub fn freeze_active(&self) -> Result<Option<Arc<Memtable>>, MemtableError> {
        let mut frozen = match self.frozen.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if frozen.len() >= self.max_frozen {
            return Err(MemtableError::FrozenLimit);
        }
        let mut active = match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if active.approximate_size() == 0 {
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let fresh = Arc::new(Memtable::new(id, self.max_size));
        let old = std::mem::replace(&mut *active, fresh);
        old.freeze();
        debug!(
            frozen_id = old.id(),
            new_active_id = id,
            queue_depth = frozen.len() + 1,
            "active memtable frozen"
        );
        frozen.push_front(Arc::clone(&old));
        Ok(Some(old))
    }

    /// Whether the frozen FIFO has reached the flush watermark
    /// (half of its capacity, rounded up).
    pub fn should_flush(&self) -> bool {
        self.frozen_count() >= self.max_frozen.div_ceil(2)
    }

    /// Number of frozen tables awaiting flush.
    pub fn frozen_count(&self) -> usize {
        match self.frozen.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// The oldest frozen table, if any. The table stays in the FIFO —
    /// readers keep seeing it until [`MemtableSet::remove_frozen`].
    pub fn oldest_frozen(&self) -> Option<Arc<Memtable>> {
        match self.frozen.read() {
            Ok(guard) => guard.back().cloned(),
            Err(poisoned) => poisoned.into_inner().back().cloned(),
        }
    }

    /// Drops a flushed table from the FIFO by id.
    pub fn remove_frozen(&self, id: u64) -> bool {
        let mut frozen = match self.frozen.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = frozen.len();
        frozen.retain(|table| table.id() != id);
        before != frozen.len()
    }

    /// Looks `key` up across active then frozen (newest → oldest).
    pub fn lookup(&self, key: &[u8]) -> MemtableLookup {
        match self.read_active().lookup(key) {
            MemtableLookup::Missing => {}
            hit => return hit,
        }
        for table in self.read_frozen() {
            match table.lookup(key) {
                MemtableLookup::Missing => continue,
                hit => return hit,
            }
        }
        MemtableLookup::Missing
    }

    /// The active table (for flush orchestration and stats).
    pub fn active(&self) -> Arc<Memtable> {
        self.read_active()
    }

    /// Every table, newest first (active included).
    pub fn all_tables(&self) -> Vec<Arc<Memtable>> {
        let mut tables = vec![self.read_active()];
        tables.extend(self.read_frozen());
        tables
    }

    /// Highest sequence number across every table.
    pub fn max_seq(&self) -> u64 {
        self.all_tables()
            .iter()
            .map(|table| table.max_seq())
            .max()
            .unwrap_or(0)
    }
}
