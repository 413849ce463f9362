//! Level registry: which tables live on which level.
//!
//! Level 0 receives memtable flushes, so its tables may overlap; they
//! are kept newest-first and every overlapping table must be consulted
//! on a lookup. Levels 1 and deeper hold key-sorted, non-overlapping
//! tables — a lookup binary-searches for the single candidate.
//!
//! A table whose read reports corruption is flagged quarantined: the
//! error surfaces to that caller once, and the file is skipped from then
//! on until a compaction or restart replaces it.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::compaction::{CompactionThresholds, LevelSummary, TableStub};
use crate::engine::KeyRange;
use crate::manifest::NUM_LEVELS;
use crate::sstable::{SsTable, TableEntry, TableError, TableGet};

/// Durable facts about one table file.
#[derive(Debug, Clone)]
pub struct TableMeta {
    /// Manifest-allocated file id.
    pub file_id: u64,
    /// Level the table is registered on.
    pub level: usize,
    /// Absolute file path.
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Entries stored (tombstones included).
    pub entry_count: u64,
    /// Lowest sequence number stored.
    pub min_seq: u64,
    /// Highest sequence number stored.
    pub max_seq: u64,
    /// Smallest key stored.
    pub min_key: Vec<u8>,
    /// Largest key stored.
    pub max_key: Vec<u8>,
}

/// A registered table: metadata plus a lazily opened reader.
pub struct TableHandle {
    /// The table's durable facts.
    pub meta: TableMeta,
    reader: OnceLock<SsTable>,
    quarantined: AtomicBool,
}

impl TableHandle {
    /// Registers a table that has not been opened yet (recovery path).
    pub fn new(meta: TableMeta) -> Self {
        Self {
            meta,
            reader: OnceLock::new(),
            quarantined: AtomicBool::new(false),
        }
    }

    /// Registers a freshly built table with its reader pre-opened.
    pub fn with_reader(meta: TableMeta, reader: SsTable) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(reader);
        Self {
            meta,
            reader: cell,
            quarantined: AtomicBool::new(false),
        }
    }

    /// Whether a corrupted read has sidelined this table.
    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::SeqCst)
    }

    fn reader(&self) -> Result<&SsTable, TableError> {
        if let Some(reader) = self.reader.get() {
            return Ok(reader);
        }
        let opened = SsTable::open(&self.meta.path)?;
        Ok(self.reader.get_or_init(|| opened))
    }

    /// Flags the table unreadable and emits the best-effort report.
    fn quarantine(&self, error: &TableError) {
        if !self.quarantined.swap(true, Ordering::SeqCst) {
            warn!(
                file_id = self.meta.file_id,
                level = self.meta.level,
                path = %self.meta.path.display(),
                %error,
                "table quarantined after corrupted read"
            );
        }
    }

    /// Whether `key` can fall inside this table's key span.
    pub fn covers(&self, key: &[u8]) -> bool {
        self.meta.min_key.as_slice() <= key && key <= self.meta.max_key.as_slice()
    }

    /// Whether this table's span intersects `range`.
    pub fn overlaps(&self, range: &KeyRange) -> bool {
        if let Some(end) = &range.end {
            match self.meta.min_key.as_slice().cmp(end.as_slice()) {
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal if !range.end_inclusive => return false,
                _ => {}
            }
        }
        if let Some(start) = &range.start {
            if self.meta.max_key.as_slice() < start.as_slice() {
                return false;
            }
        }
        true
    }

    /// Point lookup; quarantines the table on corruption.
    pub fn get(&self, key: &[u8]) -> Result<TableGet, TableError> {
        if self.is_quarantined() {
            return Ok(TableGet::Missing);
        }
        let result = self.reader().and_then(|reader| reader.get(key));
        if let Err(error @ TableError::Corrupted(_)) = &result {
            self.quarantine(error);
        }
        result
    }

    /// Bloom pre-check; `true` means "maybe".
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.is_quarantined() {
            return false;
        }
        self.reader().map(|r| r.may_contain(key)).unwrap_or(true)
    }

    /// Collects every entry of this table inside `range`.
    pub fn scan_collect(&self, range: &KeyRange) -> Result<Vec<TableEntry>, TableError> {
        if self.is_quarantined() {
            return Ok(Vec::new());
        }
        let reader = self.reader()?;
        let mut out = Vec::new();
        for item in reader.scan(range.clone())? {
            match item {
                Ok(entry) => out.push(entry),
                Err(error @ TableError::Corrupted(_)) => {
                    self.quarantine(&error);
                    return Err(error);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(out)
    }
}

#[derive(Default)]
struct LevelState {
    tables: Vec<std::sync::Arc<TableHandle>>,
    total_bytes: u64,
}

/// The seven-level table registry.
#[derive(Default)]
pub struct Levels {
    levels: [LevelState; NUM_LEVELS],
}

impl Levels {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table on its level, keeping the level's ordering
    /// invariant (L0 newest-first, deeper levels key-sorted).
    pub fn add(&mut self, handle: std::sync::Arc<TableHandle>) {
        let level = handle.meta.level.min(NUM_LEVELS - 1);
        let state = &mut self.levels[level];
        state.total_bytes += handle.meta.size;
        state.tables.push(handle);
        if level == 0 {
            state
                .tables
                .sort_by(|a, b| b.meta.max_seq.cmp(&a.meta.max_seq));
        } else {
            state.tables.sort_by(|a, b| a.meta.min_key.cmp(&b.meta.min_key));
        }
    }

    /// Removes the given file ids from `level`, returning their handles.
    pub fn remove(&mut self, level: usize, file_ids: &[u64]) -> Vec<std::sync::Arc<TableHandle>> {
        let state = &mut self.levels[level.min(NUM_LEVELS - 1)];
        let mut removed = Vec::new();
        state.tables.retain(|table| {
            if file_ids.contains(&table.meta.file_id) {
                removed.push(std::sync::Arc::clone(table));
                false
            } else {
                true
            }
        });
        for table in &removed {
            state.total_bytes = state.total_bytes.saturating_sub(table.meta.size);
        }
        removed
    }

    /// Every registered table, all levels, L0 first.
    pub fn all_tables(&self) -> Vec<std::sync::Arc<TableHandle>> {
        self.levels
            .iter()
            .flat_map(|state| state.tables.iter().cloned())
            .collect()
    }

    /// Tables on one level, in the level's native order.
    pub fn tables_on(&self, level: usize) -> Vec<std::sync::Arc<TableHandle>> {
        self.levels[level.min(NUM_LEVELS - 1)].tables.to_vec()
    }

    /// Per-level file counts, as persisted in the manifest.
    pub fn file_counts(&self) -> [u32; NUM_LEVELS] {
        let mut counts = [0u32; NUM_LEVELS];
        for (level, state) in self.levels.iter().enumerate() {
            counts[level] = state.tables.len() as u32;
        }
        counts
    }

    /// Highest sequence number across every table.
    pub fn max_seq(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|state| state.tables.iter())
            .map(|table| table.meta.max_seq)
            .max()
            .unwrap_or(0)
    }

    /// Point lookup across the level hierarchy.
    ///
    /// Level 0 is scanned newest → oldest with the best (highest-seq)
    /// hit winning; a level-0 hit beats anything deeper. Levels ≥ 1 are
    /// probed in order and the first hit wins — lower levels hold newer
    /// data by construction.
    pub fn get(&self, key: &[u8]) -> Result<TableGet, TableError> {
        // Level 0: overlapping files, newest first.
        let mut best: Option<(u64, TableGet)> = None;
        for table in &self.levels[0].tables {
            if !table.covers(key) || !table.may_contain(key) {
                continue;
            }
            match table.get(key)? {
                TableGet::Missing => {}
                hit => {
                    let seq = match &hit {
                        TableGet::Found { seq, .. } | TableGet::Tombstone { seq } => *seq,
                        TableGet::Missing => 0,
                    };
                    if best.as_ref().is_none_or(|(s, _)| seq > *s) {
                        best = Some((seq, hit));
                    }
                }
            }
        }
        if let Some((_, hit)) = best {
            return Ok(hit);
        }

        // Deeper levels: at most one candidate each.
        for state in &self.levels[1..] {
            let pos = state
                .tables
                .partition_point(|t| t.meta.min_key.as_slice() <= key);
            let Some(candidate) = pos.checked_sub(1).and_then(|p| state.tables.get(p)) else {
                continue;
            };
            if !candidate.covers(key) || !candidate.may_contain(key) {
                continue;
            }
            match candidate.get(key)? {
                TableGet::Missing => {}
                hit => return Ok(hit),
            }
        }
        Ok(TableGet::Missing)
    }

    /// Tables whose span intersects `range`, every level.
    pub fn tables_for_range(&self, range: &KeyRange) -> Vec<std::sync::Arc<TableHandle>> {
        self.levels
            .iter()
            .flat_map(|state| state.tables.iter())
            .filter(|table| table.overlaps(range))
            .cloned()
            .collect()
    }

    /// Planner-facing per-level summaries.
    pub fn summaries(&self) -> Vec<LevelSummary> {
        self.levels
            .iter()
            .map(|state| LevelSummary {
                tables: state
                    .tables
                    .iter()
                    .map(|table| TableStub {
                        file_id: table.meta.file_id,
                        size: table.meta.size,
                        min_key: table.meta.min_key.clone(),
                        max_key: table.meta.max_key.clone(),
                    })
                    .collect(),
                total_bytes: state.total_bytes,
            })
            .collect()
    }

    /// The shallowest level that currently needs compaction, if any.
    pub fn needs_compaction(&self, thresholds: &CompactionThresholds) -> Option<usize> {
        if self.levels[0].tables.len() >= thresholds.level0_file_limit {
            return Some(0);
        }
        for level in 1..NUM_LEVELS - 1 {
            if self.levels[level].total_bytes >= thresholds.level_budget(level) {
                return Some(level);
            }
        }
        None
    }

    /// True when no level deeper than `level` holds any table.
    pub fn is_bottom_most(&self, level: usize) -> bool {
        self.levels[(level + 1).min(NUM_LEVELS)..]
            .iter()
            .all(|state| state.tables.is_empty())
    }
}
