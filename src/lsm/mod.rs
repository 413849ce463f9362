//! The LSM-tree engine: memtables + levels + WAL + manifest + scheduler
//! behind the uniform engine contract.
//!
//! # Write path
//!
//! `put`/`delete` assign a sequence number, append to the WAL (when
//! enabled — a WAL failure aborts the write before the memtable is
//! touched), then apply to the active memtable. A full active table is
//! frozen and a background flush turns the oldest frozen table into a
//! level-0 SSTable; crossing the level-0 file limit cascades into
//! leveled (or size-tiered) compaction further down.
//!
//! # Read path
//!
//! Active memtable → frozen memtables newest→oldest → level 0
//! newest→oldest → levels 1… — first definitive answer wins, and a
//! tombstone anywhere masks older layers.
//!
//! # Recovery
//!
//! `open()` loads the manifest, discovers table files under
//! `sstables/L*/`, replays WAL records past the manifest's recovery
//! cursor into a fresh memtable, and seeds the sequence source beyond
//! everything seen. Replay runs in recovery mode: the records are not
//! re-appended to the WAL.
//!
//! # Lifecycle
//!
//! Created → Open (after `open`) → Closed (after `close`, which flushes
//! every memtable, waits out in-flight compactions, stops the workers,
//! and checkpoints the manifest).

pub mod levels;
pub mod snapshot;

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::compaction::{
    CompactionExecutor, CompactionPlan, CompactionStrategyKind, CompactionTask,
    CompactionThresholds, MergeIterator, Scheduler, TaskKind, TaskPriority, TaskState,
    dedup_newest, plan_level0, plan_leveled, plan_size_tiered,
};
use crate::engine::{
    BatchApplyOptions, BatchApplyOutcome, BatchOp, EngineError, EngineIter, EngineKind,
    EngineState, EngineStats, KeyRange, KvPair, SequenceSource, StateCell, StatsSnapshot,
    StorageEngine, check_key, prefix_upper_bound,
};
use crate::manifest::{Manifest, NUM_LEVELS};
use crate::memtable::{MemtableError, MemtableLookup, MemtableSet};
use crate::sstable::{
    Compression, SsTable, TableBuilder, TableBuilderConfig, TableEntry, TableGet,
};
use crate::sync::{LockWatchdog, ShutdownSignal};
use crate::wal::{Wal, WalConfig, WalRecord};
use levels::{Levels, TableHandle, TableMeta};

const SSTABLE_DIR: &str = "sstables";
const WAL_DIR: &str = "wal";
const SNAPSHOT_DIR: &str = "snapshots";
const MANIFEST_FILE: &str = "MANIFEST";

/// Tuning knobs for the LSM engine.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Memtable freeze threshold in bytes.
    pub memtable_size: usize,
    /// Bound on the frozen-memtable FIFO.
    pub max_immutable: usize,
    /// Whether mutations are logged before they hit the memtable.
    pub enable_wal: bool,
    /// Fsync the WAL after every record.
    pub sync_writes: bool,
    /// Periodic WAL fsync cadence when `sync_writes` is off.
    pub sync_interval: Duration,
    /// WAL segment rotation threshold.
    pub wal_segment_size: u64,
    /// Level-0 file count that triggers compaction.
    pub level0_file_limit: usize,
    /// Byte budget of level 1.
    pub base_level_bytes: u64,
    /// Budget multiplier per level.
    pub level_size_multiplier: u64,
    /// Data-block codec.
    pub compression: Compression,
    /// Bloom bits per key (0 disables blooms).
    pub bloom_bits_per_key: usize,
    /// Data-block payload target.
    pub block_size: usize,
    /// Compaction worker threads.
    pub compaction_workers: usize,
    /// Compaction strategy family.
    pub compaction_strategy: CompactionStrategyKind,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            memtable_size: 4 * 1024 * 1024,
            max_immutable: 5,
            enable_wal: true,
            sync_writes: false,
            sync_interval: Duration::from_secs(5),
            wal_segment_size: 16 * 1024 * 1024,
            level0_file_limit: 4,
            base_level_bytes: 64 * 1024 * 1024,
            level_size_multiplier: 10,
            compression: Compression::None,
            bloom_bits_per_key: 10,
            block_size: 4 * 1024,
            compaction_workers: 2,
            compaction_strategy: CompactionStrategyKind::Leveled,
        }
    }
}

impl LsmConfig {
    fn thresholds(&self) -> CompactionThresholds {
        CompactionThresholds {
            level0_file_limit: self.level0_file_limit,
            base_level_bytes: self.base_level_bytes,
            level_size_multiplier: self.level_size_multiplier,
            ..CompactionThresholds::default()
        }
    }

    fn builder_config(&self) -> TableBuilderConfig {
        TableBuilderConfig {
            block_size: self.block_size,
            compression: self.compression,
            bloom_bits_per_key: self.bloom_bits_per_key,
        }
    }
}

struct LsmCore {
    config: LsmConfig,
    data_dir: PathBuf,
    state: StateCell,
    seq: SequenceSource,
    memtables: MemtableSet,
    levels: RwLock<Levels>,
    wal: Option<Wal>,
    manifest: Manifest,
    stats: Arc<EngineStats>,
    recovering: AtomicBool,
    /// Serializes flushes so two workers never race on the oldest frozen
    /// table.
    flush_lock: Mutex<()>,
    /// Serializes level merges so two workers never plan the same inputs.
    compact_lock: Mutex<()>,
    /// Advisory stall reporter for the structural locks.
    watchdog: LockWatchdog,
    scheduler: OnceLock<Weak<Scheduler>>,
    /// Stops the periodic WAL sync thread.
    sync_shutdown: ShutdownSignal,
}

/// The LSM-tree engine handle.
pub struct LsmTree {
    core: Arc<LsmCore>,
    scheduler: Arc<Scheduler>,
    sync_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

struct LsmExecutor {
    core: Weak<LsmCore>,
}

impl CompactionExecutor for LsmExecutor {
    fn execute(&self, task: &CompactionTask) -> Result<(), String> {
        let Some(core) = self.core.upgrade() else {
            return Err("engine already closed".into());
        };
        match task.kind() {
            TaskKind::Level0Flush => core
                .run_flush()
                .map(|_| ())
                .map_err(|e| format!("flush failed: {e}")),
            TaskKind::Level { level } => core
                .run_level_compaction(level)
                .map(|_| ())
                .map_err(|e| format!("level {level} compaction failed: {e}")),
            TaskKind::Major => core
                .run_major_compaction()
                .map(|_| ())
                .map_err(|e| format!("major compaction failed: {e}")),
            TaskKind::Manual => core
                .run_manual_compaction()
                .map(|_| ())
                .map_err(|e| format!("manual compaction failed: {e}")),
        }
    }
}

impl LsmCore {
    fn level_dir(&self, level: usize) -> PathBuf {
        self.data_dir.join(SSTABLE_DIR).join(format!("L{level}"))
    }

    fn table_path(&self, level: usize, file_id: u64) -> PathBuf {
        self.level_dir(level).join(format!("sst-{file_id:016}.sst"))
    }

    fn read_levels(&self) -> RwLockReadGuard<'_, Levels> {
        match self.levels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_levels(&self) -> RwLockWriteGuard<'_, Levels> {
        self.watchdog.observe("lsm.levels", || match self.levels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.get().and_then(Weak::upgrade)
    }

    // -- write path ----------------------------------------------------------

    fn write_internal(&self, key: &[u8], value: Option<&[u8]>) -> Result<u64, EngineError> {
        let seq = self.seq.next();
        let recovering = self.recovering.load(Ordering::SeqCst);

        // WAL first: an append failure must leave the memtable untouched.
        if !recovering {
            if let Some(wal) = &self.wal {
                let record = match value {
                    Some(value) => WalRecord::Put {
                        seq,
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                    None => WalRecord::Delete {
                        seq,
                        key: key.to_vec(),
                    },
                };
                wal.append(&record)?;
            }
        }

        self.apply_to_memtables(key, seq, value.map(<[u8]>::to_vec))?;
        Ok(seq)
    }

    /// Applies one mutation, stalling on a full frozen FIFO by flushing
    /// inline.
    fn apply_to_memtables(
        &self,
        key: &[u8],
        seq: u64,
        value: Option<Vec<u8>>,
    ) -> Result<(), EngineError> {
        for _attempt in 0..32 {
            match self.memtables.apply(key, seq, value.clone()) {
                Ok(outcome) => {
                    if outcome.froze || outcome.should_flush {
                        self.schedule_flush(if outcome.should_flush {
                            TaskPriority::High
                        } else {
                            TaskPriority::Normal
                        });
                    }
                    return Ok(());
                }
                Err(MemtableError::FrozenLimit) => {
                    // Writers stall until a flush frees a slot.
                    self.run_flush()
                        .map_err(|e| EngineError::Internal(format!("stall flush failed: {e}")))?;
                }
                Err(MemtableError::Frozen) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Internal(
            "memtable apply kept failing after repeated flushes".into(),
        ))
    }

    fn schedule_flush(&self, priority: TaskPriority) {
        if let Some(scheduler) = self.scheduler() {
            scheduler.submit(TaskKind::Level0Flush, priority);
        }
    }

    fn schedule_compaction_if_needed(&self) {
        let Some(scheduler) = self.scheduler() else {
            return;
        };
        let thresholds = self.config.thresholds();
        let summaries = self.read_levels().summaries();

        match self.config.compaction_strategy {
            CompactionStrategyKind::Leveled => {
                if let Some(level) = self.read_levels().needs_compaction(&thresholds) {
                    let priority = if level == 0 {
                        TaskPriority::High
                    } else {
                        TaskPriority::Normal
                    };
                    scheduler.submit(TaskKind::Level { level }, priority);
                }
            }
            CompactionStrategyKind::SizeTiered => {
                if summaries[0].tables.len() >= thresholds.level0_file_limit {
                    scheduler.submit(TaskKind::Level { level: 0 }, TaskPriority::High);
                    return;
                }
                for level in 1..NUM_LEVELS - 1 {
                    if plan_size_tiered(level, &summaries[level], &thresholds).is_some() {
                        scheduler.submit(TaskKind::Level { level }, TaskPriority::Normal);
                        return;
                    }
                }
            }
        }
    }

    // -- flush ---------------------------------------------------------------

    /// Flushes the oldest frozen memtable into a level-0 table.
    /// Returns whether anything was flushed.
    fn run_flush(&self) -> Result<bool, EngineError> {
        let _guard = self
            .watchdog
            .observe("lsm.flush", || match self.flush_lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            });
        let Some(table) = self.memtables.oldest_frozen() else {
            return Ok(false);
        };

        let entries = table.snapshot_for_flush();
        if entries.is_empty() {
            self.memtables.remove_frozen(table.id());
            return Ok(true);
        }

        let flushed_seq = table.max_seq();
        let file_id = self.manifest.allocate_file_id()?;
        let path = self.table_path(0, file_id);
        let count = entries.len();
        let summary = TableBuilder::with_config(&path, self.config.builder_config()).build(
            entries.into_iter().map(|(key, entry)| TableEntry {
                key,
                value: entry.value,
                seq: entry.seq,
            }),
            count,
        )?;

        let reader = SsTable::open(&path)?;
        let handle = Arc::new(TableHandle::with_reader(
            TableMeta {
                file_id,
                level: 0,
                path,
                size: summary.file_size,
                entry_count: summary.entry_count,
                min_seq: summary.min_seq,
                max_seq: summary.max_seq,
                min_key: summary.min_key,
                max_key: summary.max_key,
            },
            reader,
        ));

        let counts = {
            let mut levels = self.write_levels();
            levels.add(handle);
            levels.file_counts()
        };
        self.manifest.update(|data| {
            data.level_file_counts = counts;
            data.recovery_seq = data.recovery_seq.max(flushed_seq);
        })?;
        self.memtables.remove_frozen(table.id());

        if let Some(wal) = &self.wal {
            // Durability cursor moved; the covered segments can go.
            let _ = wal.append(&WalRecord::Checkpoint { seq: flushed_seq });
            if let Err(e) = wal.prune(flushed_seq) {
                warn!(error = %e, "WAL prune failed after flush");
            }
        }

        info!(
            file_id,
            entries = summary.entry_count,
            bytes = summary.file_size,
            recovery_seq = flushed_seq,
            "memtable flushed to level 0"
        );
        self.schedule_compaction_if_needed();
        Ok(true)
    }

    // -- compaction ----------------------------------------------------------

    fn run_level_compaction(&self, level: usize) -> Result<bool, EngineError> {
        let _guard = match self.compact_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let thresholds = self.config.thresholds();
        let summaries = self.read_levels().summaries();

        let plan = if level == 0 {
            plan_level0(&summaries[0], &summaries[1], &thresholds)
        } else {
            match self.config.compaction_strategy {
                CompactionStrategyKind::Leveled => {
                    plan_leveled(level, &summaries[level], &summaries[level + 1], &thresholds)
                }
                CompactionStrategyKind::SizeTiered => {
                    plan_size_tiered(level, &summaries[level], &thresholds)
                }
            }
        };
        let Some(plan) = plan else {
            debug!(level, "no compaction needed");
            return Ok(false);
        };
        self.execute_plan(&plan)?;
        self.schedule_compaction_if_needed();
        Ok(true)
    }

    fn run_manual_compaction(&self) -> Result<bool, EngineError> {
        if let Some(level) = {
            let thresholds = self.config.thresholds();
            self.read_levels().needs_compaction(&thresholds)
        } {
            self.run_level_compaction(level)
        } else {
            Ok(false)
        }
    }

    /// Merges every table, all levels, into a single bottom-level table.
    fn run_major_compaction(&self) -> Result<bool, EngineError> {
        let _guard = match self.compact_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let inputs = self.read_levels().all_tables();
        if inputs.len() < 2 {
            return Ok(false);
        }
        let bottom = NUM_LEVELS - 1;
        self.merge_tables(&inputs, bottom, true)?;
        Ok(true)
    }

    fn execute_plan(&self, plan: &CompactionPlan) -> Result<(), EngineError> {
        let (inputs, covers_source_level) = {
            let levels = self.read_levels();
            let source_tables = levels.tables_on(plan.source_level);
            let covers = plan.source_ids.len() == source_tables.len();
            let mut inputs: Vec<Arc<TableHandle>> = source_tables
                .into_iter()
                .filter(|t| plan.source_ids.contains(&t.meta.file_id))
                .collect();
            inputs.extend(
                levels
                    .tables_on(plan.target_level)
                    .into_iter()
                    .filter(|t| plan.target_ids.contains(&t.meta.file_id)),
            );
            (inputs, covers)
        };
        if inputs.is_empty() {
            return Ok(());
        }

        // Spent tombstones can only be dropped when nothing below the
        // target can hold an older version of the merged keys.
        let drop_tombstones = covers_source_level
            && self.read_levels().is_bottom_most(plan.target_level)
            && plan.target_ids.len()
                == self.read_levels().tables_on(plan.target_level).len();

        self.merge_tables(&inputs, plan.target_level, drop_tombstones)
    }

    /// Merges `inputs` into one table at `target_level`, commits the
    /// swap, and unlinks the input files.
    fn merge_tables(
        &self,
        inputs: &[Arc<TableHandle>],
        target_level: usize,
        drop_tombstones: bool,
    ) -> Result<(), EngineError> {
        // Collect each input's full entry run. Failure here leaves every
        // input registered and the manifest untouched.
        let mut runs: Vec<Vec<TableEntry>> = Vec::with_capacity(inputs.len());
        for table in inputs {
            runs.push(table.scan_collect(&KeyRange::all())?);
        }

        let sources: Vec<Box<dyn Iterator<Item = TableEntry>>> = runs
            .into_iter()
            .map(|run| Box::new(run.into_iter()) as Box<dyn Iterator<Item = TableEntry>>)
            .collect();
        let merged: Vec<TableEntry> =
            dedup_newest(MergeIterator::new(sources), drop_tombstones).collect();

        let input_ids: Vec<u64> = inputs.iter().map(|t| t.meta.file_id).collect();
        let output = if merged.is_empty() {
            None
        } else {
            let file_id = self.manifest.allocate_file_id()?;
            let path = self.table_path(target_level, file_id);
            let count = merged.len();
            let summary = TableBuilder::with_config(&path, self.config.builder_config())
                .build(merged.into_iter(), count)?;
            let reader = SsTable::open(&path)?;
            Some(Arc::new(TableHandle::with_reader(
                TableMeta {
                    file_id,
                    level: target_level,
                    path,
                    size: summary.file_size,
                    entry_count: summary.entry_count,
                    min_seq: summary.min_seq,
                    max_seq: summary.max_seq,
                    min_key: summary.min_key,
                    max_key: summary.max_key,
                },
                reader,
            )))
        };

        // Commit: swap the level registry, persist the manifest, then
        // unlink the consumed files.
        let removed = {
            let mut levels = self.write_levels();
            let mut removed = Vec::new();
            for level in 0..NUM_LEVELS {
                removed.extend(levels.remove(level, &input_ids));
            }
            if let Some(handle) = &output {
                levels.add(Arc::clone(handle));
            }
            let counts = levels.file_counts();
            drop(levels);
            self.manifest.update(|data| {
                data.level_file_counts = counts;
            })?;
            removed
        };

        for table in &removed {
            if let Err(e) = fs::remove_file(&table.meta.path) {
                warn!(
                    file_id = table.meta.file_id,
                    error = %e,
                    "failed to unlink compacted input table"
                );
            }
        }

        info!(
            inputs = input_ids.len(),
            output_id = output.as_ref().map(|t| t.meta.file_id),
            target_level,
            drop_tombstones,
            "compaction merged tables"
        );
        Ok(())
    }

    // -- read path -----------------------------------------------------------

    fn get_internal(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, EngineError> {
        match self.memtables.lookup(key) {
            MemtableLookup::Found { value, seq } => return Ok(Some((value, seq))),
            MemtableLookup::Tombstone { .. } => return Ok(None),
            MemtableLookup::Missing => {}
        }
        match self.read_levels().get(key)? {
            TableGet::Found { value, seq } => Ok(Some((value, seq))),
            TableGet::Tombstone { .. } | TableGet::Missing => Ok(None),
        }
    }

    /// Merged, visibility-resolved scan across every layer.
    fn scan_internal(&self, range: &KeyRange, limit: usize) -> Result<Vec<KvPair>, EngineError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let mut sources: Vec<Box<dyn Iterator<Item = TableEntry>>> = Vec::new();
        for table in self.memtables.all_tables() {
            let run: Vec<TableEntry> = table
                .scan(range)
                .into_iter()
                .map(|(key, entry)| TableEntry {
                    key,
                    value: entry.value,
                    seq: entry.seq,
                })
                .collect();
            sources.push(Box::new(run.into_iter()));
        }
        let tables = self.read_levels().tables_for_range(range);
        for table in &tables {
            let run = table.scan_collect(range)?;
            sources.push(Box::new(run.into_iter()));
        }

        let mut out = Vec::new();
        for entry in dedup_newest(MergeIterator::new(sources), true) {
            let Some(value) = entry.value else { continue };
            out.push(KvPair {
                key: entry.key,
                value,
            });
            if limit != 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn count_internal(&self) -> Result<u64, EngineError> {
        Ok(self.scan_internal(&KeyRange::all(), 0)?.len() as u64)
    }

    /// Merged, deduplicated entry view across every layer, for the
    /// snapshot writer. With `keep_tombstones` the winning tombstones
    /// are part of the result; otherwise only live pairs survive.
    fn merged_entries(
        &self,
        range: &KeyRange,
        keep_tombstones: bool,
    ) -> Result<Vec<TableEntry>, EngineError> {
        let mut sources: Vec<Box<dyn Iterator<Item = TableEntry>>> = Vec::new();
        for table in self.memtables.all_tables() {
            let run: Vec<TableEntry> = table
                .scan(range)
                .into_iter()
                .map(|(key, entry)| TableEntry {
                    key,
                    value: entry.value,
                    seq: entry.seq,
                })
                .collect();
            sources.push(Box::new(run.into_iter()));
        }
        let tables = self.read_levels().tables_for_range(range);
        for table in &tables {
            let run = table.scan_collect(range)?;
            sources.push(Box::new(run.into_iter()));
        }
        Ok(dedup_newest(MergeIterator::new(sources), !keep_tombstones).collect())
    }
}

// ------------------------------------------------------------------------------------------------
// Open / close
// ------------------------------------------------------------------------------------------------

impl LsmTree {
    /// Opens (or creates) an LSM tree rooted at `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>, config: LsmConfig) -> Result<Self, EngineError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        for level in 0..NUM_LEVELS {
            fs::create_dir_all(data_dir.join(SSTABLE_DIR).join(format!("L{level}")))?;
        }
        fs::create_dir_all(data_dir.join(WAL_DIR))?;
        fs::create_dir_all(data_dir.join(SNAPSHOT_DIR))?;

        let manifest = Manifest::open(data_dir.join(MANIFEST_FILE))?;
        let manifest_data = manifest.data();

        // Discover table files. The directory tree is authoritative for
        // the file set; the manifest contributes the id horizon and the
        // recovery cursor. Files past the id horizon are partial outputs
        // of a crashed flush/compaction and are removed.
        let mut discovered = Levels::new();
        for level in 0..NUM_LEVELS {
            let dir = data_dir.join(SSTABLE_DIR).join(format!("L{level}"));
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(file_id) = name
                    .strip_prefix("sst-")
                    .and_then(|s| s.strip_suffix(".sst"))
                    .and_then(|s| s.parse::<u64>().ok())
                else {
                    // Stale temp files from a crashed build.
                    if name.ends_with(".tmp") {
                        let _ = fs::remove_file(entry.path());
                    }
                    continue;
                };
                if file_id >= manifest_data.next_file_id {
                    warn!(file_id, level, "removing table past the manifest id horizon");
                    let _ = fs::remove_file(entry.path());
                    continue;
                }
                let path = entry.path();
                match SsTable::open(&path) {
                    Ok(reader) => match reader.key_bounds() {
                        Ok((min_key, max_key)) => {
                            let meta = TableMeta {
                                file_id,
                                level,
                                path,
                                size: reader.file_size(),
                                entry_count: reader.entry_count(),
                                min_seq: reader.min_seq(),
                                max_seq: reader.max_seq(),
                                min_key,
                                max_key,
                            };
                            discovered.add(Arc::new(TableHandle::with_reader(meta, reader)));
                        }
                        Err(e) => {
                            warn!(file_id, level, error = %e, "skipping unreadable table");
                        }
                    },
                    Err(e) => {
                        warn!(file_id, level, error = %e, "skipping unreadable table");
                    }
                }
            }
        }
        let discovered_counts = discovered.file_counts();
        if discovered_counts != manifest_data.level_file_counts {
            warn!(
                ?discovered_counts,
                manifest_counts = ?manifest_data.level_file_counts,
                "manifest level counts diverge from directory; trusting the directory"
            );
        }

        let wal = if config.enable_wal {
            Some(Wal::open(
                data_dir.join(WAL_DIR),
                WalConfig {
                    segment_size: config.wal_segment_size,
                    sync_writes: config.sync_writes,
                },
            )?)
        } else {
            None
        };

        let core = Arc::new(LsmCore {
            memtables: MemtableSet::new(config.memtable_size, config.max_immutable, true),
            config,
            data_dir,
            state: StateCell::new(EngineState::Init),
            seq: SequenceSource::starting_at(1),
            levels: RwLock::new(discovered),
            wal,
            manifest,
            stats: Arc::new(EngineStats::new()),
            recovering: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            compact_lock: Mutex::new(()),
            watchdog: LockWatchdog::default(),
            scheduler: OnceLock::new(),
            sync_shutdown: ShutdownSignal::new(),
        });

        // WAL replay: apply every record newer than the recovery cursor.
        let mut replayed = 0u64;
        let mut replay_max_seq = 0u64;
        if let Some(wal) = &core.wal {
            core.recovering.store(true, Ordering::SeqCst);
            let cursor = manifest_data.recovery_seq;
            let result = wal.replay_into(|record| {
                let seq = record.seq();
                replay_max_seq = replay_max_seq.max(seq);
                if seq <= cursor {
                    return Ok(());
                }
                // apply_to_memtables flushes inline when the frozen FIFO
                // fills, so a WAL tail larger than the memtable budget
                // still replays to completion.
                let outcome = match record {
                    WalRecord::Put { seq, key, value } => {
                        core.apply_to_memtables(&key, seq, Some(value))
                    }
                    WalRecord::Delete { seq, key } => core.apply_to_memtables(&key, seq, None),
                    WalRecord::Checkpoint { .. } | WalRecord::Commit { .. } => return Ok(()),
                };
                replayed += 1;
                outcome.map_err(|e| crate::wal::WalError::Internal(format!("replay apply: {e}")))
            });
            core.recovering.store(false, Ordering::SeqCst);
            result?;
        }

        // Seed the sequence source past everything seen anywhere.
        let max_seen = manifest_data
            .recovery_seq
            .max(replay_max_seq)
            .max(core.read_levels().max_seq())
            .max(core.memtables.max_seq());
        core.seq.advance_past(max_seen);

        let scheduler = Arc::new(Scheduler::start(
            core.config.compaction_workers,
            Arc::new(LsmExecutor {
                core: Arc::downgrade(&core),
            }),
        ));
        let _ = core.scheduler.set(Arc::downgrade(&scheduler));
        core.state.set(EngineState::Running);

        info!(
            data_dir = %core.data_dir.display(),
            tables = discovered_counts.iter().sum::<u32>(),
            replayed,
            next_seq = max_seen + 1,
            "LSM tree opened"
        );

        // Periodic durability: without per-record fsync, a background
        // thread syncs the WAL every `sync_interval`.
        let sync_thread = if core.wal.is_some()
            && !core.config.sync_writes
            && !core.config.sync_interval.is_zero()
        {
            let worker = Arc::downgrade(&core);
            let interval = core.config.sync_interval;
            let handle = std::thread::Builder::new()
                .name("wal-sync".into())
                .spawn(move || {
                    loop {
                        let Some(core) = worker.upgrade() else { return };
                        if core.sync_shutdown.wait_timeout(interval) {
                            return;
                        }
                        if let Some(wal) = &core.wal {
                            if let Err(e) = wal.sync() {
                                warn!(error = %e, "periodic WAL sync failed");
                            }
                        }
                    }
                })
                .expect("failed to spawn WAL sync thread");
            Some(handle)
        } else {
            None
        };

        let tree = Self {
            core,
            scheduler,
            sync_thread: Mutex::new(sync_thread),
        };
        tree.core.schedule_compaction_if_needed();
        Ok(tree)
    }

    fn stop_sync_thread(&self) {
        self.core.sync_shutdown.trigger();
        let handle = match self.sync_thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Root directory this tree persists under.
    pub fn data_dir(&self) -> &Path {
        &self.core.data_dir
    }

    /// Number of frozen memtables awaiting flush.
    pub fn frozen_memtables(&self) -> usize {
        self.core.memtables.frozen_count()
    }

    /// Per-level table counts.
    pub fn level_file_counts(&self) -> [u32; NUM_LEVELS] {
        self.core.read_levels().file_counts()
    }

    /// Blocks until the background queue is drained.
    pub fn wait_for_background_work(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }
}

impl StorageEngine for LsmTree {
    fn kind(&self) -> EngineKind {
        EngineKind::Lsm
    }

    fn state(&self) -> EngineState {
        self.core.state.get()
    }

    fn ordered(&self) -> bool {
        true
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.core.state.ensure_running()?;
        self.core.write_internal(key, Some(value))?;
        self.core.stats.record_write(key.len() + value.len());
        Ok(())
    }

    fn get_versioned(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, EngineError> {
        check_key(key)?;
        self.core.state.ensure_running()?;
        let found = self.core.get_internal(key)?;
        self.core
            .stats
            .record_read(found.as_ref().map_or(0, |(v, _)| v.len()));
        Ok(found)
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.core.state.ensure_running()?;
        // Tombstones are only written for keys that exist; the contract
        // reports NOT_FOUND otherwise.
        if self.core.get_internal(key)?.is_none() {
            return Err(EngineError::KeyNotFound);
        }
        self.core.write_internal(key, None)?;
        self.core.stats.record_delete();
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.core.state.ensure_running()?;
        if self.core.get_internal(key)?.is_none() {
            return Err(EngineError::KeyNotFound);
        }
        self.core.write_internal(key, Some(value))?;
        self.core.stats.record_write(key.len() + value.len());
        Ok(())
    }

    fn count(&self) -> Result<u64, EngineError> {
        self.core.state.ensure_running()?;
        self.core.count_internal()
    }

    fn range_scan(&self, range: &KeyRange, limit: usize) -> Result<Vec<KvPair>, EngineError> {
        self.core.state.ensure_running()?;
        self.core.scan_internal(range, limit)
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<KvPair>, EngineError> {
        self.core.state.ensure_running()?;
        let range = KeyRange {
            start: Some(prefix.to_vec()),
            end: prefix_upper_bound(prefix),
            start_inclusive: true,
            end_inclusive: false,
        };
        self.core.scan_internal(&range, 0)
    }

    fn iter(&self) -> Result<EngineIter, EngineError> {
        self.core.state.ensure_running()?;
        let pairs = self.core.scan_internal(&KeyRange::all(), 0)?;
        Ok(EngineIter::new(pairs.into_iter()))
    }

    /// Schedules a major compaction and waits for it to settle.
    fn compact(&self) -> Result<(), EngineError> {
        self.core.state.ensure_running()?;
        let task = self.scheduler.submit(TaskKind::Major, TaskPriority::High);
        match task.wait(Duration::from_secs(300)) {
            TaskState::Completed => Ok(()),
            TaskState::Failed => Err(EngineError::CompactionFailed(
                task.error().unwrap_or_else(|| "unknown failure".into()),
            )),
            TaskState::Cancelled => Err(EngineError::Cancelled),
            state => Err(EngineError::Internal(format!(
                "compaction did not settle: {state:?}"
            ))),
        }
    }

    /// Durability fence: freeze the active memtable, flush every frozen
    /// one, and fsync the WAL.
    fn flush(&self) -> Result<(), EngineError> {
        self.core.state.ensure_running()?;
        match self.core.memtables.freeze_active() {
            Ok(_) => {}
            Err(MemtableError::FrozenLimit) => {
                // Drain one flush to free a slot, then freeze.
                self.core.run_flush()?;
                self.core.memtables.freeze_active()?;
            }
            Err(e) => return Err(e.into()),
        }
        while self.core.memtables.frozen_count() > 0 {
            if !self.core.run_flush()? {
                break;
            }
        }
        if let Some(wal) = &self.core.wal {
            wal.sync()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.core.state.get() == EngineState::Shutdown {
            return Ok(());
        }
        self.flush()?;
        self.scheduler.wait_idle(Duration::from_secs(60));
        self.scheduler.stop();
        self.stop_sync_thread();
        self.core.manifest.save()?;
        if let Some(wal) = &self.core.wal {
            wal.sync()?;
        }
        self.core.state.set(EngineState::Shutdown);
        info!(data_dir = %self.core.data_dir.display(), "LSM tree closed");
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Batched application with WAL batching: every entry is logged
    /// first (one fsync when asked), then applied in order.
    fn apply_batch(
        &self,
        ops: &[BatchOp],
        opts: &BatchApplyOptions,
    ) -> Result<BatchApplyOutcome, EngineError> {
        self.core.state.ensure_running()?;
        let mut outcome = BatchApplyOutcome::default();
        if ops.is_empty() {
            return Ok(outcome);
        }

        // Assign sequence numbers up front so the WAL run and the
        // memtable applications agree.
        let assigned: Vec<(u64, &BatchOp)> =
            ops.iter().map(|op| (self.core.seq.next(), op)).collect();

        if let Some(wal) = &self.core.wal {
            if !self.core.recovering.load(Ordering::SeqCst) {
                let records: Vec<WalRecord> = assigned
                    .iter()
                    .map(|(seq, op)| match op {
                        BatchOp::Put { key, value } => WalRecord::Put {
                            seq: *seq,
                            key: key.clone(),
                            value: value.clone(),
                        },
                        BatchOp::Delete { key } => WalRecord::Delete {
                            seq: *seq,
                            key: key.clone(),
                        },
                    })
                    .collect();
                outcome.wal_records = wal.append_batch(&records, opts.sync_wal)? as u64;
                let max_seq = assigned.last().map(|(seq, _)| *seq).unwrap_or(0);
                let _ = wal.append(&WalRecord::Commit { seq: max_seq });
            }
        }

        let deadline = opts.timeout.map(|t| std::time::Instant::now() + t);
        for (idx, (seq, op)) in assigned.iter().enumerate() {
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    // The WAL already holds the whole run, so post-crash
                    // replay reproduces this partial state verbatim.
                    outcome.failed += (assigned.len() - idx) as u64;
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some((idx, EngineError::Timeout));
                    }
                    break;
                }
            }
            let result = match op {
                BatchOp::Put { key, value } => {
                    self.core
                        .apply_to_memtables(key, *seq, Some(value.clone()))
                }
                BatchOp::Delete { key } => self.core.apply_to_memtables(key, *seq, None),
            };
            match result {
                Ok(()) => {
                    outcome.applied += 1;
                    match op {
                        BatchOp::Put { key, value } => {
                            self.core.stats.record_write(key.len() + value.len());
                        }
                        BatchOp::Delete { .. } => self.core.stats.record_delete(),
                    }
                }
                Err(err) => {
                    outcome.failed += 1;
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some((idx, err));
                    }
                    if opts.atomic {
                        outcome.failed += (assigned.len() - idx - 1) as u64;
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        // Stop the workers; skip flushing — an explicit close() is the
        // graceful path, and recovery replays the WAL either way.
        self.scheduler.stop();
        self.stop_sync_thread();
    }
}
