//! Background compaction: task queue, worker pool, merge machinery, and
//! the level-selection strategies.
//!
//! # Task model
//!
//! A [`CompactionTask`] moves through `Pending → Running → {Completed,
//! Failed, Cancelled}`. Tasks carry a [`TaskPriority`]; the worker pool
//! always runs the highest-priority pending task next (FIFO within a
//! priority). Failures record their message on the task and leave the
//! inputs untouched so a retry stays possible.
//!
//! # Scheduler
//!
//! [`Scheduler`] owns a mutex-protected priority queue, a condvar for
//! worker wakeups, and a fixed pool of OS threads. The executor — the
//! LSM tree — is handed in as a trait object at start; the scheduler
//! itself knows nothing about tables or levels. `stop()` cancels every
//! pending task, wakes the workers, and joins them.
//!
//! # Merge
//!
//! [`MergeIterator`] k-way-merges sorted entry streams on
//! `(key ASC, seq DESC)`; [`dedup_newest`] then keeps only the
//! newest version per key, optionally dropping tombstones when the
//! output lands at the bottom-most populated level (nothing below can
//! resurrect).
//!
//! # Strategies
//!
//! [`plan_level0`] and [`plan_leveled`] implement the leveled policy:
//! L0 flushes pile up overlapping tables until the file limit, then all
//! of L0 merges into L1; a deeper level over its byte budget contributes
//! one table plus every overlapping table of the next level.
//! [`plan_size_tiered`] merges runs of similarly-sized tables within a
//! level into the next one.

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::sstable::TableEntry;

// ------------------------------------------------------------------------------------------------
// Task model
// ------------------------------------------------------------------------------------------------

/// What a task is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Flush the oldest frozen memtable into a level-0 table.
    Level0Flush,
    /// Merge `level` into `level + 1` per the configured strategy.
    Level {
        /// Source level.
        level: usize,
    },
    /// Merge everything down to the bottom level.
    Major,
    /// Caller-requested maintenance pass.
    Manual,
}

/// Scheduling priority; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Opportunistic housekeeping.
    Low = 0,
    /// Regular background work.
    Normal = 1,
    /// Work the write path is waiting on indirectly.
    High = 2,
    /// Work blocking writers right now.
    Urgent = 3,
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, not yet picked up.
    Pending,
    /// A worker is executing it.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error (see [`CompactionTask::error`]).
    Failed,
    /// Removed from the queue before running.
    Cancelled,
}

struct TaskCell {
    state: TaskState,
    error: Option<String>,
}

/// One unit of background work.
pub struct CompactionTask {
    id: u64,
    kind: TaskKind,
    priority: TaskPriority,
    cell: Mutex<TaskCell>,
    done: Condvar,
}

impl CompactionTask {
    fn new(id: u64, kind: TaskKind, priority: TaskPriority) -> Self {
        Self {
            id,
            kind,
            priority,
            cell: Mutex::new(TaskCell {
                state: TaskState::Pending,
                error: None,
            }),
            done: Condvar::new(),
        }
    }

    /// Task id, unique per scheduler.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// What this task does.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Scheduling priority.
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    fn lock_cell(&self) -> std::sync::MutexGuard<'_, TaskCell> {
        match self.cell.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.lock_cell().state
    }

    /// Failure message, present once the task is `Failed`.
    pub fn error(&self) -> Option<String> {
        self.lock_cell().error.clone()
    }

    fn transition(&self, state: TaskState, error: Option<String>) {
        let mut cell = self.lock_cell();
        cell.state = state;
        cell.error = error;
        drop(cell);
        self.done.notify_all();
    }

    /// Blocks until the task reaches a terminal state or `timeout`
    /// elapses. Returns the state seen last.
    pub fn wait(&self, timeout: Duration) -> TaskState {
        let deadline = std::time::Instant::now() + timeout;
        let mut cell = self.lock_cell();
        loop {
            match cell.state {
                TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {
                    return cell.state;
                }
                _ => {}
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return cell.state;
            }
            let (guard, _timeout) = match self.done.wait_timeout(cell, deadline - now) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            cell = guard;
        }
    }
}

/// Executes tasks on behalf of the scheduler. Implemented by the LSM
/// tree; the scheduler stays ignorant of storage details.
pub trait CompactionExecutor: Send + Sync {
    /// Runs one task to completion. An `Err` marks the task `Failed`
    /// with the returned message; inputs must be left intact.
    fn execute(&self, task: &CompactionTask) -> Result<(), String>;
}

// ------------------------------------------------------------------------------------------------
// Scheduler
// ------------------------------------------------------------------------------------------------

struct SchedulerShared {
    queue: Mutex<VecDeque<Arc<CompactionTask>>>,
    wakeup: Condvar,
    idle: Condvar,
    shutdown: AtomicBool,
    in_flight: AtomicUsize,
    executor: Arc<dyn CompactionExecutor>,
}

impl SchedulerShared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<CompactionTask>>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Fixed-pool background task scheduler.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_task_id: AtomicU64,
}

impl Scheduler {
    /// Starts `workers` threads executing against `executor`.
    pub fn start(workers: usize, executor: Arc<dyn CompactionExecutor>) -> Self {
        let shared = Arc::new(SchedulerShared {
            queue: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            executor,
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("compaction-{worker_id}"))
                .spawn(move || Self::worker_loop(worker_id, shared))
                .unwrap_or_else(|e| {
                    // Thread spawn only fails under severe resource
                    // exhaustion; surface loudly.
                    panic!("failed to spawn compaction worker: {e}")
                });
            handles.push(handle);
        }
        info!(workers = handles.len(), "compaction scheduler started");

        Self {
            shared,
            workers: Mutex::new(handles),
            next_task_id: AtomicU64::new(1),
        }
    }

    /// Enqueues a task and wakes one worker.
    pub fn submit(&self, kind: TaskKind, priority: TaskPriority) -> Arc<CompactionTask> {
        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let task = Arc::new(CompactionTask::new(id, kind, priority));

        let mut queue = self.shared.lock_queue();
        if self.shared.shutdown.load(Ordering::SeqCst) {
            drop(queue);
            task.transition(TaskState::Cancelled, Some("scheduler stopped".into()));
            return task;
        }
        queue.push_back(Arc::clone(&task));
        drop(queue);
        self.shared.wakeup.notify_one();
        debug!(task_id = id, ?kind, ?priority, "compaction task queued");
        task
    }

    /// Number of tasks queued or running.
    pub fn backlog(&self) -> usize {
        self.shared.lock_queue().len() + self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Blocks until the queue is drained and no task is running, or the
    /// timeout elapses. Returns whether idle was reached.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.shared.lock_queue();
        loop {
            if queue.is_empty() && self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = match self.shared.idle.wait_timeout(queue, deadline - now) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue = guard;
        }
    }

    /// Stops the pool: cancels every pending task, wakes the workers,
    /// and joins them. Idempotent.
    pub fn stop(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled: Vec<Arc<CompactionTask>> = {
            let mut queue = self.shared.lock_queue();
            queue.drain(..).collect()
        };
        for task in &cancelled {
            task.transition(TaskState::Cancelled, Some("scheduler stopped".into()));
        }
        self.shared.wakeup.notify_all();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            workers.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("compaction worker panicked");
            }
        }
        info!(cancelled = cancelled.len(), "compaction scheduler stopped");
    }

    fn worker_loop(worker_id: usize, shared: Arc<SchedulerShared>) {
        loop {
            let task = {
                let mut queue = shared.lock_queue();
                loop {
                    if shared.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    // Highest priority first; FIFO (lowest id) inside a
                    // priority class.
                    let best = queue
                        .iter()
                        .enumerate()
                        .max_by_key(|(_, t)| (t.priority(), std::cmp::Reverse(t.id())))
                        .map(|(pos, _)| pos);
                    if let Some(pos) = best {
                        break queue.remove(pos).map(|t| {
                            shared.in_flight.fetch_add(1, Ordering::SeqCst);
                            t
                        });
                    }
                    queue = match shared.wakeup.wait(queue) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            };
            let Some(task) = task else { continue };

            task.transition(TaskState::Running, None);
            debug!(worker_id, task_id = task.id(), kind = ?task.kind(), "task running");
            match shared.executor.execute(&task) {
                Ok(()) => {
                    task.transition(TaskState::Completed, None);
                    debug!(worker_id, task_id = task.id(), "task completed");
                }
                Err(message) => {
                    warn!(worker_id, task_id = task.id(), %message, "task failed");
                    task.transition(TaskState::Failed, Some(message));
                }
            }
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            // Notify under the queue lock so an idle-waiter cannot check
            // the condition and sleep between the decrement and the wake.
            let _guard = shared.lock_queue();
            shared.idle.notify_all();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ------------------------------------------------------------------------------------------------
// Merge machinery
// ------------------------------------------------------------------------------------------------

/// K-way merge over sorted entry streams, ordered `(key ASC, seq DESC)`.
///
/// Sources must each be sorted by key; for one key the stream with the
/// newest version surfaces it first, which is exactly what
/// [`dedup_newest`] relies on.
pub struct MergeIterator<'a> {
    sources: Vec<Box<dyn Iterator<Item = TableEntry> + 'a>>,
    heap: std::collections::BinaryHeap<HeapItem>,
}

struct HeapItem {
    entry: TableEntry,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key && self.entry.seq == other.entry.seq
    }
}

impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the smallest key (and
        // within a key, the highest seq) pops first.
        match self.entry.key.cmp(&other.entry.key) {
            std::cmp::Ordering::Equal => self.entry.seq.cmp(&other.entry.seq),
            ord => ord.reverse(),
        }
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<'a> MergeIterator<'a> {
    /// Builds the merge from the given sorted sources.
    pub fn new(mut sources: Vec<Box<dyn Iterator<Item = TableEntry> + 'a>>) -> Self {
        let mut heap = std::collections::BinaryHeap::new();
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next() {
                heap.push(HeapItem { entry, source: idx });
            }
        }
        Self { sources, heap }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = TableEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.heap.pop()?;
        if let Some(entry) = self.sources[item.source].next() {
            self.heap.push(HeapItem {
                entry,
                source: item.source,
            });
        }
        Some(item.entry)
    }
}

/// Keeps only the newest version per key from a `(key ASC, seq DESC)`
/// stream. With `drop_tombstones`, winning tombstones are elided as well
/// — only valid when nothing below the merge output can hold older
/// versions of these keys.
pub fn dedup_newest(
    merged: impl Iterator<Item = TableEntry>,
    drop_tombstones: bool,
) -> impl Iterator<Item = TableEntry> {
    let mut last_key: Option<Vec<u8>> = None;
    merged.filter(move |entry| {
        if last_key.as_deref() == Some(entry.key.as_slice()) {
            return false;
        }
        last_key = Some(entry.key.clone());
        !(drop_tombstones && entry.is_tombstone())
    })
}

// ------------------------------------------------------------------------------------------------
// Strategy planning
// ------------------------------------------------------------------------------------------------

/// Strategy family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionStrategyKind {
    /// Leveled: byte budgets per level, non-overlapping outputs.
    #[default]
    Leveled,
    /// Size-tiered: merge runs of similarly sized tables.
    SizeTiered,
}

impl CompactionStrategyKind {
    /// Parses a configuration selector string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "leveled" => Some(Self::Leveled),
            "size_tiered" => Some(Self::SizeTiered),
            _ => None,
        }
    }
}

/// Planner-facing view of one table.
#[derive(Debug, Clone)]
pub struct TableStub {
    /// Manifest file id.
    pub file_id: u64,
    /// File size in bytes.
    pub size: u64,
    /// Smallest key stored.
    pub min_key: Vec<u8>,
    /// Largest key stored.
    pub max_key: Vec<u8>,
}

impl TableStub {
    fn overlaps(&self, min: &[u8], max: &[u8]) -> bool {
        self.min_key.as_slice() <= max && self.max_key.as_slice() >= min
    }
}

/// Planner-facing view of one level.
#[derive(Debug, Clone, Default)]
pub struct LevelSummary {
    /// Tables currently registered, newest first for level 0.
    pub tables: Vec<TableStub>,
    /// Aggregate byte size.
    pub total_bytes: u64,
}

/// Thresholds driving the planners.
#[derive(Debug, Clone)]
pub struct CompactionThresholds {
    /// Level-0 file count that triggers an L0→L1 merge.
    pub level0_file_limit: usize,
    /// Byte budget of level 1.
    pub base_level_bytes: u64,
    /// Budget multiplier per level.
    pub level_size_multiplier: u64,
    /// Size-tiered: minimum run length of similar tables.
    pub tier_min_tables: usize,
    /// Size-tiered: tables count as "similar" within this size factor.
    pub tier_size_factor: f64,
}

impl Default for CompactionThresholds {
    fn default() -> Self {
        Self {
            level0_file_limit: 4,
            base_level_bytes: 64 * 1024 * 1024,
            level_size_multiplier: 10,
            tier_min_tables: 4,
            tier_size_factor: 1.5,
        }
    }
}

impl CompactionThresholds {
    /// Byte budget of `level` (levels ≥ 1).
    pub fn level_budget(&self, level: usize) -> u64 {
        let exponent = level.saturating_sub(1) as u32;
        self.base_level_bytes
            .saturating_mul(self.level_size_multiplier.saturating_pow(exponent))
    }
}

/// The inputs chosen for one merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Level the inputs came from.
    pub source_level: usize,
    /// Level the outputs land on.
    pub target_level: usize,
    /// File ids taken from the source level.
    pub source_ids: Vec<u64>,
    /// Overlapping file ids taken from the target level.
    pub target_ids: Vec<u64>,
}

/// L0 → L1 plan: once level 0 holds `level0_file_limit` files, all of
/// them merge with every overlapping L1 table.
pub fn plan_level0(
    level0: &LevelSummary,
    level1: &LevelSummary,
    thresholds: &CompactionThresholds,
) -> Option<CompactionPlan> {
    if level0.tables.len() < thresholds.level0_file_limit {
        return None;
    }
    let min = level0.tables.iter().map(|t| &t.min_key).min()?.clone();
    let max = level0.tables.iter().map(|t| &t.max_key).max()?.clone();

    Some(CompactionPlan {
        source_level: 0,
        target_level: 1,
        source_ids: level0.tables.iter().map(|t| t.file_id).collect(),
        target_ids: level1
            .tables
            .iter()
            .filter(|t| t.overlaps(&min, &max))
            .map(|t| t.file_id)
            .collect(),
    })
}

/// Leveled plan for `level ≥ 1`: when the level exceeds its budget, its
/// oldest table plus every overlapping table of the next level merge
/// down.
pub fn plan_leveled(
    level: usize,
    summary: &LevelSummary,
    next: &LevelSummary,
    thresholds: &CompactionThresholds,
) -> Option<CompactionPlan> {
    if summary.total_bytes < thresholds.level_budget(level) {
        return None;
    }
    let victim = summary.tables.first()?;

    Some(CompactionPlan {
        source_level: level,
        target_level: level + 1,
        source_ids: vec![victim.file_id],
        target_ids: next
            .tables
            .iter()
            .filter(|t| t.overlaps(&victim.min_key, &victim.max_key))
            .map(|t| t.file_id)
            .collect(),
    })
}

/// Size-tiered plan: a run of at least `tier_min_tables` tables whose
/// sizes stay within `tier_size_factor` of the run's smallest member all
/// merge into the next level.
pub fn plan_size_tiered(
    level: usize,
    summary: &LevelSummary,
    thresholds: &CompactionThresholds,
) -> Option<CompactionPlan> {
    if summary.tables.len() < thresholds.tier_min_tables {
        return None;
    }
    let mut by_size: Vec<&TableStub> = summary.tables.iter().collect();
    by_size.sort_by_key(|t| t.size);

    for window_start in 0..=(by_size.len() - thresholds.tier_min_tables) {
        let smallest = by_size[window_start].size.max(1);
        let run: Vec<&TableStub> = by_size[window_start..]
            .iter()
            .take_while(|t| (t.size as f64) <= smallest as f64 * thresholds.tier_size_factor)
            .copied()
            .collect();
        if run.len() >= thresholds.tier_min_tables {
            return Some(CompactionPlan {
                source_level: level,
                target_level: (level + 1).min(crate::manifest::NUM_LEVELS - 1),
                source_ids: run.iter().map(|t| t.file_id).collect(),
                target_ids: Vec::new(),
            });
        }
    }
    None
}
