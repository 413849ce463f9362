//! B+Tree engine.
//!
//! An ordered engine shaped like an on-disk B+Tree: wide nodes with a
//! configurable order in `[3, 1000]`, all entries in the leaves, and a
//! doubly linked leaf chain serving range scans. See [`tree`] for the
//! structural algorithms.
//!
//! Three runtime-configurable optimizations sit on top:
//!
//! - **Adaptive fanout.** Insert/search/delete/split/merge counters are
//!   sampled every `adaptive_interval` operations; a split-heavy window
//!   grows the order by 20 %, a merge-heavy one shrinks it, clamped to
//!   `[ORDER_MIN, ORDER_MAX]`. Only future splits see the new order.
//! - **Hot-leaf cache.** An LRU map from leaf id to its covered key span.
//!   A hit routes the lookup straight to the leaf, skipping the descent;
//!   any structural change (split/merge/borrow/root swap) invalidates the
//!   whole cache via the tree's structure version.
//! - **Batch interface.** PUT/GET/DELETE entries accumulate up to a
//!   bound, are sorted by key, and replay under a single tree-lock
//!   acquisition.

mod tree;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::arena::SlotId;
use crate::engine::{
    EngineError, EngineIter, EngineKind, EngineState, EngineStats, KeyRange, KvPair,
    SequenceSource, StateCell, StatsSnapshot, StorageEngine, check_key, prefix_upper_bound,
};
use tree::BpTree;

/// Smallest permitted node order.
pub const ORDER_MIN: usize = 3;
/// Largest permitted node order.
pub const ORDER_MAX: usize = 1000;
/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 256;
/// Longest accepted value, in bytes.
pub const MAX_VALUE_LEN: usize = 4096;

/// Tuning knobs for [`BTreeEngine`].
#[derive(Debug, Clone)]
pub struct BTreeConfig {
    /// Initial node order (max keys per node).
    pub order: usize,
    /// Enables the adaptive-fanout heuristic.
    pub adaptive: bool,
    /// Operations between adaptive evaluations.
    pub adaptive_interval: u64,
    /// Load factor above which the order grows.
    pub high_water: f64,
    /// Load factor below which the order shrinks.
    pub low_water: f64,
    /// Hot-leaf cache capacity in cached leaves (0 disables the cache).
    pub cache_nodes: usize,
    /// Hot-leaf cache budget in key bytes.
    pub cache_bytes: usize,
    /// Maximum entries accepted by one [`BTreeBatch`].
    pub max_batch_ops: usize,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            order: 100,
            adaptive: true,
            adaptive_interval: 1000,
            high_water: 0.85,
            low_water: 0.35,
            cache_nodes: 1024,
            cache_bytes: 1024 * 1024,
            max_batch_ops: 4096,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Hot-leaf cache
// ------------------------------------------------------------------------------------------------

struct CachedLeaf {
    leaf: SlotId,
    high: Vec<u8>,
    /// Structure version the id was valid for.
    version: u64,
    tick: u64,
}

/// LRU map from low key to a cached leaf span.
///
/// A cached entry is only trusted when its recorded structure version
/// still matches the tree's; everything else counts as a miss.
struct LeafCache {
    spans: BTreeMap<Vec<u8>, CachedLeaf>,
    bytes: usize,
    max_nodes: usize,
    max_bytes: usize,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl LeafCache {
    fn new(max_nodes: usize, max_bytes: usize) -> Self {
        Self {
            spans: BTreeMap::new(),
            bytes: 0,
            max_nodes,
            max_bytes,
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn enabled(&self) -> bool {
        self.max_nodes > 0
    }

    /// Probes for a leaf whose span covers `key` at `version`. A hit
    /// refreshes the entry's LRU tick.
    fn probe(&mut self, key: &[u8], version: u64) -> Option<SlotId> {
        if !self.enabled() {
            return None;
        }
        self.tick += 1;
        let tick = self.tick;
        let hit = self
            .spans
            .range_mut::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Included(key)))
            .next_back()
            .and_then(|(_, cached)| {
                if cached.version == version && key <= cached.high.as_slice() {
                    cached.tick = tick;
                    Some(cached.leaf)
                } else {
                    None
                }
            });
        match hit {
            Some(leaf) => {
                self.hits += 1;
                Some(leaf)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Records a leaf span discovered by a full descent.
    fn admit(&mut self, low: Vec<u8>, high: Vec<u8>, leaf: SlotId, version: u64) {
        if !self.enabled() {
            return;
        }
        self.tick += 1;
        let low_len = low.len();
        let weight = low_len + high.len();
        if let Some(old) = self.spans.insert(
            low,
            CachedLeaf {
                leaf,
                high,
                version,
                tick: self.tick,
            },
        ) {
            self.bytes = self.bytes.saturating_sub(low_len + old.high.len());
        }
        self.bytes += weight;
        while self.spans.len() > self.max_nodes || self.bytes > self.max_bytes {
            let Some(coldest) = self
                .spans
                .iter()
                .min_by_key(|(_, c)| c.tick)
                .map(|(low, _)| low.clone())
            else {
                break;
            };
            if let Some(evicted) = self.spans.remove(&coldest) {
                self.bytes = self
                    .bytes
                    .saturating_sub(coldest.len() + evicted.high.len());
            }
        }
    }

    fn invalidate_all(&mut self) {
        self.spans.clear();
        self.bytes = 0;
    }
}

/// Hot-leaf cache counters, exposed for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafCacheStats {
    /// Probe hits.
    pub hits: u64,
    /// Probe misses (including version mismatches).
    pub misses: u64,
    /// Currently cached leaves.
    pub cached_nodes: usize,
}

// ------------------------------------------------------------------------------------------------
// Batch interface
// ------------------------------------------------------------------------------------------------

/// One accumulated batch operation.
#[derive(Debug, Clone)]
enum BTreeBatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BTreeBatchOp {
    fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Get { key } | Self::Delete { key } => key,
        }
    }
}

/// Reply for one batch operation, in submission order of the sorted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BTreeBatchReply {
    /// Put applied.
    Stored,
    /// Get result.
    Value(Option<Vec<u8>>),
    /// Delete applied (`existed` tells whether the key was present).
    Removed {
        /// Whether the key existed before the delete.
        existed: bool,
    },
}

/// Accumulates operations for a single-lock replay against the tree.
pub struct BTreeBatch<'a> {
    engine: &'a BTreeEngine,
    ops: Vec<BTreeBatchOp>,
}

impl<'a> BTreeBatch<'a> {
    fn push(&mut self, op: BTreeBatchOp) -> Result<(), EngineError> {
        if self.ops.len() >= self.engine.config.max_batch_ops {
            return Err(EngineError::BatchFull);
        }
        check_key(op.key())?;
        self.engine.check_limits(op.key(), None)?;
        self.ops.push(op);
        Ok(())
    }

    /// Queues a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.engine.check_limits(key, Some(value))?;
        self.push(BTreeBatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Queues a get.
    pub fn get(&mut self, key: &[u8]) -> Result<(), EngineError> {
        self.push(BTreeBatchOp::Get { key: key.to_vec() })
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), EngineError> {
        self.push(BTreeBatchOp::Delete { key: key.to_vec() })
    }

    /// Sorts the accumulated run by key and replays it through the
    /// single-entry paths inside one tree-lock acquisition.
    pub fn execute(self) -> Result<Vec<BTreeBatchReply>, EngineError> {
        self.engine.state.ensure_running()?;
        let mut ops = self.ops;
        ops.sort_by(|a, b| a.key().cmp(b.key()));

        let mut tree = self.engine.write_tree();
        let version_before = tree.structure_version;
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                BTreeBatchOp::Put { key, value } => {
                    let seq = self.engine.seq.next();
                    tree.insert(&key, &value, seq);
                    self.engine.stats.record_write(key.len() + value.len());
                    replies.push(BTreeBatchReply::Stored);
                }
                BTreeBatchOp::Get { key } => {
                    let found = tree.get(&key).map(|(value, _)| value);
                    self.engine
                        .stats
                        .record_read(found.as_ref().map_or(0, Vec::len));
                    replies.push(BTreeBatchReply::Value(found));
                }
                BTreeBatchOp::Delete { key } => {
                    let existed = tree.remove(&key);
                    if existed {
                        self.engine.seq.next();
                        self.engine.stats.record_delete();
                    }
                    replies.push(BTreeBatchReply::Removed { existed });
                }
            }
        }
        let changed = tree.structure_version != version_before;
        drop(tree);
        if changed {
            self.engine.cache_lock().invalidate_all();
        }
        self.engine.maybe_adapt();
        Ok(replies)
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// The B+Tree engine handle.
pub struct BTreeEngine {
    tree: RwLock<BpTree>,
    cache: Mutex<LeafCache>,
    config: BTreeConfig,
    seq: SequenceSource,
    stats: Arc<EngineStats>,
    state: StateCell,
    /// Search counter for the adaptive window, kept outside the tree lock
    /// so reads stay on the read path.
    search_ops: std::sync::atomic::AtomicU64,
}

impl BTreeEngine {
    /// Creates an engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(BTreeConfig::default())
    }

    /// Creates an engine with the given configuration. The order is
    /// clamped into `[ORDER_MIN, ORDER_MAX]`.
    pub fn with_config(config: BTreeConfig) -> Self {
        let order = config.order.clamp(ORDER_MIN, ORDER_MAX);
        Self {
            tree: RwLock::new(BpTree::new(order)),
            cache: Mutex::new(LeafCache::new(config.cache_nodes, config.cache_bytes)),
            config: BTreeConfig { order, ..config },
            seq: SequenceSource::starting_at(1),
            stats: Arc::new(EngineStats::new()),
            state: StateCell::new(EngineState::Running),
            search_ops: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Starts a new batch accumulation.
    pub fn batch(&self) -> BTreeBatch<'_> {
        BTreeBatch {
            engine: self,
            ops: Vec::new(),
        }
    }

    /// The node order currently in effect.
    pub fn current_order(&self) -> usize {
        self.read_tree().order
    }

    /// Hot-leaf cache counters.
    pub fn leaf_cache_stats(&self) -> LeafCacheStats {
        let cache = self.cache_lock();
        LeafCacheStats {
            hits: cache.hits,
            misses: cache.misses,
            cached_nodes: cache.spans.len(),
        }
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, BpTree> {
        match self.tree.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, BpTree> {
        match self.tree.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cache_lock(&self) -> MutexGuard<'_, LeafCache> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_limits(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), EngineError> {
        if key.len() > MAX_KEY_LEN {
            return Err(EngineError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if let Some(value) = value {
            if value.len() > MAX_VALUE_LEN {
                return Err(EngineError::ValueTooLarge {
                    len: value.len(),
                    max: MAX_VALUE_LEN,
                });
            }
        }
        Ok(())
    }

    /// Evaluates the adaptive-fanout heuristic when the sampling window
    /// has filled up, then resets the window counters.
    fn maybe_adapt(&self) {
        use std::sync::atomic::Ordering;

        if !self.config.adaptive {
            return;
        }
        let mut tree = self.write_tree();
        let counters = tree.counters;
        let searches = self.search_ops.load(Ordering::Relaxed);
        let total_ops = counters.total_ops() + searches;
        if total_ops < self.config.adaptive_interval {
            return;
        }
        self.search_ops.store(0, Ordering::Relaxed);

        let total = total_ops as f64;
        let load = (counters.splits as f64 - counters.merges as f64) / total;
        let old_order = tree.order;
        if load > self.config.high_water && old_order < ORDER_MAX {
            tree.order = ((old_order as f64 * 1.2) as usize).clamp(ORDER_MIN, ORDER_MAX);
        } else if load < self.config.low_water && old_order > ORDER_MIN {
            tree.order = ((old_order as f64 * 0.8) as usize).clamp(ORDER_MIN, ORDER_MAX);
        }
        if tree.order != old_order {
            debug!(
                old_order,
                new_order = tree.order,
                load,
                "adaptive fanout adjusted node order"
            );
        }
        tree.counters = Default::default();
    }
}

impl Default for BTreeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for BTreeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::BTree
    }

    fn state(&self) -> EngineState {
        self.state.get()
    }

    fn ordered(&self) -> bool {
        true
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.check_limits(key, Some(value))?;
        self.state.ensure_running()?;

        let seq = self.seq.next();
        let mut tree = self.write_tree();
        let version_before = tree.structure_version;
        tree.insert(key, value, seq);
        tree.counters.inserts += 1;
        let changed = tree.structure_version != version_before;
        drop(tree);

        if changed {
            self.cache_lock().invalidate_all();
        }
        self.stats.record_write(key.len() + value.len());
        self.maybe_adapt();
        Ok(())
    }

    fn get_versioned(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, EngineError> {
        check_key(key)?;
        self.check_limits(key, None)?;
        self.state.ensure_running()?;

        let tree = self.read_tree();
        let version = tree.structure_version;
        let cached_leaf = self.cache_lock().probe(key, version);

        let found = match cached_leaf {
            Some(leaf) => tree.search_in_leaf(leaf, key),
            None => {
                let found = tree.find_leaf(key).and_then(|leaf| {
                    let hit = tree.search_in_leaf(leaf, key);
                    if let Some((low, high)) = tree.leaf_span(leaf) {
                        self.cache_lock().admit(low, high, leaf, version);
                    }
                    hit
                });
                found
            }
        };
        drop(tree);

        self.search_ops
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.stats
            .record_read(found.as_ref().map_or(0, |(v, _)| v.len()));
        Ok(found)
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.check_limits(key, None)?;
        self.state.ensure_running()?;

        let mut tree = self.write_tree();
        let version_before = tree.structure_version;
        let removed = tree.remove(key);
        tree.counters.deletes += 1;
        let changed = tree.structure_version != version_before;
        drop(tree);

        if changed {
            self.cache_lock().invalidate_all();
        }
        if !removed {
            return Err(EngineError::KeyNotFound);
        }
        self.seq.next();
        self.stats.record_delete();
        self.maybe_adapt();
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.check_limits(key, Some(value))?;
        self.state.ensure_running()?;

        let mut tree = self.write_tree();
        if tree.get(key).is_none() {
            return Err(EngineError::KeyNotFound);
        }
        let seq = self.seq.next();
        tree.insert(key, value, seq);
        tree.counters.inserts += 1;
        drop(tree);
        self.stats.record_write(key.len() + value.len());
        Ok(())
    }

    fn count(&self) -> Result<u64, EngineError> {
        self.state.ensure_running()?;
        Ok(self.read_tree().len as u64)
    }

    fn range_scan(&self, range: &KeyRange, limit: usize) -> Result<Vec<KvPair>, EngineError> {
        self.state.ensure_running()?;
        Ok(self.read_tree().collect_range(range, limit))
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<KvPair>, EngineError> {
        self.state.ensure_running()?;
        let range = KeyRange {
            start: Some(prefix.to_vec()),
            end: prefix_upper_bound(prefix),
            start_inclusive: true,
            end_inclusive: false,
        };
        Ok(self.read_tree().collect_range(&range, 0))
    }

    fn iter(&self) -> Result<EngineIter, EngineError> {
        self.state.ensure_running()?;
        let pairs = self.read_tree().collect_range(&KeyRange::all(), 0);
        Ok(EngineIter::new(pairs.into_iter()))
    }

    fn compact(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        self.state.set(EngineState::Shutdown);
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
