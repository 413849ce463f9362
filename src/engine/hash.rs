//! Hash engine — sharded hash maps behind segment locks.
//!
//! Point operations touch exactly one shard (`hash(key) & mask`), so
//! disjoint keys proceed fully in parallel. Whole-table operations
//! (`count`, `iter`, `prefix_scan`) acquire shards in ascending index
//! order via [`SegmentLocks`], which precludes deadlock against other
//! multi-shard holders.
//!
//! The engine is unordered: `range_scan` is rejected and the
//! [query manager](crate::query) serves range queries through the
//! iterator fallback instead.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::{
    EngineError, EngineIter, EngineKind, EngineState, EngineStats, KeyRange, KvPair,
    SequenceSource, StateCell, StatsSnapshot, StorageEngine, check_key,
};
use crate::sync::SegmentLocks;

/// Default shard count; rounded up to a power of two by [`SegmentLocks`].
pub const DEFAULT_SEGMENTS: usize = 16;

struct HashSlot {
    value: Vec<u8>,
    seq: u64,
}

/// Sharded, unordered hash engine.
pub struct HashEngine {
    shards: SegmentLocks<HashMap<Vec<u8>, HashSlot>>,
    seq: SequenceSource,
    stats: Arc<EngineStats>,
    state: StateCell,
}

impl HashEngine {
    /// Creates an engine with [`DEFAULT_SEGMENTS`] shards.
    pub fn new() -> Self {
        Self::with_segments(DEFAULT_SEGMENTS)
    }

    /// Creates an engine with the given shard count.
    pub fn with_segments(segments: usize) -> Self {
        Self {
            shards: SegmentLocks::new(segments, HashMap::new),
            seq: SequenceSource::starting_at(1),
            stats: Arc::new(EngineStats::new()),
            state: StateCell::new(EngineState::Running),
        }
    }

    /// Collects every live pair, sorted by key for deterministic output.
    fn snapshot_sorted(&self) -> Vec<KvPair> {
        let guards = self.shards.read_all();
        let mut pairs: Vec<KvPair> = guards
            .iter()
            .flat_map(|shard| {
                shard
                    .iter()
                    .map(|(k, slot)| KvPair::new(k.clone(), slot.value.clone()))
            })
            .collect();
        drop(guards);
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        pairs
    }
}

impl Default for HashEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for HashEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Hash
    }

    fn state(&self) -> EngineState {
        self.state.get()
    }

    fn ordered(&self) -> bool {
        false
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let seq = self.seq.next();
        let mut shard = self.shards.write_for(key);
        shard.insert(
            key.to_vec(),
            HashSlot {
                value: value.to_vec(),
                seq,
            },
        );
        drop(shard);
        self.stats.record_write(key.len() + value.len());
        Ok(())
    }

    fn get_versioned(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let shard = self.shards.read_for(key);
        let found = shard.get(key).map(|slot| (slot.value.clone(), slot.seq));
        drop(shard);
        self.stats
            .record_read(found.as_ref().map_or(0, |(v, _)| v.len()));
        Ok(found)
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let mut shard = self.shards.write_for(key);
        let removed = shard.remove(key);
        drop(shard);
        if removed.is_none() {
            return Err(EngineError::KeyNotFound);
        }
        self.seq.next();
        self.stats.record_delete();
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let seq = self.seq.next();
        let mut shard = self.shards.write_for(key);
        match shard.get_mut(key) {
            Some(slot) => {
                slot.value = value.to_vec();
                slot.seq = seq;
                drop(shard);
                self.stats.record_write(key.len() + value.len());
                Ok(())
            }
            None => Err(EngineError::KeyNotFound),
        }
    }

    fn count(&self) -> Result<u64, EngineError> {
        self.state.ensure_running()?;
        let guards = self.shards.read_all();
        Ok(guards.iter().map(|shard| shard.len() as u64).sum())
    }

    fn range_scan(&self, _range: &KeyRange, _limit: usize) -> Result<Vec<KvPair>, EngineError> {
        Err(EngineError::InvalidParam(
            "hash engine is unordered; use the range-query manager".into(),
        ))
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<KvPair>, EngineError> {
        self.state.ensure_running()?;
        // Linear filter across all shards, then sort for stable output.
        let guards = self.shards.read_all();
        let mut pairs: Vec<KvPair> = guards
            .iter()
            .flat_map(|shard| {
                shard.iter().filter_map(|(k, slot)| {
                    k.starts_with(prefix)
                        .then(|| KvPair::new(k.clone(), slot.value.clone()))
                })
            })
            .collect();
        drop(guards);
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pairs)
    }

    fn iter(&self) -> Result<EngineIter, EngineError> {
        self.state.ensure_running()?;
        Ok(EngineIter::new(self.snapshot_sorted().into_iter()))
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
