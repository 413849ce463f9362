//! Array engine — a sorted vector with binary search.
//!
//! Intended for tiny or short-lived tables where the constant factors of
//! tree structures dominate. Keeps `(key, value, seq)` triples sorted by
//! key, so it counts as an ordered engine and serves native range scans.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::{
    EngineError, EngineIter, EngineKind, EngineState, EngineStats, KeyRange, KvPair,
    SequenceSource, StateCell, StatsSnapshot, StorageEngine, check_key,
};

struct ArrayEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    seq: u64,
}

/// Ordered vector engine.
pub struct ArrayEngine {
    entries: RwLock<Vec<ArrayEntry>>,
    seq: SequenceSource,
    stats: Arc<EngineStats>,
    state: StateCell,
}

impl ArrayEngine {
    /// Creates an empty array engine.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            seq: SequenceSource::starting_at(1),
            stats: Arc::new(EngineStats::new()),
            state: StateCell::new(EngineState::Running),
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, Vec<ArrayEntry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, Vec<ArrayEntry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ArrayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for ArrayEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Array
    }

    fn state(&self) -> EngineState {
        self.state.get()
    }

    fn ordered(&self) -> bool {
        true
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let seq = self.seq.next();
        let mut entries = self.write_entries();
        match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(pos) => {
                entries[pos].value = value.to_vec();
                entries[pos].seq = seq;
            }
            Err(pos) => entries.insert(
                pos,
                ArrayEntry {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    seq,
                },
            ),
        }
        drop(entries);
        self.stats.record_write(key.len() + value.len());
        Ok(())
    }

    fn get_versioned(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let entries = self.read_entries();
        let found = entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .ok()
            .map(|pos| (entries[pos].value.clone(), entries[pos].seq));
        drop(entries);
        self.stats
            .record_read(found.as_ref().map_or(0, |(v, _)| v.len()));
        Ok(found)
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let mut entries = self.write_entries();
        match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(pos) => {
                entries.remove(pos);
                drop(entries);
                self.seq.next();
                self.stats.record_delete();
                Ok(())
            }
            Err(_) => Err(EngineError::KeyNotFound),
        }
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let seq = self.seq.next();
        let mut entries = self.write_entries();
        match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(pos) => {
                entries[pos].value = value.to_vec();
                entries[pos].seq = seq;
                drop(entries);
                self.stats.record_write(key.len() + value.len());
                Ok(())
            }
            Err(_) => Err(EngineError::KeyNotFound),
        }
    }

    fn count(&self) -> Result<u64, EngineError> {
        self.state.ensure_running()?;
        Ok(self.read_entries().len() as u64)
    }

    fn range_scan(&self, range: &KeyRange, limit: usize) -> Result<Vec<KvPair>, EngineError> {
        self.state.ensure_running()?;
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.read_entries();
        let mut out = Vec::new();
        for entry in entries.iter() {
            if !range.contains(&entry.key) {
                // Entries are sorted; once past the upper bound we are done.
                if let Some(end) = &range.end {
                    if entry.key.as_slice() > end.as_slice() {
                        break;
                    }
                }
                continue;
            }
            out.push(KvPair::new(entry.key.clone(), entry.value.clone()));
            if limit != 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<KvPair>, EngineError> {
        self.state.ensure_running()?;
        let entries = self.read_entries();
        let start = entries.partition_point(|e| e.key.as_slice() < prefix);
        let mut out = Vec::new();
        for entry in &entries[start..] {
            if !entry.key.starts_with(prefix) {
                break;
            }
            out.push(KvPair::new(entry.key.clone(), entry.value.clone()));
        }
        Ok(out)
    }

    fn iter(&self) -> Result<EngineIter, EngineError> {
        self.state.ensure_running()?;
        let snapshot: Vec<KvPair> = self
            .read_entries()
            .iter()
            .map(|e| KvPair::new(e.key.clone(), e.value.clone()))
            .collect();
        Ok(EngineIter::new(snapshot.into_iter()))
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
