//! In-memory cache layer fronting the engines.
//!
//! Six eviction policies (LRU, LFU, FIFO, RANDOM, CLOCK, ARC) share one
//! entry table; see [`inner`] for the policy mechanics. Entries carry an
//! optional TTL; a background janitor thread wakes every
//! `cleanup_interval`, sweeps out expired entries, and is joined on
//! drop. Capacity is bounded both by entry count and by payload bytes —
//! crossing either limit evicts per the active policy, with an extra
//! `eviction_factor` of headroom.
//!
//! The policy bookkeeping mutates on every access (LRU move-to-front,
//! ARC promotion, frequency bumps), so the core sits behind a single
//! mutex; the hit/miss/latency counters are atomics updated outside it.

mod inner;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, bounded};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorCode;
use inner::CacheInner;

/// Longest accepted cache key, in bytes.
pub const MAX_KEY_LEN: usize = 1024;
/// Longest accepted cache value, in bytes.
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Key exceeds [`MAX_KEY_LEN`].
    #[error("cache key length {len} exceeds limit {max}")]
    KeyTooLong {
        /// Offending length.
        len: usize,
        /// The limit.
        max: usize,
    },

    /// Value exceeds [`MAX_VALUE_LEN`].
    #[error("cache value length {len} exceeds limit {max}")]
    ValueTooLarge {
        /// Offending length.
        len: usize,
        /// The limit.
        max: usize,
    },

    /// Empty key.
    #[error("empty cache key")]
    EmptyKey,
}

impl CacheError {
    /// Maps onto the stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::KeyTooLong { .. } => ErrorCode::KeyTooLong,
            Self::ValueTooLarge { .. } | Self::EmptyKey => ErrorCode::InvalidParam,
        }
    }
}

/// Eviction policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Least recently used.
    #[default]
    Lru,
    /// Least frequently used.
    Lfu,
    /// First in, first out.
    Fifo,
    /// Uniform random victim.
    Random,
    /// Second-chance clock.
    Clock,
    /// Adaptive replacement (T1/T2 + ghost lists).
    Arc,
}

impl CachePolicy {
    /// Parses a configuration selector string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lru" => Some(Self::Lru),
            "lfu" => Some(Self::Lfu),
            "fifo" => Some(Self::Fifo),
            "random" => Some(Self::Random),
            "clock" => Some(Self::Clock),
            "arc" => Some(Self::Arc),
            _ => None,
        }
    }

    /// The canonical selector string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
            Self::Random => "random",
            Self::Clock => "clock",
            Self::Arc => "arc",
        }
    }
}

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum live entries.
    pub max_entries: usize,
    /// Maximum live payload bytes (keys + values).
    pub max_bytes: usize,
    /// Eviction policy.
    pub policy: CachePolicy,
    /// TTL applied when `set` passes none; `None` or zero = no expiry.
    pub default_ttl: Option<Duration>,
    /// Janitor wake interval; `None` disables the background sweeper.
    pub cleanup_interval: Option<Duration>,
    /// Extra fraction evicted beyond the limit on overflow.
    pub eviction_factor: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_bytes: 64 * 1024 * 1024,
            policy: CachePolicy::Lru,
            default_ttl: Some(Duration::from_millis(3_600_000)),
            cleanup_interval: Some(Duration::from_millis(60_000)),
            eviction_factor: 0.1,
        }
    }
}

#[derive(Debug, Default)]
struct LatencyCounters {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl LatencyCounters {
    fn record(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            average_ns: if count == 0 { 0 } else { total_ns / count },
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}

/// Latency summary for one operation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySnapshot {
    /// Operations measured.
    pub count: u64,
    /// Mean latency in nanoseconds.
    pub average_ns: u64,
    /// Worst observed latency in nanoseconds.
    pub max_ns: u64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses (expired entries count here too).
    pub misses: u64,
    /// Entries evicted by capacity pressure.
    pub evictions: u64,
    /// Entries removed by TTL expiry.
    pub expirations: u64,
    /// Current live entries.
    pub entries: usize,
    /// Current live payload bytes.
    pub bytes: usize,
    /// `get` latency summary.
    pub get_latency: LatencySnapshot,
    /// `set` latency summary.
    pub set_latency: LatencySnapshot,
    /// `delete` latency summary.
    pub delete_latency: LatencySnapshot,
}

impl CacheStats {
    /// `hits / (hits + misses)`; 0 when idle.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// The cache handle. Clone-free; share via `Arc`.
pub struct Cache {
    inner: Arc<Mutex<CacheInner>>,
    hits: AtomicU64,
    misses: AtomicU64,
    get_latency: LatencyCounters,
    set_latency: LatencyCounters,
    delete_latency: LatencyCounters,
    janitor: Option<JanitorHandle>,
}

struct JanitorHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl Cache {
    /// Creates a cache, spawning the janitor when an interval is set.
    pub fn new(config: CacheConfig) -> Self {
        let cleanup_interval = config.cleanup_interval.filter(|d| !d.is_zero());
        let inner = Arc::new(Mutex::new(CacheInner::new(config)));

        let janitor = cleanup_interval.map(|interval| {
            let (stop, ticker) = bounded::<()>(0);
            let sweep_target = Arc::clone(&inner);
            let thread = std::thread::Builder::new()
                .name("cache-janitor".into())
                .spawn(move || {
                    loop {
                        match ticker.recv_timeout(interval) {
                            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                                let mut guard = match sweep_target.lock() {
                                    Ok(guard) => guard,
                                    Err(poisoned) => poisoned.into_inner(),
                                };
                                let swept = guard.sweep_expired();
                                drop(guard);
                                if swept > 0 {
                                    debug!(swept, "cache janitor removed expired entries");
                                }
                            }
                            Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                                return;
                            }
                        }
                    }
                })
                .expect("failed to spawn cache janitor");
            JanitorHandle { stop, thread }
        });

        Self {
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            get_latency: LatencyCounters::default(),
            set_latency: LatencyCounters::default(),
            delete_latency: LatencyCounters::default(),
            janitor,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn validate(key: &[u8], value: Option<&[u8]>) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(CacheError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if let Some(value) = value {
            if value.len() > MAX_VALUE_LEN {
                return Err(CacheError::ValueTooLarge {
                    len: value.len(),
                    max: MAX_VALUE_LEN,
                });
            }
        }
        Ok(())
    }

    /// Looks up `key`, returning an owned copy of the value.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let started = Instant::now();
        let result = self.lock().get(key);
        self.get_latency.record(started.elapsed());
        match &result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Upserts with the default TTL.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), CacheError> {
        self.set_with_ttl(key, value, None)
    }

    /// Upserts with an explicit TTL (zero = never expires).
    pub fn set_with_ttl(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        Self::validate(key, Some(value))?;
        let started = Instant::now();
        self.lock().set(key, value.to_vec(), ttl);
        self.set_latency.record(started.elapsed());
        Ok(())
    }

    /// Removes `key`. Returns whether a live entry existed.
    pub fn delete(&self, key: &[u8]) -> bool {
        let started = Instant::now();
        let removed = self.lock().delete(key);
        self.delete_latency.record(started.elapsed());
        removed
    }

    /// Batched lookup under one lock acquisition.
    pub fn get_many(&self, keys: &[&[u8]]) -> Vec<Option<Vec<u8>>> {
        let started = Instant::now();
        let mut guard = self.lock();
        let results: Vec<Option<Vec<u8>>> = keys.iter().map(|key| guard.get(key)).collect();
        drop(guard);
        self.get_latency.record(started.elapsed());
        for result in &results {
            match result {
                Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
                None => self.misses.fetch_add(1, Ordering::Relaxed),
            };
        }
        results
    }

    /// Batched upsert under one lock acquisition.
    pub fn set_many(&self, pairs: &[(&[u8], &[u8])]) -> Result<(), CacheError> {
        for (key, value) in pairs {
            Self::validate(key, Some(value))?;
        }
        let started = Instant::now();
        let mut guard = self.lock();
        for (key, value) in pairs {
            guard.set(key, value.to_vec(), None);
        }
        drop(guard);
        self.set_latency.record(started.elapsed());
        Ok(())
    }

    /// Batched removal under one lock acquisition; returns the number of
    /// live entries removed.
    pub fn delete_many(&self, keys: &[&[u8]]) -> usize {
        let started = Instant::now();
        let mut guard = self.lock();
        let removed = keys.iter().filter(|key| guard.delete(key)).count();
        drop(guard);
        self.delete_latency.record(started.elapsed());
        removed
    }

    /// TTL-aware existence probe without disturbing the policy state.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.lock().contains_live(key)
    }

    /// Current live entry count.
    pub fn len(&self) -> usize {
        self.lock().live_entries()
    }

    /// Whether the cache holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current live payload bytes.
    pub fn bytes(&self) -> usize {
        self.lock().live_bytes()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Runs one expiry sweep inline; returns entries removed.
    pub fn sweep_expired(&self) -> u64 {
        self.lock().sweep_expired()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        let guard = self.lock();
        let counters = guard.counters;
        let entries = guard.live_entries();
        let bytes = guard.live_bytes();
        drop(guard);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: counters.evictions,
            expirations: counters.expirations,
            entries,
            bytes,
            get_latency: self.get_latency.snapshot(),
            set_latency: self.set_latency.snapshot(),
            delete_latency: self.delete_latency.snapshot(),
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.take() {
            drop(janitor.stop);
            if janitor.thread.join().is_err() {
                info!("cache janitor panicked during shutdown");
            }
        }
    }
}
