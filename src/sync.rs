//! Concurrency primitives shared across engines.
//!
//! - [`SegmentLocks`] — a fixed, power-of-two array of reader/writer
//!   shards indexed by key hash. Multi-segment acquisition is always in
//!   ascending index order, which precludes lock-order deadlocks between
//!   concurrent multi-key operations.
//! - [`LockWatchdog`] — an advisory, purely time-based stall reporter.
//!   It never intervenes; it only logs when a named acquisition waited
//!   longer than the configured ceiling.
//! - [`ShutdownSignal`] — an atomic flag plus condvar used strictly for
//!   wakeups of background threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::warn;

/// FNV-1a, used for shard selection. Deterministic across processes so
/// tests can reason about shard placement.
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// A partitioned lock array: `N` independent shards, each guarding a `T`.
///
/// `N` is rounded up to a power of two so shard selection is a mask
/// instead of a modulo.
#[derive(Debug)]
pub struct SegmentLocks<T> {
    shards: Box<[RwLock<T>]>,
    mask: u64,
}

impl<T> SegmentLocks<T> {
    /// Creates `segments.next_power_of_two()` shards, each initialised by
    /// `init`.
    pub fn new(segments: usize, mut init: impl FnMut() -> T) -> Self {
        let n = segments.max(1).next_power_of_two();
        let shards: Vec<RwLock<T>> = (0..n).map(|_| RwLock::new(init())).collect();
        Self {
            shards: shards.into_boxed_slice(),
            mask: (n - 1) as u64,
        }
    }

    /// Number of shards.
    pub fn segments(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard responsible for `key`.
    #[inline]
    pub fn index_for(&self, key: &[u8]) -> usize {
        (fnv1a(key) & self.mask) as usize
    }

    /// Read access to the shard owning `key`.
    pub fn read_for(&self, key: &[u8]) -> RwLockReadGuard<'_, T> {
        match self.shards[self.index_for(key)].read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Write access to the shard owning `key`.
    pub fn write_for(&self, key: &[u8]) -> RwLockWriteGuard<'_, T> {
        match self.shards[self.index_for(key)].write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Write access to every shard, acquired in ascending index order.
    ///
    /// Any operation that touches several shards must go through this (or
    /// otherwise acquire ascending) so two multi-key writers can never
    /// deadlock against each other.
    pub fn write_all(&self) -> Vec<RwLockWriteGuard<'_, T>> {
        self.shards
            .iter()
            .map(|shard| match shard.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            })
            .collect()
    }

    /// Read access to every shard, acquired in ascending index order.
    pub fn read_all(&self) -> Vec<RwLockReadGuard<'_, T>> {
        self.shards
            .iter()
            .map(|shard| match shard.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            })
            .collect()
    }
}

/// Advisory lock-stall reporter.
///
/// Wraps an acquisition closure, measures how long it blocked, and emits a
/// `warn!` event when the wait exceeded the ceiling. This is deliberately
/// *not* a deadlock detector — it reports suspicious waits and nothing
/// more.
#[derive(Debug, Clone)]
pub struct LockWatchdog {
    ceiling: Duration,
}

impl LockWatchdog {
    /// Creates a watchdog that reports waits longer than `ceiling`.
    pub fn new(ceiling: Duration) -> Self {
        Self { ceiling }
    }

    /// Runs `acquire`, timing how long it blocks. The elapsed wait is
    /// reported under `name` when it crosses the ceiling.
    pub fn observe<R>(&self, name: &str, acquire: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let guard = acquire();
        let waited = started.elapsed();
        if waited > self.ceiling {
            warn!(
                lock = name,
                waited_ms = waited.as_millis() as u64,
                ceiling_ms = self.ceiling.as_millis() as u64,
                "lock wait exceeded ceiling; thread potentially stalled"
            );
        }
        guard
    }
}

impl Default for LockWatchdog {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// One-way shutdown flag with a condvar for timed waits.
///
/// Background threads sleep in [`ShutdownSignal::wait_timeout`] and wake
/// either when the interval elapses or when [`ShutdownSignal::trigger`]
/// fires.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    fired: AtomicBool,
    gate: Mutex<()>,
    cv: Condvar,
}

impl ShutdownSignal {
    /// Creates an un-triggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the signal and wakes every waiter.
    pub fn trigger(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let _guard = self.gate.lock();
        self.cv.notify_all();
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Sleeps for up to `timeout`, returning early (with `true`) if the
    /// signal fires first. Returns `false` on a plain timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = match self.gate.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Checked under the gate so a trigger racing this call cannot
        // slip between the check and the wait.
        if self.is_triggered() {
            return true;
        }
        let (_guard, _res) = match self.cv.wait_timeout(guard, timeout) {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.is_triggered()
    }
}
