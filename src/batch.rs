//! Batch writer: accumulate, deduplicate, sort, commit atomically.
//!
//! A [`WriteBatch`] buffers put/delete entries under entry-count and
//! memory caps. [`BatchWriter::commit`] runs the pipeline:
//!
//! 1. with deduplication, a stable sort by key keeps same-key entries in
//!    submission order and only the last one survives — one WAL record
//!    per distinct key;
//! 2. otherwise, with sorting enabled, entries are ordered by key;
//! 3. the engine applies the run through
//!    [`StorageEngine::apply_batch`] — the LSM logs every entry first
//!    and fsyncs once when `sync_wal` is set;
//! 4. with `atomic_commit` the first failure aborts the remainder;
//!    otherwise failures are recorded and later entries still run.
//!
//! The asynchronous variant pushes the same pipeline onto a worker
//! thread: `submit` returns a handle immediately, callers may
//! `wait(timeout)` or `cancel()`, and completion is reported through
//! optional per-entry and whole-batch callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, unbounded};
use tracing::debug;

use crate::engine::{BatchApplyOptions, BatchOp, EngineError, StorageEngine};
use crate::error::ErrorCode;

/// Batch accumulation and commit knobs.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum entries per batch.
    pub max_batch_size: usize,
    /// Maximum accumulated key+value bytes per batch.
    pub max_batch_memory: usize,
    /// Keep only the newest entry per key before committing.
    pub enable_deduplication: bool,
    /// Sort entries by key before committing (implied by dedup).
    pub enable_sorting: bool,
    /// Abort at the first failing entry.
    pub atomic_commit: bool,
    /// Fsync the WAL once after the run.
    pub sync_wal: bool,
    /// Soft commit deadline; expiry fails the untouched remainder with
    /// [`ErrorCode::Timeout`] instead of hanging.
    pub timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10_000,
            max_batch_memory: 16 * 1024 * 1024,
            enable_deduplication: true,
            enable_sorting: true,
            atomic_commit: true,
            sync_wal: false,
            timeout: None,
        }
    }
}

/// An accumulating batch of mutations.
#[derive(Debug)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    bytes: usize,
    config: BatchConfig,
}

impl WriteBatch {
    /// Creates an empty batch with the given knobs.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            ops: Vec::new(),
            bytes: 0,
            config,
        }
    }

    /// Creates an empty batch with default knobs.
    pub fn with_defaults() -> Self {
        Self::new(BatchConfig::default())
    }

    fn push(&mut self, op: BatchOp) -> Result<(), EngineError> {
        if op.key().is_empty() {
            return Err(EngineError::InvalidParam("empty key".into()));
        }
        if self.ops.len() >= self.config.max_batch_size {
            return Err(EngineError::BatchFull);
        }
        let weight = op.weight();
        if self.bytes + weight > self.config.max_batch_memory {
            return Err(EngineError::BatchTooLarge);
        }
        self.bytes += weight;
        self.ops.push(op);
        Ok(())
    }

    /// Queues a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.push(BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Queues a delete (a tombstone in the LSM).
    pub fn delete(&mut self, key: &[u8]) -> Result<(), EngineError> {
        self.push(BatchOp::Delete { key: key.to_vec() })
    }

    /// Entries accumulated so far.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch holds no entries.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Approximate accumulated payload bytes.
    pub fn memory_usage(&self) -> usize {
        self.bytes
    }

    /// Discards every accumulated entry.
    pub fn cancel(&mut self) {
        self.ops.clear();
        self.bytes = 0;
    }

    /// Applies dedup/sort per the batch configuration and returns the
    /// final operation run.
    fn into_run(self) -> (Vec<BatchOp>, BatchConfig) {
        let config = self.config;
        let mut ops = self.ops;
        if config.enable_deduplication {
            // Stable sort keeps submission (sequence) order within a key;
            // the last entry of each run is the newest.
            ops.sort_by(|a, b| a.key().cmp(b.key()));
            let mut deduped: Vec<BatchOp> = Vec::with_capacity(ops.len());
            for op in ops {
                let same_key = deduped.last().is_some_and(|last| last.key() == op.key());
                if same_key {
                    // Later entry wins; earlier versions and their value
                    // memory are dropped here.
                    let last = deduped.len() - 1;
                    deduped[last] = op;
                } else {
                    deduped.push(op);
                }
            }
            ops = deduped;
        } else if config.enable_sorting {
            ops.sort_by(|a, b| a.key().cmp(b.key()));
        }
        (ops, config)
    }
}

/// Outcome of a batch commit.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Entries applied successfully.
    pub committed: u64,
    /// Entries that failed or were aborted.
    pub failed: u64,
    /// Wall-clock commit duration in microseconds.
    pub commit_time_us: u64,
    /// WAL records written on behalf of the batch.
    pub wal_writes: u64,
    /// Stable code of the first failure, if any.
    pub first_error_code: Option<ErrorCode>,
    /// Index (in the committed run) of the first failure, if any.
    pub first_error_index: Option<usize>,
}

fn commit_ops(engine: &dyn StorageEngine, batch: WriteBatch) -> Result<BatchResult, EngineError> {
    let started = Instant::now();
    let (ops, config) = batch.into_run();
    if ops.is_empty() {
        return Ok(BatchResult {
            commit_time_us: started.elapsed().as_micros() as u64,
            ..BatchResult::default()
        });
    }

    let outcome = engine.apply_batch(
        &ops,
        &BatchApplyOptions {
            atomic: config.atomic_commit,
            sync_wal: config.sync_wal,
            timeout: config.timeout,
        },
    )?;

    let (first_error_code, first_error_index) = match &outcome.first_error {
        Some((index, error)) => (Some(error.code()), Some(*index)),
        None => (None, None),
    };
    let result = BatchResult {
        committed: outcome.applied,
        failed: outcome.failed,
        commit_time_us: started.elapsed().as_micros() as u64,
        wal_writes: outcome.wal_records,
        first_error_code,
        first_error_index,
    };
    debug!(
        committed = result.committed,
        failed = result.failed,
        wal_writes = result.wal_writes,
        commit_time_us = result.commit_time_us,
        "batch committed"
    );
    Ok(result)
}

/// Synchronous batch committer bound to one engine.
pub struct BatchWriter {
    engine: Arc<dyn StorageEngine>,
}

impl BatchWriter {
    /// Binds to an engine.
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    /// Runs the commit pipeline on the calling thread.
    pub fn commit(&self, batch: WriteBatch) -> Result<BatchResult, EngineError> {
        commit_ops(self.engine.as_ref(), batch)
    }
}

// ------------------------------------------------------------------------------------------------
// Asynchronous variant
// ------------------------------------------------------------------------------------------------

/// Per-entry completion callback: `(index in the committed run, code)`.
/// `ErrorCode::None` reports success.
pub type EntryCallback = Box<dyn Fn(usize, ErrorCode) + Send + Sync>;
/// Whole-batch completion callback.
pub type BatchCallback = Box<dyn FnOnce(&BatchResult) + Send>;

enum AsyncState {
    Pending,
    Done(BatchResult),
    Cancelled,
}

struct HandleInner {
    state: Mutex<AsyncState>,
    done: Condvar,
    cancel: AtomicBool,
}

/// Tracks one submitted asynchronous batch.
#[derive(Clone)]
pub struct AsyncBatchHandle {
    inner: Arc<HandleInner>,
}

impl AsyncBatchHandle {
    /// Blocks until the batch settles or `timeout` elapses. Returns the
    /// result when settled, `None` on timeout. A cancelled batch yields
    /// a result whose entries are all marked [`ErrorCode::Cancelled`].
    pub fn wait(&self, timeout: Duration) -> Option<BatchResult> {
        let deadline = Instant::now() + timeout;
        let mut state = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            match &*state {
                AsyncState::Done(result) => return Some(result.clone()),
                AsyncState::Cancelled => {
                    return Some(BatchResult {
                        first_error_code: Some(ErrorCode::Cancelled),
                        ..BatchResult::default()
                    });
                }
                AsyncState::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = match self.inner.done.wait_timeout(state, deadline - now) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
        }
    }

    /// Requests cancellation. Batches not yet started are dropped with
    /// every entry marked cancelled; a batch already committing finishes.
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether the batch has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        let state = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        !matches!(&*state, AsyncState::Pending)
    }
}

struct AsyncJob {
    batch: WriteBatch,
    entry_callback: Option<EntryCallback>,
    batch_callback: Option<BatchCallback>,
    handle: Arc<HandleInner>,
}

/// Worker-thread batch executor with the same commit semantics as
/// [`BatchWriter`].
pub struct AsyncBatchWriter {
    sender: Option<Sender<AsyncJob>>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncBatchWriter {
    /// Starts the worker bound to `engine`.
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        let (sender, receiver) = unbounded::<AsyncJob>();
        let worker = std::thread::Builder::new()
            .name("batch-writer".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    Self::run_job(engine.as_ref(), job);
                }
            })
            .expect("failed to spawn async batch worker");
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    fn run_job(engine: &dyn StorageEngine, job: AsyncJob) {
        let entry_count = job.batch.len();
        if job.handle.cancel.load(Ordering::SeqCst) {
            if let Some(callback) = &job.entry_callback {
                for index in 0..entry_count {
                    callback(index, ErrorCode::Cancelled);
                }
            }
            let result = BatchResult {
                failed: entry_count as u64,
                first_error_code: Some(ErrorCode::Cancelled),
                first_error_index: Some(0),
                ..BatchResult::default()
            };
            if let Some(callback) = job.batch_callback {
                callback(&result);
            }
            let mut state = match job.handle.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *state = AsyncState::Cancelled;
            drop(state);
            job.handle.done.notify_all();
            return;
        }

        let result = match commit_ops(engine, job.batch) {
            Ok(result) => result,
            Err(error) => BatchResult {
                failed: entry_count as u64,
                first_error_code: Some(error.code()),
                first_error_index: Some(0),
                ..BatchResult::default()
            },
        };

        if let Some(callback) = &job.entry_callback {
            let committed = result.committed as usize;
            let first_failed = result.first_error_index.unwrap_or(usize::MAX);
            for index in 0..(result.committed + result.failed) as usize {
                let code = if index < committed && index != first_failed {
                    ErrorCode::None
                } else if index == first_failed {
                    result.first_error_code.unwrap_or(ErrorCode::Unknown)
                } else {
                    ErrorCode::Cancelled
                };
                callback(index, code);
            }
        }
        if let Some(callback) = job.batch_callback {
            callback(&result);
        }

        let mut state = match job.handle.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = AsyncState::Done(result);
        drop(state);
        job.handle.done.notify_all();
    }

    /// Submits a batch; returns immediately with its tracking handle.
    pub fn submit(
        &self,
        batch: WriteBatch,
        entry_callback: Option<EntryCallback>,
        batch_callback: Option<BatchCallback>,
    ) -> AsyncBatchHandle {
        let handle = AsyncBatchHandle {
            inner: Arc::new(HandleInner {
                state: Mutex::new(AsyncState::Pending),
                done: Condvar::new(),
                cancel: AtomicBool::new(false),
            }),
        };
        let job = AsyncJob {
            batch,
            entry_callback,
            batch_callback,
            handle: Arc::clone(&handle.inner),
        };
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                let mut state = match handle.inner.state.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *state = AsyncState::Cancelled;
            }
        }
        handle
    }
}

impl Drop for AsyncBatchWriter {
    fn drop(&mut self) {
        // Disconnect the channel so the worker drains and exits.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::rbtree::RbTreeEngine;
    use std::sync::atomic::AtomicUsize;

    fn engine() -> Arc<dyn StorageEngine> {
        Arc::new(RbTreeEngine::new())
    }

    #[test]
    fn dedup_keeps_only_the_last_version() {
        let engine = engine();
        let writer = BatchWriter::new(Arc::clone(&engine));

        let mut batch = WriteBatch::with_defaults();
        batch.put(b"k", b"v1").unwrap();
        batch.put(b"k", b"v2").unwrap();
        batch.put(b"k", b"v3").unwrap();
        let result = writer.commit(batch).unwrap();

        assert_eq!(result.committed, 1);
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v3".to_vec()));
    }

    #[test]
    fn dedup_put_then_delete_leaves_tombstone() {
        let engine = engine();
        let writer = BatchWriter::new(Arc::clone(&engine));

        let mut batch = WriteBatch::with_defaults();
        batch.put(b"x", b"1").unwrap();
        batch.put(b"y", b"2").unwrap();
        batch.put(b"x", b"3").unwrap();
        batch.delete(b"y").unwrap();
        let result = writer.commit(batch).unwrap();

        assert_eq!(result.committed, 2);
        assert_eq!(engine.get(b"x").unwrap(), Some(b"3".to_vec()));
        assert_eq!(engine.get(b"y").unwrap(), None);
    }

    #[test]
    fn capacity_limits_are_enforced() {
        let mut batch = WriteBatch::new(BatchConfig {
            max_batch_size: 2,
            max_batch_memory: 1024,
            ..BatchConfig::default()
        });
        batch.put(b"a", b"1").unwrap();
        batch.put(b"b", b"2").unwrap();
        assert!(matches!(batch.put(b"c", b"3"), Err(EngineError::BatchFull)));

        let mut batch = WriteBatch::new(BatchConfig {
            max_batch_size: 100,
            max_batch_memory: 10,
            ..BatchConfig::default()
        });
        batch.put(b"a", b"12345").unwrap();
        assert!(matches!(
            batch.put(b"b", b"123456789"),
            Err(EngineError::BatchTooLarge)
        ));
    }

    #[test]
    fn cancel_empties_the_batch() {
        let mut batch = WriteBatch::with_defaults();
        batch.put(b"a", b"1").unwrap();
        batch.cancel();
        assert!(batch.is_empty());
        assert_eq!(batch.memory_usage(), 0);

        let writer = BatchWriter::new(engine());
        let result = writer.commit(batch).unwrap();
        assert_eq!(result.committed, 0);
    }

    #[test]
    fn commit_time_is_recorded() {
        let writer = BatchWriter::new(engine());
        let mut batch = WriteBatch::with_defaults();
        for i in 0..100u32 {
            batch
                .put(format!("k{i:03}").as_bytes(), b"v")
                .unwrap();
        }
        let result = writer.commit(batch).unwrap();
        assert_eq!(result.committed, 100);
        assert!(result.commit_time_us > 0);
    }

    #[test]
    fn zero_timeout_fails_fast_with_timeout_code() {
        let engine = engine();
        let writer = BatchWriter::new(Arc::clone(&engine));
        let mut batch = WriteBatch::new(BatchConfig {
            timeout: Some(Duration::ZERO),
            ..BatchConfig::default()
        });
        for i in 0..100u32 {
            batch.put(format!("k{i:03}").as_bytes(), b"v").unwrap();
        }

        let started = Instant::now();
        let result = writer.commit(batch).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1), "commit hung");
        assert_eq!(result.committed, 0);
        assert_eq!(result.failed, 100);
        assert_eq!(result.first_error_code, Some(ErrorCode::Timeout));
        assert_eq!(result.first_error_index, Some(0));
    }

    #[test]
    fn generous_timeout_commits_everything() {
        let engine = engine();
        let writer = BatchWriter::new(Arc::clone(&engine));
        let mut batch = WriteBatch::new(BatchConfig {
            timeout: Some(Duration::from_secs(60)),
            ..BatchConfig::default()
        });
        for i in 0..100u32 {
            batch.put(format!("k{i:03}").as_bytes(), b"v").unwrap();
        }
        let result = writer.commit(batch).unwrap();
        assert_eq!(result.committed, 100);
        assert_eq!(result.first_error_code, None);
    }

    #[test]
    fn async_submit_completes_and_fires_callbacks() {
        let engine = engine();
        let writer = AsyncBatchWriter::new(Arc::clone(&engine));
        let entry_acks = Arc::new(AtomicUsize::new(0));
        let acks = Arc::clone(&entry_acks);
        let batch_done = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&batch_done);

        let mut batch = WriteBatch::with_defaults();
        batch.put(b"a", b"1").unwrap();
        batch.put(b"b", b"2").unwrap();

        let handle = writer.submit(
            batch,
            Some(Box::new(move |_index, code| {
                assert_eq!(code, ErrorCode::None);
                acks.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move |result| {
                assert_eq!(result.committed, 2);
                done.store(true, Ordering::SeqCst);
            })),
        );

        let result = handle.wait(Duration::from_secs(5)).expect("batch settled");
        assert_eq!(result.committed, 2);
        assert_eq!(entry_acks.load(Ordering::SeqCst), 2);
        assert!(batch_done.load(Ordering::SeqCst));
        assert!(handle.is_settled());
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn cancelled_before_start_marks_entries_cancelled() {
        let engine = engine();
        let writer = AsyncBatchWriter::new(Arc::clone(&engine));

        // Park the worker behind a large batch so the second one is
        // still queued when we cancel it.
        let mut blocker = WriteBatch::with_defaults();
        for i in 0..5000u32 {
            blocker
                .put(format!("blk{i:05}").as_bytes(), &[0u8; 64])
                .unwrap();
        }
        let _first = writer.submit(blocker, None, None);

        let mut batch = WriteBatch::with_defaults();
        batch.put(b"victim", b"v").unwrap();
        let handle = writer.submit(batch, None, None);
        handle.cancel();

        let result = handle.wait(Duration::from_secs(5)).expect("settled");
        assert_eq!(result.first_error_code, Some(ErrorCode::Cancelled));
        // The cancelled batch must not have been applied... unless the
        // worker won the race and committed before the cancel landed.
        if result.committed == 0 {
            assert_eq!(engine.get(b"victim").unwrap(), None);
        }
    }

    #[test]
    fn wait_times_out_on_busy_worker() {
        let engine = engine();
        let writer = AsyncBatchWriter::new(Arc::clone(&engine));
        let mut big = WriteBatch::with_defaults();
        for i in 0..10_000u32 {
            big.put(format!("k{i:06}").as_bytes(), &[0u8; 128]).unwrap();
        }
        let handle = writer.submit(big, None, None);
        // An absurdly short deadline may or may not settle; both paths
        // are legal, but the call must return promptly either way.
        let started = Instant::now();
        let _ = handle.wait(Duration::from_micros(1));
        assert!(started.elapsed() < Duration::from_secs(1));
        // Eventually it settles.
        assert!(handle.wait(Duration::from_secs(10)).is_some());
    }
}
