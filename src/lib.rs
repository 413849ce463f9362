//! # ConcordKV storage core
//!
//! A pluggable, embeddable key-value storage engine. Byte-string keys
//! and values flow through one uniform operation surface — point
//! put/get/delete/update, range and prefix scans, batch commits — and
//! callers pick a concrete engine by configuration.
//!
//! ## Engines
//!
//! | Selector  | Engine | Shape |
//! |-----------|--------|-------|
//! | `array`   | [`engine::array::ArrayEngine`] | sorted vector, tiny tables |
//! | `hash`    | [`engine::hash::HashEngine`] | sharded hash map, unordered |
//! | `rbtree`  | [`engine::rbtree::RbTreeEngine`] | arena-backed red–black tree |
//! | `btree`   | [`btree::BTreeEngine`] | B+Tree with adaptive fanout |
//! | `lsm`     | [`lsm::LsmTree`] | memtables + SSTables + WAL, durable |
//!
//! All five implement [`engine::StorageEngine`]; the
//! [factory](factory::create_engine) maps selector strings to
//! constructors and [`factory::EngineManager`] routes between several
//! engines at once.
//!
//! ## Durability (LSM)
//!
//! Writes are logged to a rotating, CRC-protected [WAL](wal) before
//! touching the [memtable](memtable); full memtables freeze and flush to
//! immutable [SSTables](sstable) registered in a seven-level hierarchy.
//! Background [compaction](compaction) merges tables downward, the
//! [manifest](manifest) records the durable file set and recovery
//! cursor, and crash recovery replays the WAL tail. Point-in-time
//! [snapshots](lsm::snapshot) (full and incremental) round the picture
//! out.
//!
//! ## Around the engines
//!
//! - [`cache`] — LRU/LFU/FIFO/RANDOM/CLOCK/ARC cache with TTL and a
//!   background janitor;
//! - [`query`] — range/prefix scans with pagination over any engine;
//! - [`batch`] — deduplicating, atomically committing batch writer with
//!   an asynchronous variant;
//! - [`config`] — sectioned config files plus environment overrides.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use concordkv::engine::StorageEngine;
//! use concordkv::lsm::{LsmConfig, LsmTree};
//!
//! let tree = LsmTree::open("/tmp/concord-demo", LsmConfig::default()).unwrap();
//! tree.put(b"hello", b"world").unwrap();
//! assert_eq!(tree.get(b"hello").unwrap(), Some(b"world".to_vec()));
//! tree.delete(b"hello").unwrap();
//! tree.close().unwrap();
//! ```

pub mod arena;
pub mod batch;
pub mod btree;
pub mod cache;
pub mod compaction;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod factory;
pub mod lsm;
pub mod manifest;
pub mod memtable;
pub mod query;
pub mod sstable;
pub mod sync;
pub mod time;
pub mod wal;

pub use batch::{AsyncBatchWriter, BatchConfig, BatchResult, BatchWriter, WriteBatch};
pub use btree::BTreeEngine;
pub use cache::{Cache, CacheConfig, CachePolicy};
pub use config::Config;
pub use engine::{EngineError, EngineKind, EngineState, KeyRange, KvPair, StorageEngine};
pub use error::ErrorCode;
pub use factory::{EngineManager, SelectionStrategy, create_engine, create_engine_by_name};
pub use lsm::{LsmConfig, LsmTree};
pub use query::{QueryOptions, QueryResult, RangeQueryManager};
