//! Configuration: typed sections, file parsing, environment overrides.
//!
//! Config files are `[section]` headers over `key = value` pairs, with
//! `#` comments. `section.key = value` on a single line works too.
//! Unknown keys are ignored with a warning (forward compatibility);
//! unparsable values are errors. Environment variables of the shape
//! `{PREFIX}_{SECTION}_{KEY}` (uppercased) override file values.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::btree::BTreeConfig;
use crate::cache::{CacheConfig, CachePolicy};
use crate::engine::EngineKind;
use crate::error::ErrorCode;
use crate::factory::SelectionStrategy;
use crate::lsm::LsmConfig;
use crate::sstable::Compression;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A line did not parse as `[section]` or `key = value`.
    #[error("config syntax error on line {line}: {message}")]
    Syntax {
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// A value failed to parse for its key.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Fully qualified `section.key`.
        key: String,
        /// Offending text.
        value: String,
        /// What was expected.
        reason: String,
    },
}

impl ConfigError {
    /// Maps onto the stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::IoError,
            Self::Syntax { .. } | Self::InvalidValue { .. } => ErrorCode::InvalidParam,
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone)]
pub struct EngineSection {
    /// Engine constructed by default.
    pub default_engine: EngineKind,
    /// Engine-selection strategy of the manager.
    pub strategy: SelectionStrategy,
    /// Upper bound on concurrently managed engines.
    pub max_engines: usize,
}

/// `[memory]` section.
#[derive(Debug, Clone)]
pub struct MemorySection {
    /// Global memory ceiling in bytes.
    pub limit_bytes: usize,
}

/// `[threads]` section.
#[derive(Debug, Clone)]
pub struct ThreadsSection {
    /// Background worker threads (compaction pool).
    pub worker: usize,
    /// I/O helper threads.
    pub io: usize,
}

/// `[storage]` section.
#[derive(Debug, Clone)]
pub struct StorageSection {
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Write-ahead logging switch.
    pub enable_wal: bool,
    /// Fsync after every WAL record.
    pub sync_writes: bool,
    /// Periodic sync interval in seconds when `sync_writes` is off.
    pub sync_interval_s: u64,
}

/// `[lsm]` section.
#[derive(Debug, Clone)]
pub struct LsmSection {
    /// Memtable freeze threshold in bytes.
    pub memtable_size: usize,
    /// Frozen-memtable FIFO bound.
    pub max_immutable: usize,
    /// Level-0 file count triggering compaction.
    pub level0_file_limit: usize,
    /// Per-level byte-budget multiplier.
    pub level_size_multiplier: u64,
    /// Data-block codec.
    pub compression: Compression,
    /// Bloom bits per key.
    pub bloom_bits_per_key: usize,
}

/// `[btree]` section.
#[derive(Debug, Clone)]
pub struct BtreeSection {
    /// Node order.
    pub order: usize,
    /// Hot-leaf cache capacity.
    pub cache_nodes: usize,
    /// Adaptive-fanout switch.
    pub adaptive: bool,
}

/// `[cache]` section.
#[derive(Debug, Clone)]
pub struct CacheSection {
    /// Cache byte budget.
    pub size_bytes: usize,
    /// Eviction policy.
    pub policy: CachePolicy,
    /// Default TTL in milliseconds (0 = none).
    pub default_ttl_ms: u64,
    /// Janitor interval in milliseconds (0 disables).
    pub cleanup_ms: u64,
    /// Extra eviction headroom fraction.
    pub eviction_factor: f64,
}

/// The complete configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// `[engine]`.
    pub engine: EngineSection,
    /// `[memory]`.
    pub memory: MemorySection,
    /// `[threads]`.
    pub threads: ThreadsSection,
    /// `[storage]`.
    pub storage: StorageSection,
    /// `[lsm]`.
    pub lsm: LsmSection,
    /// `[btree]`.
    pub btree: BtreeSection,
    /// `[cache]`.
    pub cache: CacheSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineSection {
                default_engine: EngineKind::Lsm,
                strategy: SelectionStrategy::Fixed,
                max_engines: 5,
            },
            memory: MemorySection {
                limit_bytes: 256 * 1024 * 1024,
            },
            threads: ThreadsSection { worker: 4, io: 2 },
            storage: StorageSection {
                data_dir: PathBuf::from("./data"),
                enable_wal: true,
                sync_writes: false,
                sync_interval_s: 5,
            },
            lsm: LsmSection {
                memtable_size: 4 * 1024 * 1024,
                max_immutable: 5,
                level0_file_limit: 4,
                level_size_multiplier: 10,
                compression: Compression::None,
                bloom_bits_per_key: 10,
            },
            btree: BtreeSection {
                order: 100,
                cache_nodes: 1024,
                adaptive: true,
            },
            cache: CacheSection {
                size_bytes: 64 * 1024 * 1024,
                policy: CachePolicy::Lru,
                default_ttl_ms: 3_600_000,
                cleanup_ms: 60_000,
                eviction_factor: 0.1,
            },
        }
    }
}

/// Every recognized `(section, key)` pair; drives the env override scan.
const KNOWN_KEYS: &[(&str, &str)] = &[
    ("engine", "default"),
    ("engine", "strategy"),
    ("engine", "max_engines"),
    ("memory", "limit_bytes"),
    ("threads", "worker"),
    ("threads", "io"),
    ("storage", "data_dir"),
    ("storage", "enable_wal"),
    ("storage", "sync_writes"),
    ("storage", "sync_interval_s"),
    ("lsm", "memtable_size"),
    ("lsm", "max_immutable"),
    ("lsm", "level0_file_limit"),
    ("lsm", "level_size_multiplier"),
    ("lsm", "compression"),
    ("lsm", "bloom_bits_per_key"),
    ("btree", "order"),
    ("btree", "cache_nodes"),
    ("btree", "adaptive"),
    ("cache", "size_bytes"),
    ("cache", "policy"),
    ("cache", "default_ttl_ms"),
    ("cache", "cleanup_ms"),
    ("cache", "eviction_factor"),
];

fn bad_value(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        value: value.into(),
        reason: reason.into(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" => Ok(false),
        _ => Err(bad_value(key, value, "expected a boolean")),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .replace('_', "")
        .parse::<usize>()
        .map_err(|_| bad_value(key, value, "expected an unsigned integer"))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .replace('_', "")
        .parse::<u64>()
        .map_err(|_| bad_value(key, value, "expected an unsigned integer"))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .parse::<f64>()
        .map_err(|_| bad_value(key, value, "expected a number"))
}

impl Config {
    /// Loads a config file on top of the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.merge_file(path)?;
        Ok(config)
    }

    /// Applies a config file on top of the current values.
    pub fn merge_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut section = String::new();

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(inner) = line.strip_prefix('[') {
                let Some(name) = inner.strip_suffix(']') else {
                    return Err(ConfigError::Syntax {
                        line: number + 1,
                        message: "unterminated section header".into(),
                    });
                };
                section = name.trim().to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax {
                    line: number + 1,
                    message: "expected `key = value`".into(),
                });
            };
            let key = key.trim();
            let value = value.trim();
            // `section.key = value` works without a header too.
            let (section_name, key_name) = match key.split_once('.') {
                Some((s, k)) => (s.trim().to_string(), k.trim().to_string()),
                None => (section.clone(), key.to_string()),
            };
            self.apply(&section_name, &key_name, value)?;
        }
        Ok(())
    }

    /// Overrides from `{PREFIX}_{SECTION}_{KEY}` environment variables.
    pub fn apply_env(&mut self, prefix: &str) -> Result<(), ConfigError> {
        for (section, key) in KNOWN_KEYS {
            let var = format!(
                "{}_{}_{}",
                prefix.to_uppercase(),
                section.to_uppercase(),
                key.to_uppercase()
            );
            if let Ok(value) = std::env::var(&var) {
                self.apply(section, key, value.trim())?;
            }
        }
        Ok(())
    }

    /// Applies a single typed option.
    pub fn apply(&mut self, section: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        let qualified = format!("{section}.{key}");
        match (section, key) {
            ("engine", "default") => {
                self.engine.default_engine = EngineKind::parse(value)
                    .ok_or_else(|| bad_value(&qualified, value, "unknown engine selector"))?;
            }
            ("engine", "strategy") => {
                self.engine.strategy = SelectionStrategy::parse(value)
                    .ok_or_else(|| bad_value(&qualified, value, "unknown strategy"))?;
            }
            ("engine", "max_engines") => self.engine.max_engines = parse_usize(&qualified, value)?,
            ("memory", "limit_bytes") => self.memory.limit_bytes = parse_usize(&qualified, value)?,
            ("threads", "worker") => self.threads.worker = parse_usize(&qualified, value)?,
            ("threads", "io") => self.threads.io = parse_usize(&qualified, value)?,
            ("storage", "data_dir") => self.storage.data_dir = PathBuf::from(value),
            ("storage", "enable_wal") => self.storage.enable_wal = parse_bool(&qualified, value)?,
            ("storage", "sync_writes") => {
                self.storage.sync_writes = parse_bool(&qualified, value)?;
            }
            ("storage", "sync_interval_s") => {
                self.storage.sync_interval_s = parse_u64(&qualified, value)?;
            }
            ("lsm", "memtable_size") => self.lsm.memtable_size = parse_usize(&qualified, value)?,
            ("lsm", "max_immutable") => self.lsm.max_immutable = parse_usize(&qualified, value)?,
            ("lsm", "level0_file_limit") => {
                self.lsm.level0_file_limit = parse_usize(&qualified, value)?;
            }
            ("lsm", "level_size_multiplier") => {
                self.lsm.level_size_multiplier = parse_u64(&qualified, value)?;
            }
            ("lsm", "compression") => {
                self.lsm.compression = Compression::parse(value)
                    .ok_or_else(|| bad_value(&qualified, value, "unknown codec"))?;
            }
            ("lsm", "bloom_bits_per_key") => {
                self.lsm.bloom_bits_per_key = parse_usize(&qualified, value)?;
            }
            ("btree", "order") => self.btree.order = parse_usize(&qualified, value)?,
            ("btree", "cache_nodes") => self.btree.cache_nodes = parse_usize(&qualified, value)?,
            ("btree", "adaptive") => self.btree.adaptive = parse_bool(&qualified, value)?,
            ("cache", "size_bytes") => self.cache.size_bytes = parse_usize(&qualified, value)?,
            ("cache", "policy") => {
                self.cache.policy = CachePolicy::parse(value)
                    .ok_or_else(|| bad_value(&qualified, value, "unknown cache policy"))?;
            }
            ("cache", "default_ttl_ms") => {
                self.cache.default_ttl_ms = parse_u64(&qualified, value)?;
            }
            ("cache", "cleanup_ms") => self.cache.cleanup_ms = parse_u64(&qualified, value)?,
            ("cache", "eviction_factor") => {
                let factor = parse_f64(&qualified, value)?;
                if !(0.0..=1.0).contains(&factor) {
                    return Err(bad_value(&qualified, value, "expected a fraction in [0, 1]"));
                }
                self.cache.eviction_factor = factor;
            }
            _ => {
                warn!(section, key, "ignoring unrecognised config option");
            }
        }
        Ok(())
    }

    /// The LSM engine knobs derived from this configuration.
    pub fn lsm_config(&self) -> LsmConfig {
        LsmConfig {
            memtable_size: self.lsm.memtable_size,
            max_immutable: self.lsm.max_immutable,
            enable_wal: self.storage.enable_wal,
            sync_writes: self.storage.sync_writes,
            sync_interval: std::time::Duration::from_secs(self.storage.sync_interval_s),
            level0_file_limit: self.lsm.level0_file_limit,
            level_size_multiplier: self.lsm.level_size_multiplier,
            compression: self.lsm.compression,
            bloom_bits_per_key: self.lsm.bloom_bits_per_key,
            compaction_workers: self.threads.worker.clamp(1, 16),
            ..LsmConfig::default()
        }
    }

    /// The B+Tree engine knobs derived from this configuration.
    pub fn btree_config(&self) -> BTreeConfig {
        BTreeConfig {
            order: self.btree.order,
            adaptive: self.btree.adaptive,
            cache_nodes: self.btree.cache_nodes,
            ..BTreeConfig::default()
        }
    }

    /// The cache knobs derived from this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        use std::time::Duration;
        CacheConfig {
            max_bytes: self.cache.size_bytes,
            policy: self.cache.policy,
            default_ttl: (self.cache.default_ttl_ms > 0)
                .then(|| Duration::from_millis(self.cache.default_ttl_ms)),
            cleanup_interval: (self.cache.cleanup_ms > 0)
                .then(|| Duration::from_millis(self.cache.cleanup_ms)),
            eviction_factor: self.cache.eviction_factor,
            ..CacheConfig::default()
        }
    }
}
