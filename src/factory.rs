//! Engine factory and the multi-engine manager.
//!
//! The factory maps configuration selector strings onto concrete engine
//! constructors behind `Arc<dyn StorageEngine>`. The manager owns a set
//! of constructed engines plus a "current" selector and supports three
//! selection strategies:
//!
//! - **Fixed** — every call routes to the current engine;
//! - **Adaptive** — ordered-scan work routes to an ordered engine,
//!   point work prefers the hash engine when present;
//! - **LoadBalanced** — plain round-robin across the set.
//!
//! `hot_reload` parses a fresh config file, diffs the desired engine set
//! against the running one, creates and closes engines to match, and
//! swaps the active set atomically under the manager's write lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::btree::BTreeEngine;
use crate::config::Config;
use crate::engine::array::ArrayEngine;
use crate::engine::hash::HashEngine;
use crate::engine::rbtree::RbTreeEngine;
use crate::engine::{EngineError, EngineKind, StorageEngine};
use crate::lsm::LsmTree;

/// Engine-selection strategy of the [`EngineManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Always the current engine.
    #[default]
    Fixed,
    /// Pick per operation using workload hints.
    Adaptive,
    /// Round-robin across all engines.
    LoadBalanced,
}

impl SelectionStrategy {
    /// Parses a configuration selector string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(Self::Fixed),
            "adaptive" => Some(Self::Adaptive),
            "load_balanced" => Some(Self::LoadBalanced),
            _ => None,
        }
    }

    /// The canonical selector string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Adaptive => "adaptive",
            Self::LoadBalanced => "load_balanced",
        }
    }
}

/// Workload hint consumed by the adaptive strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadHint {
    /// Single-key read.
    PointRead,
    /// Single-key write.
    PointWrite,
    /// Ordered range or prefix scan.
    RangeScan,
}

/// Constructs an engine of the given kind from the configuration.
///
/// The LSM engine persists under `storage.data_dir/<kind>`; the
/// in-memory engines take their tuning from the matching sections.
pub fn create_engine(
    kind: EngineKind,
    config: &Config,
) -> Result<Arc<dyn StorageEngine>, EngineError> {
    let engine: Arc<dyn StorageEngine> = match kind {
        EngineKind::Array => Arc::new(ArrayEngine::new()),
        EngineKind::Hash => Arc::new(HashEngine::new()),
        EngineKind::RbTree => Arc::new(RbTreeEngine::new()),
        EngineKind::BTree => Arc::new(BTreeEngine::with_config(config.btree_config())),
        EngineKind::Lsm => {
            let dir = config.storage.data_dir.join(kind.as_str());
            Arc::new(LsmTree::open(dir, config.lsm_config())?)
        }
    };
    info!(kind = %kind, "engine created");
    Ok(engine)
}

/// Constructs an engine from its selector string.
pub fn create_engine_by_name(
    name: &str,
    config: &Config,
) -> Result<Arc<dyn StorageEngine>, EngineError> {
    let kind = EngineKind::parse(name)
        .ok_or_else(|| EngineError::InvalidParam(format!("unknown engine selector {name:?}")))?;
    create_engine(kind, config)
}

struct ManagerInner {
    engines: HashMap<EngineKind, Arc<dyn StorageEngine>>,
    current: EngineKind,
    strategy: SelectionStrategy,
    config: Config,
}

/// Owns a set of engines and routes operations between them.
pub struct EngineManager {
    inner: RwLock<ManagerInner>,
    round_robin: AtomicUsize,
}

impl EngineManager {
    /// Builds a manager holding the configured default engine.
    pub fn from_config(config: Config) -> Result<Self, EngineError> {
        let current = config.engine.default_engine;
        let mut engines = HashMap::new();
        engines.insert(current, create_engine(current, &config)?);
        Ok(Self {
            inner: RwLock::new(ManagerInner {
                engines,
                current,
                strategy: config.engine.strategy,
                config,
            }),
            round_robin: AtomicUsize::new(0),
        })
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, ManagerInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, ManagerInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The current engine.
    pub fn current(&self) -> Arc<dyn StorageEngine> {
        let inner = self.read_inner();
        Arc::clone(
            inner
                .engines
                .get(&inner.current)
                .expect("current engine missing from the managed set"),
        )
    }

    /// A specific engine, when constructed.
    pub fn engine(&self, kind: EngineKind) -> Option<Arc<dyn StorageEngine>> {
        self.read_inner().engines.get(&kind).cloned()
    }

    /// Kinds currently managed, unordered.
    pub fn kinds(&self) -> Vec<EngineKind> {
        self.read_inner().engines.keys().copied().collect()
    }

    /// The active selection strategy.
    pub fn strategy(&self) -> SelectionStrategy {
        self.read_inner().strategy
    }

    /// Constructs and registers an engine, honouring `max_engines`.
    pub fn ensure_engine(&self, kind: EngineKind) -> Result<Arc<dyn StorageEngine>, EngineError> {
        if let Some(existing) = self.engine(kind) {
            return Ok(existing);
        }
        let mut inner = self.write_inner();
        if inner.engines.len() >= inner.config.engine.max_engines {
            return Err(EngineError::InvalidState(format!(
                "engine limit {} reached",
                inner.config.engine.max_engines
            )));
        }
        let engine = create_engine(kind, &inner.config)?;
        inner.engines.insert(kind, Arc::clone(&engine));
        Ok(engine)
    }

    /// Closes and drops an engine. The current engine cannot be removed.
    pub fn remove_engine(&self, kind: EngineKind) -> Result<(), EngineError> {
        let mut inner = self.write_inner();
        if inner.current == kind {
            return Err(EngineError::InvalidParam(
                "cannot remove the current engine".into(),
            ));
        }
        if let Some(engine) = inner.engines.remove(&kind) {
            engine.close()?;
        }
        Ok(())
    }

    /// Switches the current engine.
    pub fn set_current(&self, kind: EngineKind) -> Result<(), EngineError> {
        let mut inner = self.write_inner();
        if !inner.engines.contains_key(&kind) {
            return Err(EngineError::InvalidParam(format!(
                "engine {kind} is not managed"
            )));
        }
        inner.current = kind;
        Ok(())
    }

    /// Picks an engine for the hinted workload per the strategy.
    pub fn select(&self, hint: WorkloadHint) -> Arc<dyn StorageEngine> {
        let inner = self.read_inner();
        let fallback = Arc::clone(
            inner
                .engines
                .get(&inner.current)
                .expect("current engine missing from the managed set"),
        );
        match inner.strategy {
            SelectionStrategy::Fixed => fallback,
            SelectionStrategy::Adaptive => match hint {
                WorkloadHint::RangeScan => inner
                    .engines
                    .values()
                    .find(|engine| engine.ordered())
                    .cloned()
                    .unwrap_or(fallback),
                WorkloadHint::PointRead | WorkloadHint::PointWrite => inner
                    .engines
                    .get(&EngineKind::Hash)
                    .cloned()
                    .unwrap_or(fallback),
            },
            SelectionStrategy::LoadBalanced => {
                let mut kinds: Vec<EngineKind> = inner.engines.keys().copied().collect();
                kinds.sort_by_key(|kind| kind.as_str());
                let slot = self.round_robin.fetch_add(1, Ordering::Relaxed) % kinds.len();
                inner
                    .engines
                    .get(&kinds[slot])
                    .cloned()
                    .unwrap_or(fallback)
            }
        }
    }

    /// Re-reads the configuration, diffs the engine set, and swaps the
    /// active set atomically.
    ///
    /// The desired set is the new default engine plus every currently
    /// managed kind the new config still allows; surplus engines are
    /// closed, missing ones are created.
    pub fn hot_reload(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let new_config = Config::load(path)
            .map_err(|e| EngineError::InvalidParam(format!("config reload failed: {e}")))?;
        let desired_default = new_config.engine.default_engine;

        // Build the replacement set outside the write lock where
        // possible; only the swap itself is exclusive.
        let mut inner = self.write_inner();
        if !inner.engines.contains_key(&desired_default) {
            let engine = create_engine(desired_default, &new_config)?;
            inner.engines.insert(desired_default, engine);
        }

        // Trim past the new engine budget, never dropping the default.
        while inner.engines.len() > new_config.engine.max_engines.max(1) {
            let victim = inner
                .engines
                .keys()
                .copied()
                .find(|kind| *kind != desired_default);
            match victim {
                Some(kind) => {
                    if let Some(engine) = inner.engines.remove(&kind) {
                        if let Err(e) = engine.close() {
                            warn!(kind = %kind, error = %e, "engine close failed during reload");
                        }
                    }
                }
                None => break,
            }
        }

        inner.current = desired_default;
        inner.strategy = new_config.engine.strategy;
        inner.config = new_config;
        info!(current = %desired_default, "configuration hot-reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.to_path_buf();
        config.engine.default_engine = EngineKind::BTree;
        config
    }

    #[test]
    fn factory_builds_every_kind() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        for kind in [
            EngineKind::Array,
            EngineKind::Hash,
            EngineKind::RbTree,
            EngineKind::BTree,
            EngineKind::Lsm,
        ] {
            let engine = create_engine(kind, &config).unwrap();
            assert_eq!(engine.kind(), kind);
            engine.put(b"k", b"v").unwrap();
            assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
            engine.close().unwrap();
        }
    }

    #[test]
    fn unknown_selector_is_invalid_param() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        assert!(matches!(
            create_engine_by_name("rolodex", &config),
            Err(EngineError::InvalidParam(_))
        ));
        assert!(create_engine_by_name("rbtree", &config).is_ok());
    }

    #[test]
    fn manager_starts_with_the_default_engine() {
        let tmp = TempDir::new().unwrap();
        let manager = EngineManager::from_config(test_config(tmp.path())).unwrap();
        assert_eq!(manager.current().kind(), EngineKind::BTree);
        assert_eq!(manager.kinds(), vec![EngineKind::BTree]);
    }

    #[test]
    fn ensure_and_remove_engines() {
        let tmp = TempDir::new().unwrap();
        let manager = EngineManager::from_config(test_config(tmp.path())).unwrap();
        manager.ensure_engine(EngineKind::Hash).unwrap();
        assert!(manager.engine(EngineKind::Hash).is_some());

        assert!(manager.remove_engine(EngineKind::BTree).is_err());
        manager.remove_engine(EngineKind::Hash).unwrap();
        assert!(manager.engine(EngineKind::Hash).is_none());
    }

    #[test]
    fn engine_budget_is_enforced() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.engine.max_engines = 2;
        let manager = EngineManager::from_config(config).unwrap();
        manager.ensure_engine(EngineKind::Hash).unwrap();
        assert!(matches!(
            manager.ensure_engine(EngineKind::Array),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn adaptive_routing_prefers_shapes() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.engine.strategy = SelectionStrategy::Adaptive;
        let manager = EngineManager::from_config(config).unwrap();
        manager.ensure_engine(EngineKind::Hash).unwrap();

        assert_eq!(
            manager.select(WorkloadHint::PointRead).kind(),
            EngineKind::Hash
        );
        assert!(manager.select(WorkloadHint::RangeScan).ordered());
    }

    #[test]
    fn load_balanced_rotates() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.engine.strategy = SelectionStrategy::LoadBalanced;
        let manager = EngineManager::from_config(config).unwrap();
        manager.ensure_engine(EngineKind::Hash).unwrap();

        let picks: Vec<EngineKind> = (0..4)
            .map(|_| manager.select(WorkloadHint::PointRead).kind())
            .collect();
        assert!(picks.contains(&EngineKind::BTree));
        assert!(picks.contains(&EngineKind::Hash));
    }

    #[test]
    fn hot_reload_swaps_default_and_strategy() {
        let tmp = TempDir::new().unwrap();
        let manager = EngineManager::from_config(test_config(tmp.path())).unwrap();
        assert_eq!(manager.current().kind(), EngineKind::BTree);

        let conf_path = tmp.path().join("reload.conf");
        std::fs::write(
            &conf_path,
            "[engine]\ndefault = rbtree\nstrategy = load_balanced\n",
        )
        .unwrap();
        manager.hot_reload(&conf_path).unwrap();

        assert_eq!(manager.current().kind(), EngineKind::RbTree);
        assert_eq!(manager.strategy(), SelectionStrategy::LoadBalanced);
        // The previous default is still in the set until trimmed.
        assert!(manager.engine(EngineKind::BTree).is_some());
    }
}
