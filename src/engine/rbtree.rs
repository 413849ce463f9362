//! Red–black tree engine.
//!
//! A genuine red–black tree (insert and delete with the classic fixup
//! procedures) over an [`Arena`] of nodes. Links are arena slot ids
//! rather than pointers; slot 0 permanently holds the NIL sentinel, whose
//! parent link is deliberately mutable so the delete fixup can walk
//! through it exactly as the textbook formulation requires.
//!
//! Tree invariants:
//! - the root and the sentinel are black;
//! - a red node has black children;
//! - every root-to-leaf path carries the same number of black nodes.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::arena::{Arena, SlotId};
use crate::engine::{
    EngineError, EngineIter, EngineKind, EngineState, EngineStats, KeyRange, KvPair,
    SequenceSource, StateCell, StatsSnapshot, StorageEngine, check_key, prefix_upper_bound,
};

const NIL: SlotId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug)]
struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    seq: u64,
    color: Color,
    left: SlotId,
    right: SlotId,
    parent: SlotId,
}

/// The tree proper. All link manipulation happens through the small
/// accessor helpers below so the insert/delete procedures read like the
/// textbook pseudocode they implement.
struct RbTree {
    arena: Arena<Node>,
    root: SlotId,
    len: usize,
}

impl RbTree {
    fn new() -> Self {
        let mut arena = Arena::with_capacity(16);
        let sentinel = arena.insert(Node {
            key: Vec::new(),
            value: Vec::new(),
            seq: 0,
            color: Color::Black,
            left: NIL,
            right: NIL,
            parent: NIL,
        });
        debug_assert_eq!(sentinel, NIL);
        Self {
            arena,
            root: NIL,
            len: 0,
        }
    }

    // -- link accessors ------------------------------------------------------

    fn node(&self, id: SlotId) -> &Node {
        self.arena.get(id).expect("rbtree link to vacant slot")
    }

    fn node_mut(&mut self, id: SlotId) -> &mut Node {
        self.arena.get_mut(id).expect("rbtree link to vacant slot")
    }

    fn color(&self, id: SlotId) -> Color {
        self.node(id).color
    }

    fn set_color(&mut self, id: SlotId, color: Color) {
        // The sentinel stays black no matter what the fixup asks for.
        if id != NIL {
            self.node_mut(id).color = color;
        }
    }

    fn left(&self, id: SlotId) -> SlotId {
        self.node(id).left
    }

    fn right(&self, id: SlotId) -> SlotId {
        self.node(id).right
    }

    fn parent(&self, id: SlotId) -> SlotId {
        self.node(id).parent
    }

    fn set_left(&mut self, id: SlotId, child: SlotId) {
        self.node_mut(id).left = child;
    }

    fn set_right(&mut self, id: SlotId, child: SlotId) {
        self.node_mut(id).right = child;
    }

    fn set_parent(&mut self, id: SlotId, parent: SlotId) {
        self.node_mut(id).parent = parent;
    }

    // -- rotations -----------------------------------------------------------

    fn rotate_left(&mut self, x: SlotId) {
        let y = self.right(x);
        let y_left = self.left(y);
        self.set_right(x, y_left);
        if y_left != NIL {
            self.set_parent(y_left, x);
        }
        let xp = self.parent(x);
        self.set_parent(y, xp);
        if xp == NIL {
            self.root = y;
        } else if self.left(xp) == x {
            self.set_left(xp, y);
        } else {
            self.set_right(xp, y);
        }
        self.set_left(y, x);
        self.set_parent(x, y);
    }

    fn rotate_right(&mut self, x: SlotId) {
        let y = self.left(x);
        let y_right = self.right(y);
        self.set_left(x, y_right);
        if y_right != NIL {
            self.set_parent(y_right, x);
        }
        let xp = self.parent(x);
        self.set_parent(y, xp);
        if xp == NIL {
            self.root = y;
        } else if self.right(xp) == x {
            self.set_right(xp, y);
        } else {
            self.set_left(xp, y);
        }
        self.set_right(y, x);
        self.set_parent(x, y);
    }

    // -- search --------------------------------------------------------------

    fn find(&self, key: &[u8]) -> SlotId {
        let mut cur = self.root;
        while cur != NIL {
            match key.cmp(self.node(cur).key.as_slice()) {
                std::cmp::Ordering::Equal => return cur,
                std::cmp::Ordering::Less => cur = self.left(cur),
                std::cmp::Ordering::Greater => cur = self.right(cur),
            }
        }
        NIL
    }

    fn minimum(&self, mut id: SlotId) -> SlotId {
        while self.left(id) != NIL {
            id = self.left(id);
        }
        id
    }

    // -- insert --------------------------------------------------------------

    /// Inserts or overwrites. Returns true when a new node was created.
    fn insert(&mut self, key: &[u8], value: &[u8], seq: u64) -> bool {
        let mut parent = NIL;
        let mut cur = self.root;
        while cur != NIL {
            parent = cur;
            match key.cmp(self.node(cur).key.as_slice()) {
                std::cmp::Ordering::Equal => {
                    let node = self.node_mut(cur);
                    node.value = value.to_vec();
                    node.seq = seq;
                    return false;
                }
                std::cmp::Ordering::Less => cur = self.left(cur),
                std::cmp::Ordering::Greater => cur = self.right(cur),
            }
        }

        let z = self.arena.insert(Node {
            key: key.to_vec(),
            value: value.to_vec(),
            seq,
            color: Color::Red,
            left: NIL,
            right: NIL,
            parent,
        });
        if parent == NIL {
            self.root = z;
        } else if key < self.node(parent).key.as_slice() {
            self.set_left(parent, z);
        } else {
            self.set_right(parent, z);
        }
        self.len += 1;
        self.insert_fixup(z);
        true
    }

    fn insert_fixup(&mut self, mut z: SlotId) {
        while self.color(self.parent(z)) == Color::Red {
            let zp = self.parent(z);
            let zpp = self.parent(zp);
            if zp == self.left(zpp) {
                let uncle = self.right(zpp);
                if self.color(uncle) == Color::Red {
                    self.set_color(zp, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(zpp, Color::Red);
                    z = zpp;
                } else {
                    if z == self.right(zp) {
                        z = zp;
                        self.rotate_left(z);
                    }
                    let zp = self.parent(z);
                    let zpp = self.parent(zp);
                    self.set_color(zp, Color::Black);
                    self.set_color(zpp, Color::Red);
                    self.rotate_right(zpp);
                }
            } else {
                let uncle = self.left(zpp);
                if self.color(uncle) == Color::Red {
                    self.set_color(zp, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(zpp, Color::Red);
                    z = zpp;
                } else {
                    if z == self.left(zp) {
                        z = zp;
                        self.rotate_right(z);
                    }
                    let zp = self.parent(z);
                    let zpp = self.parent(zp);
                    self.set_color(zp, Color::Black);
                    self.set_color(zpp, Color::Red);
                    self.rotate_left(zpp);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    // -- delete --------------------------------------------------------------

    fn transplant(&mut self, u: SlotId, v: SlotId) {
        let up = self.parent(u);
        if up == NIL {
            self.root = v;
        } else if self.left(up) == u {
            self.set_left(up, v);
        } else {
            self.set_right(up, v);
        }
        // The sentinel's parent is set on purpose: the delete fixup reads
        // x.parent even when x is NIL.
        self.set_parent(v, up);
    }

    /// Removes `key`. Returns false when absent.
    fn remove(&mut self, key: &[u8]) -> bool {
        let z = self.find(key);
        if z == NIL {
            return false;
        }

        let mut y = z;
        let mut y_was_black = self.color(y) == Color::Black;
        let x;

        if self.left(z) == NIL {
            x = self.right(z);
            self.transplant(z, x);
        } else if self.right(z) == NIL {
            x = self.left(z);
            self.transplant(z, x);
        } else {
            y = self.minimum(self.right(z));
            y_was_black = self.color(y) == Color::Black;
            x = self.right(y);
            if self.parent(y) == z {
                self.set_parent(x, y);
            } else {
                self.transplant(y, x);
                let zr = self.right(z);
                self.set_right(y, zr);
                self.set_parent(zr, y);
            }
            self.transplant(z, y);
            let zl = self.left(z);
            self.set_left(y, zl);
            self.set_parent(zl, y);
            let z_color = self.color(z);
            self.set_color(y, z_color);
        }

        if y_was_black {
            self.delete_fixup(x);
        }
        self.arena.remove(z);
        self.len -= 1;
        true
    }

    fn delete_fixup(&mut self, mut x: SlotId) {
        while x != self.root && self.color(x) == Color::Black {
            let xp = self.parent(x);
            if x == self.left(xp) {
                let mut w = self.right(xp);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(xp, Color::Red);
                    self.rotate_left(xp);
                    w = self.right(self.parent(x));
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        let wl = self.left(w);
                        self.set_color(wl, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(self.parent(x));
                    }
                    let xp = self.parent(x);
                    let xp_color = self.color(xp);
                    self.set_color(w, xp_color);
                    self.set_color(xp, Color::Black);
                    let wr = self.right(w);
                    self.set_color(wr, Color::Black);
                    self.rotate_left(xp);
                    x = self.root;
                }
            } else {
                let mut w = self.left(xp);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(xp, Color::Red);
                    self.rotate_right(xp);
                    w = self.left(self.parent(x));
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        let wr = self.right(w);
                        self.set_color(wr, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(self.parent(x));
                    }
                    let xp = self.parent(x);
                    let xp_color = self.color(xp);
                    self.set_color(w, xp_color);
                    self.set_color(xp, Color::Black);
                    let wl = self.left(w);
                    self.set_color(wl, Color::Black);
                    self.rotate_right(xp);
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    // -- ordered traversal ---------------------------------------------------

    /// In-order traversal with subtree pruning against the range bounds.
    /// Returns false once `limit` entries were collected.
    fn collect_range(
        &self,
        id: SlotId,
        range: &KeyRange,
        limit: usize,
        out: &mut Vec<KvPair>,
    ) -> bool {
        if id == NIL {
            return true;
        }
        let key = self.node(id).key.as_slice();

        // Left subtree can only matter when this key is above the lower bound.
        let descend_left = match &range.start {
            Some(start) => key > start.as_slice(),
            None => true,
        };
        if descend_left && !self.collect_range(self.left(id), range, limit, out) {
            return false;
        }

        if range.contains(key) {
            let node = self.node(id);
            out.push(KvPair::new(node.key.clone(), node.value.clone()));
            if limit != 0 && out.len() >= limit {
                return false;
            }
        }

        // Right subtree can only matter when this key is below the upper bound.
        let descend_right = match &range.end {
            Some(end) => key < end.as_slice(),
            None => true,
        };
        if descend_right && !self.collect_range(self.right(id), range, limit, out) {
            return false;
        }
        true
    }
}

/// Ordered red–black tree engine.
pub struct RbTreeEngine {
    tree: RwLock<RbTree>,
    seq: SequenceSource,
    stats: Arc<EngineStats>,
    state: StateCell,
}

impl RbTreeEngine {
    /// Creates an empty tree engine.
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(RbTree::new()),
            seq: SequenceSource::starting_at(1),
            stats: Arc::new(EngineStats::new()),
            state: StateCell::new(EngineState::Running),
        }
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, RbTree> {
        match self.tree.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, RbTree> {
        match self.tree.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for RbTreeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for RbTreeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::RbTree
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
        self.write_tree().insert(key, value, seq);
        self.stats.record_write(key.len() + value.len());
        Ok(())
    }

    fn get_versioned(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>, EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let tree = self.read_tree();
        let id = tree.find(key);
        let found = (id != NIL).then(|| {
            let node = tree.node(id);
            (node.value.clone(), node.seq)
        });
        drop(tree);
        self.stats
            .record_read(found.as_ref().map_or(0, |(v, _)| v.len()));
        Ok(found)
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        if !self.write_tree().remove(key) {
            return Err(EngineError::KeyNotFound);
        }
        self.seq.next();
        self.stats.record_delete();
        Ok(())
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        check_key(key)?;
        self.state.ensure_running()?;

        let mut tree = self.write_tree();
        let id = tree.find(key);
        if id == NIL {
            return Err(EngineError::KeyNotFound);
        }
        let seq = self.seq.next();
        let node = tree.node_mut(id);
        node.value = value.to_vec();
        node.seq = seq;
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
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let tree = self.read_tree();
        let mut out = Vec::new();
        tree.collect_range(tree.root, range, limit, &mut out);
        Ok(out)
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<KvPair>, EngineError> {
        self.state.ensure_running()?;
        let range = KeyRange {
            start: Some(prefix.to_vec()),
            end: prefix_upper_bound(prefix),
            start_inclusive: true,
            end_inclusive: false,
        };
        let tree = self.read_tree();
        let mut out = Vec::new();
        tree.collect_range(tree.root, &range, 0, &mut out);
        Ok(out)
    }

    fn iter(&self) -> Result<EngineIter, EngineError> {
        self.state.ensure_running()?;
        let tree = self.read_tree();
        let mut out = Vec::with_capacity(tree.len);
        tree.collect_range(tree.root, &KeyRange::all(), 0, &mut out);
        drop(tree);
        Ok(EngineIter::new(out.into_iter()))
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

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks the red–black invariants, returning the black height.
    fn check_invariants(tree: &RbTree, id: SlotId) -> usize {
        if id == NIL {
            return 1;
        }
        let node = tree.node(id);
        if node.color == Color::Red {
            assert_eq!(tree.color(node.left), Color::Black, "red node with red left child");
            assert_eq!(tree.color(node.right), Color::Black, "red node with red right child");
        }
        if node.left != NIL {
            assert!(tree.node(node.left).key < node.key, "left child out of order");
            assert_eq!(tree.parent(node.left), id, "broken parent link");
        }
        if node.right != NIL {
            assert!(tree.node(node.right).key > node.key, "right child out of order");
            assert_eq!(tree.parent(node.right), id, "broken parent link");
        }
        let lh = check_invariants(tree, node.left);
        let rh = check_invariants(tree, node.right);
        assert_eq!(lh, rh, "unequal black heights");
        lh + usize::from(node.color == Color::Black)
    }

    fn assert_valid(tree: &RbTree) {
        assert_eq!(tree.color(tree.root), Color::Black, "red root");
        check_invariants(tree, tree.root);
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key-{i:06}").into_bytes()
    }

    #[test]
    fn sequential_inserts_stay_balanced() {
        let mut tree = RbTree::new();
        for i in 0..512 {
            assert!(tree.insert(&key(i), b"v", i as u64));
            assert_valid(&tree);
        }
        assert_eq!(tree.len, 512);
    }

    #[test]
    fn overwrite_does_not_grow_tree() {
        let mut tree = RbTree::new();
        tree.insert(b"a", b"1", 1);
        assert!(!tree.insert(b"a", b"2", 2));
        assert_eq!(tree.len, 1);
        let id = tree.find(b"a");
        assert_eq!(tree.node(id).value, b"2");
        assert_eq!(tree.node(id).seq, 2);
    }

    #[test]
    fn shuffled_insert_delete_preserves_invariants() {
        // Deterministic pseudo-shuffle: stride walk over 0..997 (prime).
        let n = 997u32;
        let mut tree = RbTree::new();
        let mut i = 0u32;
        for _ in 0..n {
            tree.insert(&key(i), b"v", u64::from(i));
            i = (i + 389) % n;
        }
        assert_eq!(tree.len, n as usize);
        assert_valid(&tree);

        // Delete every third key in another stride order.
        let mut removed = 0;
        let mut j = 5u32;
        for _ in 0..n / 3 {
            assert!(tree.remove(&key(j)));
            removed += 1;
            assert_valid(&tree);
            j = (j + 3 * 389) % n;
        }
        assert_eq!(tree.len, (n as usize) - removed);
    }

    #[test]
    fn remove_absent_returns_false() {
        let mut tree = RbTree::new();
        tree.insert(b"x", b"1", 1);
        assert!(!tree.remove(b"y"));
        assert_eq!(tree.len, 1);
    }

    #[test]
    fn delete_root_repeatedly() {
        let mut tree = RbTree::new();
        for i in 0..64 {
            tree.insert(&key(i), b"v", u64::from(i));
        }
        while tree.root != NIL {
            let root_key = tree.node(tree.root).key.clone();
            assert!(tree.remove(&root_key));
            assert_valid(&tree);
        }
        assert_eq!(tree.len, 0);
    }

    #[test]
    fn range_collect_is_ordered_and_pruned() {
        let mut tree = RbTree::new();
        for i in (0..100).rev() {
            tree.insert(&key(i), b"v", u64::from(i));
        }
        let range = KeyRange::half_open(key(10), key(20));
        let mut out = Vec::new();
        tree.collect_range(tree.root, &range, 0, &mut out);
        let keys: Vec<Vec<u8>> = out.into_iter().map(|p| p.key).collect();
        let expected: Vec<Vec<u8>> = (10..20).map(key).collect();
        assert_eq!(keys, expected);
    }
}
