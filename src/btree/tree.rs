//! B+Tree core: arena-backed nodes, split/borrow/merge plumbing, and
//! leaf-chain traversal.
//!
//! Node layout:
//! - internal nodes carry `N` separator keys and `N + 1` child ids, where
//!   each separator is the smallest key reachable through the child to
//!   its right;
//! - leaves carry the actual entries plus prev/next sibling ids forming a
//!   doubly linked chain in key order.
//!
//! Structural invariants (checked by the test suite):
//! - all leaves sit at the same depth;
//! - a non-root node holds at least `⌈order/2⌉` keys;
//! - no node holds more than `order` keys;
//! - the leaf chain visits every entry in ascending key order.

use crate::arena::{Arena, SlotId};
use crate::engine::{KeyRange, KvPair};

/// One record stored in a leaf.
#[derive(Debug, Clone)]
pub(crate) struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub seq: u64,
}

#[derive(Debug)]
pub(crate) enum Node {
    Internal {
        keys: Vec<Vec<u8>>,
        children: Vec<SlotId>,
    },
    Leaf {
        entries: Vec<LeafEntry>,
        prev: Option<SlotId>,
        next: Option<SlotId>,
    },
}

/// Mutation counters feeding the adaptive-fanout heuristic. Searches are
/// counted separately by the engine (outside the tree lock).
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct OpCounters {
    pub inserts: u64,
    pub deletes: u64,
    pub splits: u64,
    pub merges: u64,
}

impl OpCounters {
    pub fn total_ops(&self) -> u64 {
        self.inserts + self.deletes
    }
}

enum InsertOutcome {
    Done { replaced: bool },
    Split {
        sep: Vec<u8>,
        right: SlotId,
        replaced: bool,
    },
}

pub(crate) struct BpTree {
    pub(crate) arena: Arena<Node>,
    pub(crate) root: Option<SlotId>,
    /// Maximum keys per node. Mutated at runtime by adaptive fanout; only
    /// future splits and repairs see the new value.
    pub(crate) order: usize,
    pub(crate) len: usize,
    /// Bumped on every split, merge, borrow, or root change. Lets the
    /// hot-leaf cache detect that its node ids may be stale.
    pub(crate) structure_version: u64,
    pub(crate) counters: OpCounters,
}

impl BpTree {
    pub fn new(order: usize) -> Self {
        Self {
            arena: Arena::with_capacity(32),
            root: None,
            order,
            len: 0,
            structure_version: 0,
            counters: OpCounters::default(),
        }
    }

    fn min_keys(&self) -> usize {
        self.order.div_ceil(2)
    }

    fn node(&self, id: SlotId) -> &Node {
        self.arena.get(id).expect("btree link to vacant slot")
    }

    fn node_mut(&mut self, id: SlotId) -> &mut Node {
        self.arena.get_mut(id).expect("btree link to vacant slot")
    }

    /// Index of the child to follow for `key`: the first separator
    /// strictly greater than `key` marks the end of the candidate child.
    fn child_index(keys: &[Vec<u8>], key: &[u8]) -> usize {
        keys.partition_point(|sep| sep.as_slice() <= key)
    }

    fn key_count(&self, id: SlotId) -> usize {
        match self.node(id) {
            Node::Internal { keys, .. } => keys.len(),
            Node::Leaf { entries, .. } => entries.len(),
        }
    }

    // -- lookup --------------------------------------------------------------

    /// Descends to the leaf responsible for `key`.
    pub fn find_leaf(&self, key: &[u8]) -> Option<SlotId> {
        let mut cur = self.root?;
        loop {
            match self.node(cur) {
                Node::Internal { keys, children } => {
                    cur = children[Self::child_index(keys, key)];
                }
                Node::Leaf { .. } => return Some(cur),
            }
        }
    }

    /// Leftmost leaf of the tree.
    pub fn first_leaf(&self) -> Option<SlotId> {
        let mut cur = self.root?;
        loop {
            match self.node(cur) {
                Node::Internal { children, .. } => cur = children[0],
                Node::Leaf { .. } => return Some(cur),
            }
        }
    }

    /// Looks up `key` inside the given leaf.
    pub fn search_in_leaf(&self, leaf: SlotId, key: &[u8]) -> Option<(Vec<u8>, u64)> {
        match self.node(leaf) {
            Node::Leaf { entries, .. } => entries
                .binary_search_by(|e| e.key.as_slice().cmp(key))
                .ok()
                .map(|pos| (entries[pos].value.clone(), entries[pos].seq)),
            Node::Internal { .. } => None,
        }
    }

    /// Key span `[first, last]` currently covered by the leaf's entries.
    pub fn leaf_span(&self, leaf: SlotId) -> Option<(Vec<u8>, Vec<u8>)> {
        match self.node(leaf) {
            Node::Leaf { entries, .. } if !entries.is_empty() => Some((
                entries[0].key.clone(),
                entries[entries.len() - 1].key.clone(),
            )),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<(Vec<u8>, u64)> {
        let leaf = self.find_leaf(key)?;
        self.search_in_leaf(leaf, key)
    }

    // -- insert --------------------------------------------------------------

    /// Inserts or overwrites. Returns true when a brand-new key was added.
    pub fn insert(&mut self, key: &[u8], value: &[u8], seq: u64) -> bool {
        let Some(root) = self.root else {
            let leaf = self.arena.insert(Node::Leaf {
                entries: vec![LeafEntry {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    seq,
                }],
                prev: None,
                next: None,
            });
            self.root = Some(leaf);
            self.len = 1;
            self.structure_version += 1;
            return true;
        };

        match self.insert_rec(root, key, value, seq) {
            InsertOutcome::Done { replaced } => {
                if !replaced {
                    self.len += 1;
                }
                !replaced
            }
            InsertOutcome::Split {
                sep,
                right,
                replaced,
            } => {
                // Root split: the tree grows one level taller.
                let new_root = self.arena.insert(Node::Internal {
                    keys: vec![sep],
                    children: vec![root, right],
                });
                self.root = Some(new_root);
                self.structure_version += 1;
                if !replaced {
                    self.len += 1;
                }
                !replaced
            }
        }
    }

    fn insert_rec(&mut self, id: SlotId, key: &[u8], value: &[u8], seq: u64) -> InsertOutcome {
        let child = match self.node(id) {
            Node::Internal { keys, children } => children[Self::child_index(keys, key)],
            Node::Leaf { .. } => return self.insert_into_leaf(id, key, value, seq),
        };

        match self.insert_rec(child, key, value, seq) {
            InsertOutcome::Done { replaced } => InsertOutcome::Done { replaced },
            InsertOutcome::Split {
                sep,
                right,
                replaced,
            } => {
                let order = self.order;
                let Node::Internal { keys, children } = self.node_mut(id) else {
                    unreachable!("recursed through a leaf");
                };
                let pos = Self::child_index(keys, &sep);
                keys.insert(pos, sep);
                children.insert(pos + 1, right);

                if keys.len() <= order {
                    return InsertOutcome::Done { replaced };
                }

                // Internal split: push the middle key up.
                let mid = keys.len() / 2;
                let up = keys[mid].clone();
                let right_keys = keys.split_off(mid + 1);
                keys.pop(); // the pushed-up separator leaves both halves
                let right_children = children.split_off(mid + 1);

                let right_id = self.arena.insert(Node::Internal {
                    keys: right_keys,
                    children: right_children,
                });
                self.counters.splits += 1;
                self.structure_version += 1;
                InsertOutcome::Split {
                    sep: up,
                    right: right_id,
                    replaced,
                }
            }
        }
    }

    fn insert_into_leaf(&mut self, id: SlotId, key: &[u8], value: &[u8], seq: u64) -> InsertOutcome {
        let order = self.order;
        let Node::Leaf { entries, next, .. } = self.node_mut(id) else {
            unreachable!("insert_into_leaf on internal node");
        };
        match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(pos) => {
                entries[pos].value = value.to_vec();
                entries[pos].seq = seq;
                return InsertOutcome::Done { replaced: true };
            }
            Err(pos) => entries.insert(
                pos,
                LeafEntry {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    seq,
                },
            ),
        }

        if entries.len() <= order {
            return InsertOutcome::Done { replaced: false };
        }

        // Leaf split: the right sibling's first key is copied up.
        let mid = entries.len() / 2;
        let right_entries = entries.split_off(mid);
        let sep = right_entries[0].key.clone();
        let old_next = *next;

        let right_id = self.arena.insert(Node::Leaf {
            entries: right_entries,
            prev: Some(id),
            next: old_next,
        });
        if let Node::Leaf { next, .. } = self.node_mut(id) {
            *next = Some(right_id);
        }
        if let Some(after) = old_next {
            if let Node::Leaf { prev, .. } = self.node_mut(after) {
                *prev = Some(right_id);
            }
        }

        self.counters.splits += 1;
        self.structure_version += 1;
        InsertOutcome::Split {
            sep,
            right: right_id,
            replaced: false,
        }
    }

    // -- delete --------------------------------------------------------------

    /// Removes `key`. Returns false when absent.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let Some(root) = self.root else {
            return false;
        };
        if !self.remove_rec(root, key) {
            return false;
        }
        self.len -= 1;

        // Collapse the root when it became trivial.
        match self.node(root) {
            Node::Internal { keys, children } if keys.is_empty() => {
                let only_child = children[0];
                self.arena.remove(root);
                self.root = Some(only_child);
                self.structure_version += 1;
            }
            Node::Leaf { entries, .. } if entries.is_empty() => {
                self.arena.remove(root);
                self.root = None;
                self.structure_version += 1;
            }
            _ => {}
        }
        true
    }

    fn remove_rec(&mut self, id: SlotId, key: &[u8]) -> bool {
        let (child, child_pos) = match self.node(id) {
            Node::Internal { keys, children } => {
                let pos = Self::child_index(keys, key);
                (children[pos], pos)
            }
            Node::Leaf { .. } => {
                let Node::Leaf { entries, .. } = self.node_mut(id) else {
                    unreachable!();
                };
                return match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                    Ok(pos) => {
                        entries.remove(pos);
                        true
                    }
                    Err(_) => false,
                };
            }
        };

        if !self.remove_rec(child, key) {
            return false;
        }
        if self.key_count(child) < self.min_keys() {
            self.repair_child(id, child_pos);
        }
        true
    }

    /// Restores the minimum-occupancy invariant of `children[pos]` by
    /// borrowing from the left sibling, then the right sibling, and
    /// finally by merging.
    fn repair_child(&mut self, parent: SlotId, pos: usize) {
        let (left_sibling, right_sibling) = {
            let Node::Internal { children, .. } = self.node(parent) else {
                unreachable!("repair_child on leaf parent");
            };
            (
                (pos > 0).then(|| children[pos - 1]),
                (pos + 1 < children.len()).then(|| children[pos + 1]),
            )
        };

        if let Some(left) = left_sibling {
            if self.key_count(left) > self.min_keys() {
                self.borrow_from_left(parent, pos, left);
                return;
            }
        }
        if let Some(right) = right_sibling {
            if self.key_count(right) > self.min_keys() {
                self.borrow_from_right(parent, pos, right);
                return;
            }
        }
        if left_sibling.is_some() {
            self.merge_children(parent, pos - 1);
        } else {
            self.merge_children(parent, pos);
        }
    }

    fn borrow_from_left(&mut self, parent: SlotId, pos: usize, left: SlotId) {
        let child = {
            let Node::Internal { children, .. } = self.node(parent) else {
                unreachable!();
            };
            children[pos]
        };

        let is_leaf = matches!(self.node(child), Node::Leaf { .. });
        if is_leaf {
            let moved = {
                let Node::Leaf { entries, .. } = self.node_mut(left) else {
                    unreachable!();
                };
                entries.pop().expect("borrow from empty leaf")
            };
            let new_sep = moved.key.clone();
            if let Node::Leaf { entries, .. } = self.node_mut(child) {
                entries.insert(0, moved);
            }
            if let Node::Internal { keys, .. } = self.node_mut(parent) {
                keys[pos - 1] = new_sep;
            }
        } else {
            let (moved_key, moved_child) = {
                let Node::Internal { keys, children } = self.node_mut(left) else {
                    unreachable!();
                };
                (
                    keys.pop().expect("borrow from empty internal"),
                    children.pop().expect("internal without children"),
                )
            };
            let old_sep = {
                let Node::Internal { keys, .. } = self.node_mut(parent) else {
                    unreachable!();
                };
                std::mem::replace(&mut keys[pos - 1], moved_key)
            };
            if let Node::Internal { keys, children } = self.node_mut(child) {
                keys.insert(0, old_sep);
                children.insert(0, moved_child);
            }
        }
        self.structure_version += 1;
    }

    fn borrow_from_right(&mut self, parent: SlotId, pos: usize, right: SlotId) {
        let child = {
            let Node::Internal { children, .. } = self.node(parent) else {
                unreachable!();
            };
            children[pos]
        };

        let is_leaf = matches!(self.node(child), Node::Leaf { .. });
        if is_leaf {
            let moved = {
                let Node::Leaf { entries, .. } = self.node_mut(right) else {
                    unreachable!();
                };
                entries.remove(0)
            };
            let new_sep = {
                let Node::Leaf { entries, .. } = self.node(right) else {
                    unreachable!();
                };
                entries[0].key.clone()
            };
            if let Node::Leaf { entries, .. } = self.node_mut(child) {
                entries.push(moved);
            }
            if let Node::Internal { keys, .. } = self.node_mut(parent) {
                keys[pos] = new_sep;
            }
        } else {
            let (moved_key, moved_child) = {
                let Node::Internal { keys, children } = self.node_mut(right) else {
                    unreachable!();
                };
                (keys.remove(0), children.remove(0))
            };
            let old_sep = {
                let Node::Internal { keys, .. } = self.node_mut(parent) else {
                    unreachable!();
                };
                std::mem::replace(&mut keys[pos], moved_key)
            };
            if let Node::Internal { keys, children } = self.node_mut(child) {
                keys.push(old_sep);
                children.push(moved_child);
            }
        }
        self.structure_version += 1;
    }

    /// Merges `children[pos + 1]` into `children[pos]` and drops the
    /// separator between them.
    fn merge_children(&mut self, parent: SlotId, pos: usize) {
        let (left, right, sep) = {
            let Node::Internal { keys, children } = self.node_mut(parent) else {
                unreachable!("merge_children on leaf parent");
            };
            let sep = keys.remove(pos);
            let right = children.remove(pos + 1);
            (children[pos], right, sep)
        };

        let right_node = self.arena.remove(right).expect("merge of vacant slot");
        match right_node {
            Node::Leaf {
                entries: right_entries,
                next: right_next,
                ..
            } => {
                if let Node::Leaf { entries, next, .. } = self.node_mut(left) {
                    entries.extend(right_entries);
                    *next = right_next;
                }
                if let Some(after) = right_next {
                    if let Node::Leaf { prev, .. } = self.node_mut(after) {
                        *prev = Some(left);
                    }
                }
            }
            Node::Internal {
                keys: right_keys,
                children: right_children,
            } => {
                if let Node::Internal { keys, children } = self.node_mut(left) {
                    keys.push(sep);
                    keys.extend(right_keys);
                    children.extend(right_children);
                }
            }
        }
        self.counters.merges += 1;
        self.structure_version += 1;
    }

    // -- ordered traversal ---------------------------------------------------

    /// Collects at most `limit` pairs inside `range` by walking the leaf
    /// chain (`limit == 0` = unlimited).
    pub fn collect_range(&self, range: &KeyRange, limit: usize) -> Vec<KvPair> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }

        let mut leaf = match &range.start {
            Some(start) => self.find_leaf(start),
            None => self.first_leaf(),
        };

        while let Some(id) = leaf {
            let Node::Leaf { entries, next, .. } = self.node(id) else {
                break;
            };
            for entry in entries {
                if let Some(end) = &range.end {
                    match entry.key.as_slice().cmp(end.as_slice()) {
                        std::cmp::Ordering::Greater => return out,
                        std::cmp::Ordering::Equal if !range.end_inclusive => return out,
                        _ => {}
                    }
                }
                if range.contains(&entry.key) {
                    out.push(KvPair::new(entry.key.clone(), entry.value.clone()));
                    if limit != 0 && out.len() >= limit {
                        return out;
                    }
                }
            }
            leaf = *next;
        }
        out
    }
}
