//! Structural validation of the core tree: equal leaf depth, occupancy
//! bounds, separator ordering, and the leaf sibling chain.

use crate::arena::SlotId;
use crate::btree::tree::{BpTree, Node};

/// Walks the subtree and checks every structural invariant. Returns the
/// leaf depth below `id`.
fn validate_node(
    tree: &BpTree,
    id: SlotId,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    is_root: bool,
    min_keys: usize,
    order: usize,
) -> usize {
    match tree.arena.get(id).expect("dangling child id") {
        Node::Leaf { entries, .. } => {
            if !is_root {
                assert!(
                    entries.len() >= min_keys,
                    "leaf underflow: {} < {min_keys}",
                    entries.len()
                );
            }
            assert!(entries.len() <= order, "leaf overflow");
            for window in entries.windows(2) {
                assert!(window[0].key < window[1].key, "leaf entries out of order");
            }
            if let (Some(lower), Some(first)) = (lower, entries.first()) {
                assert!(first.key.as_slice() >= lower, "leaf entry below lower bound");
            }
            if let (Some(upper), Some(last)) = (upper, entries.last()) {
                assert!(last.key.as_slice() < upper, "leaf entry above upper bound");
            }
            1
        }
        Node::Internal { keys, children } => {
            assert_eq!(children.len(), keys.len() + 1, "child/key arity mismatch");
            if !is_root {
                assert!(keys.len() >= min_keys, "internal underflow");
            } else {
                assert!(!keys.is_empty(), "trivial internal root");
            }
            assert!(keys.len() <= order, "internal overflow");
            for window in keys.windows(2) {
                assert!(window[0] < window[1], "separators out of order");
            }

            let mut depth = None;
            for (i, &child) in children.iter().enumerate() {
                let child_lower = if i == 0 { lower } else { Some(keys[i - 1].as_slice()) };
                let child_upper = if i == keys.len() {
                    upper
                } else {
                    Some(keys[i].as_slice())
                };
                let d = validate_node(tree, child, child_lower, child_upper, false, min_keys, order);
                match depth {
                    None => depth = Some(d),
                    Some(prev) => assert_eq!(prev, d, "leaves at unequal depth"),
                }
            }
            depth.expect("internal node without children") + 1
        }
    }
}

/// Full-tree validation, including the leaf chain.
pub(super) fn validate(tree: &BpTree) {
    let Some(root) = tree.root else {
        assert_eq!(tree.len, 0);
        return;
    };
    let min_keys = tree.order.div_ceil(2);
    validate_node(tree, root, None, None, true, min_keys, tree.order);

    // The leaf chain must visit exactly `len` entries in ascending order.
    let mut visited = 0usize;
    let mut prev_key: Option<Vec<u8>> = None;
    let mut prev_leaf: Option<SlotId> = None;
    let mut cursor = tree.first_leaf();
    while let Some(id) = cursor {
        let Node::Leaf { entries, prev, next } = tree.arena.get(id).expect("chain to vacant slot")
        else {
            panic!("leaf chain reached an internal node");
        };
        assert_eq!(*prev, prev_leaf, "broken prev link");
        for entry in entries {
            if let Some(prev_key) = &prev_key {
                assert!(prev_key < &entry.key, "leaf chain out of order");
            }
            prev_key = Some(entry.key.clone());
            visited += 1;
        }
        prev_leaf = Some(id);
        cursor = *next;
    }
    assert_eq!(visited, tree.len, "leaf chain count mismatch");
}

fn key(i: u32) -> Vec<u8> {
    format!("{i:08}").into_bytes()
}

#[test]
fn sequential_inserts_keep_invariants() {
    let mut tree = BpTree::new(4);
    for i in 0..500 {
        tree.insert(&key(i), b"v", u64::from(i));
        if i % 50 == 0 {
            validate(&tree);
        }
    }
    validate(&tree);
    assert_eq!(tree.len, 500);
    for i in 0..500 {
        assert!(tree.get(&key(i)).is_some(), "lost key {i}");
    }
}

#[test]
fn reverse_inserts_keep_invariants() {
    let mut tree = BpTree::new(3);
    for i in (0..300).rev() {
        tree.insert(&key(i), b"v", u64::from(i));
    }
    validate(&tree);
    assert_eq!(tree.len, 300);
}

#[test]
fn strided_inserts_and_deletes() {
    // Prime-stride insertion order exercises splits at many positions.
    let n = 1009u32;
    let mut tree = BpTree::new(5);
    let mut i = 0u32;
    for _ in 0..n {
        tree.insert(&key(i), b"v", u64::from(i));
        i = (i + 613) % n;
    }
    validate(&tree);
    assert_eq!(tree.len, n as usize);

    // Delete two thirds in a different stride.
    let mut j = 7u32;
    for _ in 0..(2 * n / 3) {
        assert!(tree.remove(&key(j)), "missing {j}");
        j = (j + 613) % n;
    }
    validate(&tree);

    // Deleted keys are gone, survivors remain.
    let mut survivors = 0;
    for i in 0..n {
        if tree.get(&key(i)).is_some() {
            survivors += 1;
        }
    }
    assert_eq!(survivors, tree.len);
}

#[test]
fn delete_down_to_empty() {
    let mut tree = BpTree::new(4);
    for i in 0..200 {
        tree.insert(&key(i), b"v", u64::from(i));
    }
    for i in 0..200 {
        assert!(tree.remove(&key(i)));
        if i % 20 == 0 {
            validate(&tree);
        }
    }
    validate(&tree);
    assert_eq!(tree.len, 0);
    assert!(tree.root.is_none());
    // The tree is reusable after complete drain.
    tree.insert(b"again", b"v", 1);
    validate(&tree);
    assert_eq!(tree.len, 1);
}

#[test]
fn random_workload_against_model() {
    use rand::Rng;
    use std::collections::BTreeMap;

    let mut rng = rand::rng();
    let mut tree = BpTree::new(6);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for round in 0..4000u64 {
        let k = key(rng.random_range(0..600));
        if rng.random_bool(0.6) {
            let v = format!("v{round}").into_bytes();
            tree.insert(&k, &v, round);
            model.insert(k, v);
        } else {
            let expect = model.remove(&k).is_some();
            assert_eq!(tree.remove(&k), expect);
        }
        if round % 500 == 0 {
            validate(&tree);
        }
    }
    validate(&tree);
    assert_eq!(tree.len, model.len());
    for (k, v) in &model {
        assert_eq!(tree.get(k).map(|(value, _)| value), Some(v.clone()));
    }
}
