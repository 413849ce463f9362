//! Range and prefix semantics on the ordered engines.

use crate::engine::array::ArrayEngine;
use crate::engine::rbtree::RbTreeEngine;
use crate::engine::{KeyRange, StorageEngine, prefix_upper_bound};

fn ordered_engines() -> Vec<Box<dyn StorageEngine>> {
    vec![Box::new(ArrayEngine::new()), Box::new(RbTreeEngine::new())]
}

fn seed_digits(engine: &dyn StorageEngine) {
    for i in 0..10u32 {
        engine
            .put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
}

#[test]
fn half_open_range_bounds() {
    for engine in ordered_engines() {
        seed_digits(engine.as_ref());
        let pairs = engine
            .range_scan(&KeyRange::half_open(b"k3".to_vec(), b"k7".to_vec()), 10)
            .unwrap();
        let keys: Vec<Vec<u8>> = pairs.into_iter().map(|p| p.key).collect();
        assert_eq!(
            keys,
            vec![b"k3".to_vec(), b"k4".to_vec(), b"k5".to_vec(), b"k6".to_vec()]
        );
    }
}

#[test]
fn closed_range_includes_both_ends() {
    for engine in ordered_engines() {
        seed_digits(engine.as_ref());
        let pairs = engine
            .range_scan(
                &KeyRange::between(b"k3".to_vec(), b"k5".to_vec(), true, true),
                0,
            )
            .unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs.last().unwrap().key, b"k5");
    }
}

#[test]
fn limit_truncates_in_order() {
    for engine in ordered_engines() {
        seed_digits(engine.as_ref());
        let pairs = engine.range_scan(&KeyRange::all(), 3).unwrap();
        let keys: Vec<Vec<u8>> = pairs.into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec![b"k0".to_vec(), b"k1".to_vec(), b"k2".to_vec()]);
    }
}

#[test]
fn inverted_range_is_empty() {
    for engine in ordered_engines() {
        seed_digits(engine.as_ref());
        let pairs = engine
            .range_scan(&KeyRange::half_open(b"k7".to_vec(), b"k3".to_vec()), 0)
            .unwrap();
        assert!(pairs.is_empty());
    }
}

#[test]
fn prefix_scan_shares_prefix_only() {
    for engine in ordered_engines() {
        engine.put(b"a", b"1").unwrap();
        engine.put(b"ab", b"2").unwrap();
        engine.put(b"ac", b"3").unwrap();
        engine.put(b"b", b"4").unwrap();

        let keys: Vec<Vec<u8>> = engine
            .prefix_scan(b"a")
            .unwrap()
            .into_iter()
            .map(|p| p.key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"ab".to_vec(), b"ac".to_vec()]);
    }
}

#[test]
fn all_ff_prefix_has_no_upper_bound() {
    assert_eq!(prefix_upper_bound(&[0xFF, 0xFF]), None);
    assert_eq!(prefix_upper_bound(b""), None);
    assert_eq!(prefix_upper_bound(b"a"), Some(b"b".to_vec()));
    // Trailing 0xFF bytes are truncated after the increment.
    assert_eq!(prefix_upper_bound(&[0x61, 0xFF, 0xFF]), Some(vec![0x62]));

    // Engines must not loop or return foreign keys on an all-0xFF prefix.
    for engine in ordered_engines() {
        engine.put(&[0xFF, 0xFF], b"top").unwrap();
        engine.put(&[0xFF, 0xFF, 0x01], b"higher").unwrap();
        engine.put(b"normal", b"x").unwrap();
        let pairs = engine.prefix_scan(&[0xFF, 0xFF]).unwrap();
        assert_eq!(pairs.len(), 2);
    }
}
