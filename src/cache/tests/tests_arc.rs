//! Behavioral checks of the adaptive replacement policy.

use crate::cache::{Cache, CacheConfig, CachePolicy};

fn arc_cache(max_entries: usize) -> Cache {
    Cache::new(CacheConfig {
        max_entries,
        max_bytes: 64 * 1024 * 1024,
        policy: CachePolicy::Arc,
        default_ttl: None,
        cleanup_interval: None,
        eviction_factor: 0.0,
    })
}

#[test]
fn basic_round_trip() {
    let cache = arc_cache(8);
    cache.set(b"k", b"v").unwrap();
    assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));
    assert!(cache.delete(b"k"));
    assert_eq!(cache.get(b"k"), None);
}

#[test]
fn capacity_is_respected() {
    let cache = arc_cache(16);
    for i in 0..200u32 {
        cache.set(format!("key-{i:03}").as_bytes(), b"v").unwrap();
    }
    assert!(cache.len() <= 16, "{} live entries", cache.len());
}

#[test]
fn reused_working_set_survives_one_shot_scan() {
    let capacity = 16;
    let cache = arc_cache(capacity);

    // Build a hot set that is touched repeatedly (lives in T2).
    for i in 0..8u32 {
        let key = format!("hot-{i}");
        cache.set(key.as_bytes(), b"v").unwrap();
        cache.get(key.as_bytes());
        cache.get(key.as_bytes());
    }

    // Pour a long one-shot scan through the cache.
    for i in 0..100u32 {
        cache.set(format!("scan-{i:03}").as_bytes(), b"v").unwrap();
    }

    // ARC's frequency list shields a good share of the hot set; a plain
    // LRU would have lost all of it.
    let survivors = (0..8u32)
        .filter(|i| cache.get(format!("hot-{i}").as_bytes()).is_some())
        .count();
    assert!(
        survivors >= 4,
        "only {survivors} of 8 hot entries survived the scan"
    );
}

#[test]
fn ghost_resurrection_counts_as_new_value() {
    let cache = arc_cache(4);
    // Fill and overflow so early keys get demoted to ghosts.
    for i in 0..12u32 {
        cache.set(format!("key-{i:02}").as_bytes(), b"old").unwrap();
    }
    // Re-setting an evicted key must store the new value and serve it.
    cache.set(b"key-00", b"fresh").unwrap();
    assert_eq!(cache.get(b"key-00"), Some(b"fresh".to_vec()));
    assert!(cache.len() <= 4);
}

#[test]
fn delete_removes_ghosts_too() {
    let cache = arc_cache(2);
    for i in 0..10u8 {
        cache.set(&[b'k', i], b"v").unwrap();
    }
    // Deleting every key (live or ghost) leaves a truly empty cache.
    for i in 0..10u8 {
        cache.delete(&[b'k', i]);
    }
    assert!(cache.is_empty());
    for i in 0..10u8 {
        assert_eq!(cache.get(&[b'k', i]), None);
    }
}

#[test]
fn eviction_counter_tracks_demotions() {
    let cache = arc_cache(4);
    for i in 0..20u32 {
        cache.set(format!("key-{i:02}").as_bytes(), b"v").unwrap();
    }
    assert!(cache.stats().evictions >= 16 - 4);
}
