use crate::cache::{Cache, CacheConfig, CacheError, CachePolicy, MAX_KEY_LEN, MAX_VALUE_LEN};

fn cache(max_entries: usize) -> Cache {
    Cache::new(CacheConfig {
        max_entries,
        max_bytes: 64 * 1024 * 1024,
        policy: CachePolicy::Lru,
        default_ttl: None,
        cleanup_interval: None,
        eviction_factor: 0.0,
    })
}

#[test]
fn set_get_delete_round_trip() {
    let cache = cache(16);
    cache.set(b"k", b"v").unwrap();
    assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));
    assert_eq!(cache.len(), 1);

    assert!(cache.delete(b"k"));
    assert_eq!(cache.get(b"k"), None);
    assert!(!cache.delete(b"k"));
    assert!(cache.is_empty());
}

#[test]
fn overwrites_update_bytes() {
    let cache = cache(16);
    cache.set(b"k", &[0u8; 100]).unwrap();
    let big = cache.bytes();
    cache.set(b"k", &[0u8; 10]).unwrap();
    assert!(cache.bytes() < big);
    assert_eq!(cache.len(), 1);
}

#[test]
fn limits_are_enforced() {
    let cache = cache(16);
    assert!(matches!(cache.set(b"", b"v"), Err(CacheError::EmptyKey)));
    assert!(matches!(
        cache.set(&vec![b'k'; MAX_KEY_LEN + 1], b"v"),
        Err(CacheError::KeyTooLong { .. })
    ));
    assert!(matches!(
        cache.set(b"k", &vec![b'v'; MAX_VALUE_LEN + 1]),
        Err(CacheError::ValueTooLarge { .. })
    ));
    cache
        .set(&vec![b'k'; MAX_KEY_LEN], &vec![b'v'; 1024])
        .unwrap();
}

#[test]
fn stats_track_hits_misses_and_ratio() {
    let cache = cache(16);
    cache.set(b"k", b"v").unwrap();
    cache.get(b"k");
    cache.get(b"k");
    cache.get(b"missing");

    let stats = cache.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.entries, 1);
    assert!(stats.get_latency.count >= 3);
    assert!(stats.set_latency.count >= 1);
}

#[test]
fn batch_operations_work_under_one_lock() {
    let cache = cache(64);
    cache
        .set_many(&[(b"a".as_slice(), b"1".as_slice()), (b"b", b"2"), (b"c", b"3")])
        .unwrap();
    assert_eq!(cache.len(), 3);

    let results = cache.get_many(&[b"a", b"missing", b"c"]);
    assert_eq!(
        results,
        vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]
    );

    let removed = cache.delete_many(&[b"a", b"b", b"missing"]);
    assert_eq!(removed, 2);
    assert_eq!(cache.len(), 1);
}

#[test]
fn clear_resets_everything() {
    let cache = cache(16);
    for i in 0..10u8 {
        cache.set(&[b'k', i], b"v").unwrap();
    }
    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.bytes(), 0);
    // Still usable after clear.
    cache.set(b"again", b"v").unwrap();
    assert_eq!(cache.get(b"again"), Some(b"v".to_vec()));
}

#[test]
fn byte_budget_triggers_eviction() {
    let cache = Cache::new(CacheConfig {
        max_entries: 1000,
        max_bytes: 1000,
        policy: CachePolicy::Lru,
        default_ttl: None,
        cleanup_interval: None,
        eviction_factor: 0.0,
    });
    for i in 0..20u8 {
        cache.set(&[b'k', i], &[0u8; 100]).unwrap();
    }
    assert!(cache.bytes() <= 1000);
    assert!(cache.stats().evictions > 0);
}
