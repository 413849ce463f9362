//! Cache internals: the entry table, the intrusive lists, and the six
//! eviction policies.
//!
//! Entries live in an [`Arena`]; list membership is expressed through
//! prev/next slot ids, so moving an entry between lists is O(1) pointer
//! surgery with no allocation. ARC keeps four lists (T1/T2 resident,
//! B1/B2 ghost); every other policy keeps a single main list. CLOCK
//! reuses the main list as its ring, with the hand walking tail → head
//! and wrapping.

use std::collections::HashMap;
use std::time::Duration;

use crate::arena::{Arena, SlotId};
use crate::time;

use super::{CacheConfig, CachePolicy};

/// List membership tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ListTag {
    /// Single list used by LRU/LFU/FIFO/RANDOM/CLOCK.
    Main,
    /// ARC: recently seen once.
    T1,
    /// ARC: seen at least twice.
    T2,
    /// ARC ghost of T1 (key only).
    B1,
    /// ARC ghost of T2 (key only).
    B2,
}

#[derive(Debug)]
pub(super) struct CacheEntry {
    pub key: Vec<u8>,
    /// `None` for ARC ghosts.
    pub value: Option<Vec<u8>>,
    /// Monotonic deadline; `None` = no expiry.
    pub expires_at_ms: Option<u64>,
    pub created_ms: u64,
    pub accessed_ms: u64,
    pub freq: u32,
    pub clock_ref: bool,
    pub list: ListTag,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

impl CacheEntry {
    fn weight(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|deadline| now_ms >= deadline)
    }
}

/// One intrusive doubly linked list: head = most recent.
#[derive(Debug, Default, Clone, Copy)]
struct ListHead {
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

/// Counters incremented under the cache lock; drained by the front.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct SweepCounters {
    pub evictions: u64,
    pub expirations: u64,
}

pub(super) struct CacheInner {
    config: CacheConfig,
    arena: Arena<CacheEntry>,
    index: HashMap<Vec<u8>, SlotId>,
    main: ListHead,
    t1: ListHead,
    t2: ListHead,
    b1: ListHead,
    b2: ListHead,
    /// ARC adaptation target for |T1|, clamped to `[0, c]`.
    arc_p: usize,
    clock_hand: Option<SlotId>,
    /// Live payload bytes (ghosts count keys only).
    bytes: usize,
    /// xorshift state for the RANDOM policy.
    rng: u64,
    pub counters: SweepCounters,
}

impl CacheInner {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            arena: Arena::with_capacity(config.max_entries.min(4096)),
            index: HashMap::new(),
            main: ListHead::default(),
            t1: ListHead::default(),
            t2: ListHead::default(),
            b1: ListHead::default(),
            b2: ListHead::default(),
            arc_p: 0,
            clock_hand: None,
            bytes: 0,
            rng: 0x9E37_79B9_7F4A_7C15,
            counters: SweepCounters::default(),
            config,
        }
    }

    fn entry(&self, id: SlotId) -> &CacheEntry {
        self.arena.get(id).expect("cache link to vacant slot")
    }

    fn entry_mut(&mut self, id: SlotId) -> &mut CacheEntry {
        self.arena.get_mut(id).expect("cache link to vacant slot")
    }

    fn list_head_mut(&mut self, tag: ListTag) -> &mut ListHead {
        match tag {
            ListTag::Main => &mut self.main,
            ListTag::T1 => &mut self.t1,
            ListTag::T2 => &mut self.t2,
            ListTag::B1 => &mut self.b1,
            ListTag::B2 => &mut self.b2,
        }
    }

    // -- intrusive list surgery ---------------------------------------------

    fn push_front(&mut self, tag: ListTag, id: SlotId) {
        let old_head = self.list_head_mut(tag).head;
        {
            let entry = self.entry_mut(id);
            entry.list = tag;
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(old) = old_head {
            self.entry_mut(old).prev = Some(id);
        }
        let list = self.list_head_mut(tag);
        list.head = Some(id);
        if list.tail.is_none() {
            list.tail = Some(id);
        }
        list.len += 1;
    }

    fn unlink(&mut self, id: SlotId) {
        let (tag, prev, next) = {
            let entry = self.entry(id);
            (entry.list, entry.prev, entry.next)
        };
        if self.clock_hand == Some(id) {
            self.clock_hand = prev.or_else(|| self.tail_of(tag).filter(|t| *t != id));
        }
        match prev {
            Some(prev) => self.entry_mut(prev).next = next,
            None => self.list_head_mut(tag).head = next,
        }
        match next {
            Some(next) => self.entry_mut(next).prev = prev,
            None => self.list_head_mut(tag).tail = prev,
        }
        let list = self.list_head_mut(tag);
        list.len -= 1;
        let entry = self.entry_mut(id);
        entry.prev = None;
        entry.next = None;
    }

    fn tail_of(&self, tag: ListTag) -> Option<SlotId> {
        match tag {
            ListTag::Main => self.main.tail,
            ListTag::T1 => self.t1.tail,
            ListTag::T2 => self.t2.tail,
            ListTag::B1 => self.b1.tail,
            ListTag::B2 => self.b2.tail,
        }
    }

    // -- basic accounting ----------------------------------------------------

    pub fn live_entries(&self) -> usize {
        self.main.len + self.t1.len + self.t2.len
    }

    pub fn live_bytes(&self) -> usize {
        self.bytes
    }

    /// Removes an entry completely (index, list, arena, bytes).
    fn drop_entry(&mut self, id: SlotId) {
        self.unlink(id);
        let entry = self.arena.remove(id).expect("drop of vacant cache slot");
        if entry.value.is_some() {
            self.bytes = self.bytes.saturating_sub(entry.weight());
        }
        self.index.remove(&entry.key);
    }

    /// Demotes a resident ARC entry to a ghost on the given list.
    fn demote_to_ghost(&mut self, id: SlotId, ghost: ListTag) {
        self.unlink(id);
        let entry = self.entry_mut(id);
        let weight = entry.weight();
        entry.value = None;
        entry.clock_ref = false;
        self.bytes = self.bytes.saturating_sub(weight);
        self.push_front(ghost, id);
        self.counters.evictions += 1;
    }

    fn next_random(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    // -- lookups -------------------------------------------------------------

    /// Live lookup with policy touch. Returns an owned value copy.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let now = time::monotonic_ms();
        let id = *self.index.get(key)?;
        let (expired, ghost) = {
            let entry = self.entry(id);
            (entry.is_expired(now), entry.value.is_none())
        };
        if ghost {
            return None;
        }
        if expired {
            self.drop_entry(id);
            self.counters.expirations += 1;
            return None;
        }

        {
            let entry = self.entry_mut(id);
            entry.accessed_ms = now;
            entry.freq = entry.freq.saturating_add(1);
            entry.clock_ref = true;
        }
        match self.config.policy {
            CachePolicy::Lru => {
                self.unlink(id);
                self.push_front(ListTag::Main, id);
            }
            CachePolicy::Arc => {
                // T1 hit promotes into T2; a T2 hit refreshes recency.
                self.unlink(id);
                self.push_front(ListTag::T2, id);
            }
            CachePolicy::Lfu
            | CachePolicy::Fifo
            | CachePolicy::Random
            | CachePolicy::Clock => {}
        }
        self.entry(id).value.clone()
    }

    /// TTL-aware existence check without policy side effects.
    pub fn contains_live(&self, key: &[u8]) -> bool {
        let now = time::monotonic_ms();
        self.index
            .get(key)
            .and_then(|id| self.arena.get(*id))
            .is_some_and(|entry| entry.value.is_some() && !entry.is_expired(now))
    }

    // -- insertion -----------------------------------------------------------

    /// Upserts a live entry and enforces capacity.
    pub fn set(&mut self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) {
        let now = time::monotonic_ms();
        let expires_at_ms = ttl
            .or(self.config.default_ttl)
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| now + ttl.as_millis() as u64);

        if let Some(&id) = self.index.get(key) {
            let was_ghost = self.entry(id).value.is_none();
            if was_ghost {
                // ARC ghost hit: adapt p toward the list that produced
                // it, make room, and resurrect straight into T2.
                let ghost_list = self.entry(id).list;
                self.adapt_from_ghost(ghost_list);
                self.arc_replace(ghost_list == ListTag::B2);
                self.unlink(id);
                let entry = self.entry_mut(id);
                entry.value = Some(value);
                entry.expires_at_ms = expires_at_ms;
                entry.accessed_ms = now;
                entry.freq = entry.freq.saturating_add(1);
                self.bytes += self.entry(id).weight();
                self.push_front(ListTag::T2, id);
            } else {
                // Refresh in place.
                let entry = self.entry_mut(id);
                let old_weight = entry.weight();
                entry.value = Some(value);
                entry.expires_at_ms = expires_at_ms;
                entry.accessed_ms = now;
                entry.freq = entry.freq.saturating_add(1);
                entry.clock_ref = true;
                let new_weight = self.entry(id).weight();
                self.bytes = self.bytes.saturating_sub(old_weight) + new_weight;
                match self.config.policy {
                    CachePolicy::Lru | CachePolicy::Arc => {
                        let target = if self.config.policy == CachePolicy::Arc {
                            ListTag::T2
                        } else {
                            ListTag::Main
                        };
                        self.unlink(id);
                        self.push_front(target, id);
                    }
                    _ => {}
                }
            }
            self.enforce_capacity();
            return;
        }

        // Brand-new key.
        if self.config.policy == CachePolicy::Arc {
            self.arc_admit_new();
        }
        let entry = CacheEntry {
            key: key.to_vec(),
            value: Some(value),
            expires_at_ms,
            created_ms: now,
            accessed_ms: now,
            freq: 1,
            clock_ref: true,
            list: ListTag::Main,
            prev: None,
            next: None,
        };
        self.bytes += entry.weight();
        let id = self.arena.insert(entry);
        self.index.insert(key.to_vec(), id);
        let target = if self.config.policy == CachePolicy::Arc {
            ListTag::T1
        } else {
            ListTag::Main
        };
        self.push_front(target, id);
        self.enforce_capacity();
    }

    /// Removes a key entirely. Returns whether a live entry existed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let Some(&id) = self.index.get(key) else {
            return false;
        };
        let was_live = self.entry(id).value.is_some();
        self.drop_entry(id);
        was_live
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.index.clear();
        self.main = ListHead::default();
        self.t1 = ListHead::default();
        self.t2 = ListHead::default();
        self.b1 = ListHead::default();
        self.b2 = ListHead::default();
        self.arc_p = 0;
        self.clock_hand = None;
        self.bytes = 0;
    }

    // -- expiry sweep --------------------------------------------------------

    /// Removes every TTL-expired live entry; returns how many fell.
    pub fn sweep_expired(&mut self) -> u64 {
        let now = time::monotonic_ms();
        let expired: Vec<SlotId> = self
            .arena
            .iter()
            .filter(|(_, entry)| entry.value.is_some() && entry.is_expired(now))
            .map(|(id, _)| id)
            .collect();
        let count = expired.len() as u64;
        for id in expired {
            self.drop_entry(id);
        }
        self.counters.expirations += count;
        count
    }

    // -- capacity enforcement ------------------------------------------------

    /// Evicts until both limits are honoured, with the configured extra
    /// headroom so back-to-back inserts do not each pay an eviction.
    fn enforce_capacity(&mut self) {
        let over_entries = self.live_entries() > self.config.max_entries;
        let over_bytes = self.bytes > self.config.max_bytes;
        if !over_entries && !over_bytes {
            return;
        }
        let factor = (1.0 - self.config.eviction_factor).clamp(0.0, 1.0);
        let entry_target = ((self.config.max_entries as f64) * factor) as usize;
        let byte_target = ((self.config.max_bytes as f64) * factor) as usize;

        let mut guard = self.live_entries() + 1;
        while (self.live_entries() > entry_target.max(1) || self.bytes > byte_target)
            && self.live_entries() > 0
            && guard > 0
        {
            guard -= 1;
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Evicts a single victim per the active policy. Returns false when
    /// nothing evictable remains.
    fn evict_one(&mut self) -> bool {
        match self.config.policy {
            CachePolicy::Lru | CachePolicy::Fifo => match self.main.tail {
                Some(victim) => {
                    self.drop_entry(victim);
                    self.counters.evictions += 1;
                    true
                }
                None => false,
            },
            CachePolicy::Lfu => {
                let victim = self
                    .arena
                    .iter()
                    .filter(|(_, e)| e.value.is_some())
                    .min_by_key(|(_, e)| (e.freq, e.accessed_ms))
                    .map(|(id, _)| id);
                match victim {
                    Some(victim) => {
                        self.drop_entry(victim);
                        self.counters.evictions += 1;
                        true
                    }
                    None => false,
                }
            }
            CachePolicy::Random => {
                if self.main.len == 0 {
                    return false;
                }
                let skip = (self.next_random() as usize) % self.main.len;
                let mut cursor = self.main.tail;
                for _ in 0..skip {
                    cursor = cursor.and_then(|id| self.entry(id).prev);
                }
                match cursor.or(self.main.tail) {
                    Some(victim) => {
                        self.drop_entry(victim);
                        self.counters.evictions += 1;
                        true
                    }
                    None => false,
                }
            }
            CachePolicy::Clock => self.clock_evict(),
            CachePolicy::Arc => {
                if self.t1.len + self.t2.len == 0 {
                    return false;
                }
                self.arc_replace(false);
                // A demotion keeps the ghost; the byte budget shrank, and
                // the ghost lists are bounded separately.
                self.prune_ghosts();
                true
            }
        }
    }

    /// Second-chance sweep: clear referenced bits until an unreferenced
    /// victim shows up.
    fn clock_evict(&mut self) -> bool {
        if self.main.len == 0 {
            return false;
        }
        let mut hand = self.clock_hand.or(self.main.tail);
        // Two full revolutions bound the sweep even if every bit is set.
        for _ in 0..(self.main.len * 2 + 1) {
            let Some(id) = hand else {
                hand = self.main.tail;
                continue;
            };
            if self.entry(id).clock_ref {
                self.entry_mut(id).clock_ref = false;
                hand = self.entry(id).prev.or(self.main.tail);
            } else {
                self.clock_hand = self.entry(id).prev.or(self.main.tail);
                self.drop_entry(id);
                self.counters.evictions += 1;
                return true;
            }
        }
        // Everybody referenced twice in a row: fall back to the tail.
        if let Some(victim) = self.main.tail {
            self.drop_entry(victim);
            self.counters.evictions += 1;
            return true;
        }
        false
    }

    // -- ARC -----------------------------------------------------------------

    /// Adapts `p` toward the ghost list that was hit.
    fn adapt_from_ghost(&mut self, ghost: ListTag) {
        let c = self.config.max_entries.max(1);
        match ghost {
            ListTag::B1 => {
                let delta = (self.b2.len / self.b1.len.max(1)).max(1);
                self.arc_p = (self.arc_p + delta).min(c);
            }
            ListTag::B2 => {
                let delta = (self.b1.len / self.b2.len.max(1)).max(1);
                self.arc_p = self.arc_p.saturating_sub(delta);
            }
            _ => {}
        }
    }

    /// ARC REPLACE: demote from T1 or T2 into the matching ghost list.
    fn arc_replace(&mut self, hit_was_b2: bool) {
        if self.t1.len >= 1 && (self.t1.len > self.arc_p || (hit_was_b2 && self.t1.len == self.arc_p))
        {
            if let Some(victim) = self.tail_of(ListTag::T1) {
                self.demote_to_ghost(victim, ListTag::B1);
                return;
            }
        }
        if let Some(victim) = self.tail_of(ListTag::T2) {
            self.demote_to_ghost(victim, ListTag::B2);
        } else if let Some(victim) = self.tail_of(ListTag::T1) {
            self.demote_to_ghost(victim, ListTag::B1);
        }
    }

    /// Case IV of the ARC request algorithm: make room before admitting
    /// a brand-new key into T1.
    fn arc_admit_new(&mut self) {
        let c = self.config.max_entries.max(1);
        let l1 = self.t1.len + self.b1.len;
        let total = l1 + self.t2.len + self.b2.len;

        if l1 >= c {
            if self.t1.len < c {
                if let Some(ghost) = self.tail_of(ListTag::B1) {
                    self.drop_entry(ghost);
                }
                self.arc_replace(false);
            } else if let Some(victim) = self.tail_of(ListTag::T1) {
                self.drop_entry(victim);
                self.counters.evictions += 1;
            }
        } else if total >= c {
            if total >= 2 * c {
                if let Some(ghost) = self.tail_of(ListTag::B2) {
                    self.drop_entry(ghost);
                }
            }
            if self.live_entries() >= c {
                self.arc_replace(false);
            }
        }
    }

    /// Keeps the ghost lists inside the standard ARC bounds.
    fn prune_ghosts(&mut self) {
        let c = self.config.max_entries.max(1);
        while self.t1.len + self.b1.len > c {
            let Some(ghost) = self.tail_of(ListTag::B1) else { break };
            self.drop_entry(ghost);
        }
        while self.t1.len + self.t2.len + self.b1.len + self.b2.len > 2 * c {
            let Some(ghost) = self.tail_of(ListTag::B2) else { break };
            self.drop_entry(ghost);
        }
    }
}
