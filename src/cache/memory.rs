//! Byte-budgeted LRU hot tier for decode verdicts.
//!
//! Invariants:
//! - Entries are immutable: a key is replaced wholesale, never mutated, so
//!   a reader holding a previously returned `Arc` is untouched by eviction.
//! - `used_bytes` tracks payload plus a fixed per-entry overhead and never
//!   exceeds the budget after a `put` returns.
//! - Recency is a strict total order (a monotone tick per access); eviction
//!   removes strictly least-recently-used entries first.
//!
//! Not thread-safe on its own; the owning [`AssetCache`](super::AssetCache)
//! wraps it in a mutex. Lookups are O(1) on the key map plus O(log n) for
//! the recency reindex.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::api::{CacheKey, DecodeVerdict, Fingerprint};

/// Accounting overhead charged per entry (key, links, header).
const ENTRY_OVERHEAD: usize = 128;

struct Entry {
    tick: u64,
    verdict: DecodeVerdict,
    size: usize,
}

pub(crate) struct MemoryTier {
    budget: usize,
    used: usize,
    tick: u64,
    map: AHashMap<CacheKey, Entry>,
    recency: BTreeMap<u64, CacheKey>,
}

impl MemoryTier {
    pub(crate) fn new(budget: usize) -> Self {
        assert!(budget > 0, "memory tier budget must be positive");
        Self {
            budget,
            used: 0,
            tick: 0,
            map: AHashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn entry_size(verdict: &DecodeVerdict) -> usize {
        let payload = match verdict {
            Ok(asset) => asset.size_bytes(),
            Err(_) => 0,
        };
        payload + ENTRY_OVERHEAD
    }

    pub(crate) fn get(&mut self, key: &CacheKey) -> Option<DecodeVerdict> {
        let next_tick = self.tick + 1;
        let entry = self.map.get_mut(key)?;
        self.tick = next_tick;
        let old_tick = std::mem::replace(&mut entry.tick, next_tick);
        let verdict = entry.verdict.clone();
        self.recency.remove(&old_tick);
        self.recency.insert(next_tick, *key);
        Some(verdict)
    }

    /// Inserts or replaces, then evicts LRU entries down to the budget.
    ///
    /// A value larger than the whole budget is not cached at all: evicting
    /// the entire tier for one entry would defeat it.
    pub(crate) fn put(&mut self, key: CacheKey, verdict: DecodeVerdict) {
        let size = Self::entry_size(&verdict);
        if size > self.budget {
            return;
        }
        self.remove(&key);
        self.tick += 1;
        self.recency.insert(self.tick, key);
        self.map.insert(
            key,
            Entry {
                tick: self.tick,
                verdict,
                size,
            },
        );
        self.used += size;

        while self.used > self.budget {
            let (_, victim) = self
                .recency
                .pop_first()
                .expect("recency cannot be empty while over budget");
            let removed = self.map.remove(&victim).expect("recency and map agree");
            self.used -= removed.size;
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(old) = self.map.remove(key) {
            self.recency.remove(&old.tick);
            self.used -= old.size;
        }
    }

    pub(crate) fn invalidate_source(&mut self, fingerprint: Fingerprint) {
        let victims: Vec<CacheKey> = self
            .map
            .keys()
            .filter(|k| k.fingerprint == fingerprint)
            .copied()
            .collect();
        for key in victims {
            self.remove(&key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.map.len(), self.recency.len());
        self.map.len()
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.used
    }
}
