//! Multi-tier asset cache: in-memory LRU over a persistent keyed-file store.
//!
//! Tier discipline:
//! - `get` consults memory first; a hit short-circuits the persistent tier.
//! - A persistent hit is promoted into memory on the way out.
//! - `put` writes both tiers, except `DecodeError::Cancelled`, which is
//!   never cached anywhere: cancellation describes the request, not the
//!   bytes.
//! - Entries are immutable; eviction never invalidates a value a reader
//!   already holds (shared `Arc` payloads).
//!
//! The cache is the only state shared between the scanner and all
//! coordinator sessions, so the hot tier sits behind a short-held mutex and
//! the persistent tier is internally synchronized (rename-per-record).

mod memory;
mod persistent;

pub use persistent::CacheError;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::api::{CacheKey, DecodeVerdict, Fingerprint};
use crate::config::CacheConfig;
use memory::MemoryTier;
use persistent::PersistentTier;

/// Hit/miss counters per tier, for diagnostics panes and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheMetrics {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub writes: u64,
}

pub struct AssetCache {
    memory: Mutex<MemoryTier>,
    persistent: Option<PersistentTier>,
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl AssetCache {
    /// Builds the cache; a persistent root that cannot be opened degrades
    /// to memory-only operation rather than failing construction.
    pub fn new(cfg: &CacheConfig) -> Self {
        cfg.assert_valid();
        let persistent = cfg.persistent_root.as_ref().and_then(|root| {
            match PersistentTier::open(
                root.clone(),
                cfg.persistent_budget_entries,
                cfg.persistent_max_age,
            ) {
                Ok(tier) => Some(tier),
                Err(e) => {
                    debug!(root = %root.display(), error = %e, "persistent cache unavailable");
                    None
                }
            }
        });
        Self {
            memory: Mutex::new(MemoryTier::new(cfg.memory_budget_bytes)),
            persistent,
            memory_hits: AtomicU64::new(0),
            persistent_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<DecodeVerdict> {
        if let Some(hit) = self.memory.lock().get(key) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }
        if let Some(tier) = &self.persistent {
            if let Some(hit) = tier.get(key) {
                self.persistent_hits.fetch_add(1, Ordering::Relaxed);
                // Promote so the next lookup stays off the disk.
                self.memory.lock().put(*key, hit.clone());
                return Some(hit);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Writes a verdict to both tiers. `Cancelled` verdicts are dropped.
    pub fn put(&self, key: CacheKey, verdict: DecodeVerdict) {
        if matches!(&verdict, Err(e) if e.is_cancelled()) {
            return;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(tier) = &self.persistent {
            tier.put(&key, &verdict);
        }
        self.memory.lock().put(key, verdict);
    }

    /// Drops every entry for one source from both tiers.
    pub fn invalidate_source(&self, fingerprint: Fingerprint) {
        self.memory.lock().invalidate_source(fingerprint);
        if let Some(tier) = &self.persistent {
            tier.invalidate_source(fingerprint);
        }
    }

    /// True once the persistent tier has latched an I/O failure (or was
    /// never available despite being configured).
    pub fn is_persistent_degraded(&self) -> bool {
        match &self.persistent {
            Some(tier) => tier.is_degraded(),
            None => false,
        }
    }

    pub fn has_persistent_tier(&self) -> bool {
        self.persistent.is_some()
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            persistent_hits: self.persistent_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DecodeError, DecodedAsset, TILE_PIXEL_BYTES};
    use std::sync::Arc;

    fn memory_only() -> AssetCache {
        AssetCache::new(&CacheConfig::default())
    }

    fn key(offset: u64) -> CacheKey {
        CacheKey {
            fingerprint: Fingerprint([1; 32]),
            offset,
            params_hash: 42,
        }
    }

    fn asset() -> DecodeVerdict {
        Ok(DecodedAsset {
            tile_count: 1,
            bytes_consumed: 8,
            pixels: Arc::from(vec![2u8; TILE_PIXEL_BYTES]),
            quality: 0.9,
        })
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = memory_only();
        cache.put(key(0), asset());
        assert!(cache.get(&key(0)).is_some());
        let metrics = cache.metrics();
        assert_eq!(metrics.memory_hits, 1);
        assert_eq!(metrics.writes, 1);
    }

    #[test]
    fn cancelled_is_never_cached() {
        let cache = memory_only();
        cache.put(key(1), Err(DecodeError::Cancelled));
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.metrics().writes, 0);
        // Every other error kind is a cacheable verdict.
        cache.put(key(2), Err(DecodeError::Timeout));
        assert!(matches!(cache.get(&key(2)), Some(Err(DecodeError::Timeout))));
    }

    #[test]
    fn miss_counts_are_tracked() {
        let cache = memory_only();
        assert!(cache.get(&key(3)).is_none());
        assert_eq!(cache.metrics().misses, 1);
    }

    #[test]
    fn invalidation_clears_the_source() {
        let cache = memory_only();
        cache.put(key(0), asset());
        cache.invalidate_source(Fingerprint([1; 32]));
        assert!(cache.get(&key(0)).is_none());
    }
}
