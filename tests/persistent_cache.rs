//! Persistent tier behavior across cache instances: survival, promotion,
//! budgets, and deletability.

use std::time::Duration;

use spritescan_rs::pool::stub::synthetic_asset;
use spritescan_rs::{AssetCache, CacheConfig, CacheKey, DecodeError, Fingerprint};

fn cfg(root: &std::path::Path) -> CacheConfig {
    CacheConfig {
        persistent_root: Some(root.to_path_buf()),
        ..CacheConfig::default()
    }
}

fn key(offset: u64) -> CacheKey {
    CacheKey {
        fingerprint: Fingerprint([0x11; 32]),
        offset,
        params_hash: 0x5eed,
    }
}

#[test]
fn verdicts_survive_a_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = AssetCache::new(&cfg(dir.path()));
        cache.put(key(0x200000), Ok(synthetic_asset(3)));
        cache.put(key(0x300000), Err(DecodeError::NotCompressed));
    }

    // A fresh instance over the same root sees the same verdicts.
    let cache = AssetCache::new(&cfg(dir.path()));
    let asset = cache.get(&key(0x200000)).unwrap().unwrap();
    assert_eq!(asset.tile_count, 3);
    assert!(matches!(
        cache.get(&key(0x300000)),
        Some(Err(DecodeError::NotCompressed))
    ));

    let metrics = cache.metrics();
    assert_eq!(metrics.persistent_hits, 2);
    // Promote-on-read: the second lookup stays in memory.
    let _ = cache.get(&key(0x200000));
    assert_eq!(cache.metrics().memory_hits, 1);
}

#[test]
fn deleting_the_store_is_always_safe() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AssetCache::new(&cfg(dir.path()));
    cache.put(key(64), Ok(synthetic_asset(1)));

    // The store is a pure accelerator: wipe it wholesale mid-session.
    std::fs::remove_dir_all(dir.path()).unwrap();

    assert!(cache.get(&key(9999)).is_none());
    // Writes keep working (the tier recreates its directories).
    cache.put(key(128), Ok(synthetic_asset(1)));
    assert!(cache.get(&key(128)).is_some());
}

#[test]
fn entry_budget_is_enforced_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = AssetCache::new(&cfg(dir.path()));
        for i in 0..6 {
            cache.put(key(i * 64), Ok(synthetic_asset(1)));
        }
    }

    let tight = CacheConfig {
        persistent_root: Some(dir.path().to_path_buf()),
        persistent_budget_entries: 2,
        ..CacheConfig::default()
    };
    let cache = AssetCache::new(&tight);
    let survivors = (0..6)
        .filter(|i| cache.get(&key(i * 64)).is_some())
        .count();
    assert!(survivors <= 2, "budget 2, {survivors} records survived");
}

#[test]
fn expired_records_are_swept() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = AssetCache::new(&cfg(dir.path()));
        cache.put(key(0), Ok(synthetic_asset(1)));
    }

    let expiring = CacheConfig {
        persistent_root: Some(dir.path().to_path_buf()),
        persistent_max_age: Duration::ZERO,
        ..CacheConfig::default()
    };
    let cache = AssetCache::new(&expiring);
    assert!(cache.get(&key(0)).is_none());
}

#[test]
fn invalidate_source_clears_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AssetCache::new(&cfg(dir.path()));
    cache.put(key(0), Ok(synthetic_asset(1)));
    assert!(cache.get(&key(0)).is_some());

    cache.invalidate_source(Fingerprint([0x11; 32]));
    assert!(cache.get(&key(0)).is_none());

    // Gone on disk too: a fresh instance misses.
    let fresh = AssetCache::new(&cfg(dir.path()));
    assert!(fresh.get(&key(0)).is_none());
}
