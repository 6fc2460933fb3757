//! Fingerprint/offset-keyed on-disk tier for decode verdicts.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<fingerprint_hex>/<offset_hex>_<params_hex>.rec
//! ```
//!
//! Each record is `magic | header_len:u32 | header JSON | raw pixel payload`.
//! Records are written to a temp file and renamed into place, so readers
//! only ever see whole records and the store tolerates concurrent writers
//! racing on the same key (last rename wins; both wrote identical bytes,
//! decoding is deterministic).
//!
//! The store is a pure accelerator: any file may be deleted at any time,
//! including the whole root. Corrupt or unreadable records read as misses
//! and are removed opportunistically. All I/O failures degrade the calling
//! operation to memory-only and are logged, never propagated to the
//! requester.
//!
//! Eviction is age + entry budget, enforced at construction and amortized
//! every [`EVICT_EVERY_PUTS`] writes: oldest records (by modification time)
//! go first once the budget is exceeded; records past `max_age` go
//! regardless of budget.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{CacheKey, DecodeError, DecodeVerdict, DecodedAsset, Fingerprint, TILE_PIXEL_BYTES};

const MAGIC: &[u8; 8] = b"SSCACHE1";
const RECORD_EXT: &str = "rec";
/// Puts between eviction sweeps.
const EVICT_EVERY_PUTS: u64 = 64;
/// Upper bound on a record header, to reject corrupt length prefixes.
const MAX_HEADER_LEN: u32 = 4096;

/// Persistent-tier failure. Recovered locally (the tier degrades for that
/// operation); surfaced only as a degraded-mode signal.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache store I/O failure: {0}")]
    IoFailure(#[from] io::Error),
}

#[derive(Serialize, Deserialize)]
struct RecordHeader {
    tile_count: u32,
    bytes_consumed: u32,
    quality: f32,
    /// Present for cached no-asset verdicts; payload is then empty.
    error: Option<DecodeError>,
}

pub(crate) struct PersistentTier {
    root: PathBuf,
    budget_entries: usize,
    max_age: Duration,
    puts: AtomicU64,
    /// Latched on first I/O failure; read by the runtime's diagnostics.
    degraded: AtomicBool,
}

impl PersistentTier {
    /// Opens (creating if needed) the store and runs an initial sweep.
    pub(crate) fn open(
        root: PathBuf,
        budget_entries: usize,
        max_age: Duration,
    ) -> Result<Self, CacheError> {
        fs::create_dir_all(&root)?;
        let tier = Self {
            root,
            budget_entries,
            max_age,
            puts: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        };
        tier.evict();
        Ok(tier)
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.fingerprint.to_hex())
            .join(format!("{:016x}_{:016x}.{RECORD_EXT}", key.offset, key.params_hash))
    }

    /// Reads a verdict, or `None` for miss/corrupt/unreadable.
    pub(crate) fn get(&self, key: &CacheKey) -> Option<DecodeVerdict> {
        let path = self.record_path(key);
        match read_record(&path) {
            Ok(Some(verdict)) => Some(verdict),
            Ok(None) => None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "dropping unreadable cache record");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Stores a verdict; failures degrade silently to memory-only.
    pub(crate) fn put(&self, key: &CacheKey, verdict: &DecodeVerdict) {
        if let Err(e) = self.try_put(key, verdict) {
            self.note_failure(&e);
        }
        if self.puts.fetch_add(1, Ordering::Relaxed) % EVICT_EVERY_PUTS == 0 {
            self.evict();
        }
    }

    fn try_put(&self, key: &CacheKey, verdict: &DecodeVerdict) -> Result<(), CacheError> {
        let dir = self.root.join(key.fingerprint.to_hex());
        fs::create_dir_all(&dir)?;

        let (header, payload): (RecordHeader, &[u8]) = match verdict {
            Ok(asset) => (
                RecordHeader {
                    tile_count: asset.tile_count,
                    bytes_consumed: asset.bytes_consumed,
                    quality: asset.quality,
                    error: None,
                },
                &asset.pixels,
            ),
            Err(err) => {
                assert!(
                    !err.is_cancelled(),
                    "Cancelled is never cached; caller must filter"
                );
                (
                    RecordHeader {
                        tile_count: 0,
                        bytes_consumed: 0,
                        quality: 0.0,
                        error: Some(*err),
                    },
                    &[],
                )
            }
        };
        let header_json = serde_json::to_vec(&header)
            .map_err(|e| CacheError::IoFailure(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        // Temp-then-rename keeps readers off partial records.
        let tmp = dir.join(format!(
            ".tmp-{:016x}-{}",
            key.offset,
            std::process::id()
        ));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(MAGIC)?;
            file.write_all(&(header_json.len() as u32).to_le_bytes())?;
            file.write_all(&header_json)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        let path = self.record_path(key);
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Deletes every record for one source.
    pub(crate) fn invalidate_source(&self, fingerprint: Fingerprint) {
        let dir = self.root.join(fingerprint.to_hex());
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != io::ErrorKind::NotFound {
                self.note_failure(&CacheError::IoFailure(e));
            }
        }
    }

    /// Age + budget sweep. Oldest records are removed first once over the
    /// entry budget; expired records are removed unconditionally.
    fn evict(&self) {
        let mut records: Vec<(SystemTime, PathBuf)> = Vec::new();
        let now = SystemTime::now();
        let dirs = match fs::read_dir(&self.root) {
            Ok(dirs) => dirs,
            Err(e) => {
                self.note_failure(&CacheError::IoFailure(e));
                return;
            }
        };
        for dir in dirs.flatten() {
            let Ok(entries) = fs::read_dir(dir.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                let modified = meta.modified().unwrap_or(now);
                if now
                    .duration_since(modified)
                    .map(|age| age > self.max_age)
                    .unwrap_or(false)
                {
                    let _ = fs::remove_file(&path);
                    continue;
                }
                records.push((modified, path));
            }
        }
        if records.len() > self.budget_entries {
            records.sort_by_key(|(modified, _)| *modified);
            let excess = records.len() - self.budget_entries;
            for (_, path) in records.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
    }

    fn note_failure(&self, error: &CacheError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                root = %self.root.display(),
                %error,
                "persistent cache degraded to memory-only"
            );
        }
    }
}

fn read_record(path: &Path) -> io::Result<Option<DecodeVerdict>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad record magic"));
    }
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let header_len = u32::from_le_bytes(len_buf);
    if header_len == 0 || header_len > MAX_HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "record header length out of bounds",
        ));
    }
    let mut header_json = vec![0u8; header_len as usize];
    file.read_exact(&mut header_json)?;
    let header: RecordHeader = serde_json::from_slice(&header_json)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if let Some(err) = header.error {
        return Ok(Some(Err(err)));
    }

    let mut pixels = Vec::new();
    file.read_to_end(&mut pixels)?;
    if pixels.len() != header.tile_count as usize * TILE_PIXEL_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "record payload length does not match tile count",
        ));
    }
    let asset = DecodedAsset {
        tile_count: header.tile_count,
        bytes_consumed: header.bytes_consumed,
        pixels: Arc::from(pixels),
        quality: header.quality,
    };
    asset.assert_valid();
    Ok(Some(Ok(asset)))
}
