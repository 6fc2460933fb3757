//! Deterministic in-process decoder for tests and harnesses.
//!
//! Implements [`AssetDecoder`](super::AssetDecoder) with scripted outcomes
//! keyed by offset, an optional artificial latency, and a call counter so
//! tests can assert the cache-hit path never reaches the decoder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::api::{
    DecodeError, DecodeRequest, DecodeVerdict, DecodedAsset, PoolError, TILE_PIXEL_BYTES,
};
use crate::pool::AssetDecoder;
use crate::score::score_tiles;

/// Scripted decoder: offsets not present in the script decode to
/// `NotCompressed`, like empty ROM space.
pub struct ScriptedDecoder {
    outcomes: HashMap<u64, DecodeVerdict>,
    latency: Duration,
    calls: AtomicU64,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self {
            outcomes: HashMap::new(),
            latency: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    /// Every decode call blocks this long first, to widen race windows in
    /// supersession tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn script(mut self, offset: u64, verdict: DecodeVerdict) -> Self {
        self.outcomes.insert(offset, verdict);
        self
    }

    /// Scripts a valid asset of `tiles` textured tiles at `offset`.
    pub fn script_asset(self, offset: u64, tiles: u32) -> Self {
        let verdict = Ok(synthetic_asset(tiles));
        self.script(offset, verdict)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Default for ScriptedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetDecoder for ScriptedDecoder {
    fn decode(&self, request: &DecodeRequest) -> Result<DecodeVerdict, PoolError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        Ok(self
            .outcomes
            .get(&request.offset)
            .cloned()
            .unwrap_or(Err(DecodeError::NotCompressed)))
    }
}

/// Builds a textured, deterministic asset that clears the default
/// acceptance score.
pub fn synthetic_asset(tiles: u32) -> DecodedAsset {
    let pixels: Vec<u8> = (0..tiles as usize * TILE_PIXEL_BYTES)
        .map(|i| ((i * 7 + i / 8) % 16) as u8)
        .collect();
    let quality = score_tiles(&pixels);
    let asset = DecodedAsset {
        tile_count: tiles,
        bytes_consumed: tiles * 24,
        pixels: Arc::from(pixels),
        quality,
    };
    asset.assert_valid();
    asset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Fingerprint, RequestId};

    fn request(offset: u64) -> DecodeRequest {
        DecodeRequest {
            fingerprint: Fingerprint([0; 32]),
            offset,
            max_bytes: 4096,
            request_id: RequestId(1),
        }
    }

    #[test]
    fn unscripted_offsets_decode_to_not_compressed() {
        let stub = ScriptedDecoder::new();
        let got = stub.decode(&request(10)).unwrap();
        assert!(matches!(got, Err(DecodeError::NotCompressed)));
        assert_eq!(stub.calls(), 1);
    }

    #[test]
    fn scripted_assets_come_back_scored() {
        let stub = ScriptedDecoder::new().script_asset(0x40, 2);
        let asset = stub.decode(&request(0x40)).unwrap().unwrap();
        assert_eq!(asset.tile_count, 2);
        assert!(asset.quality > crate::config::DEFAULT_MIN_SCORE);
    }
}
