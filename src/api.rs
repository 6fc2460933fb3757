use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// --------------------------
// Public API types
// --------------------------

/// Bytes of pixel data produced per decoded tile (8x8, one byte per pixel).
pub const TILE_PIXEL_BYTES: usize = 64;

/// Content fingerprint of a source blob (SHA-256).
///
/// Cache keys and the persistent store are addressed by fingerprint rather
/// than by path, so renaming or re-opening the same bytes keeps prior work.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Lowercase hex rendering, used for persistent-store directory names.
    pub fn to_hex(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::with_capacity(64);
        for b in self.0 {
            // Writing to a String cannot fail.
            let _ = write!(out, "{b:02x}");
        }
        out
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", &self.to_hex()[..8])
    }
}

/// Identifies one preview surface (browsing context) consuming a coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

/// Monotonically increasing per-session sequence number.
///
/// Supersession is decided entirely by comparing these: a result whose id is
/// older than the session's latest issued id is stale and must be discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// One decode attempt at a fixed offset.
///
/// Immutable once built; created per scan step or per preview dispatch.
#[derive(Clone, Copy, Debug)]
pub struct DecodeRequest {
    pub fingerprint: Fingerprint,
    pub offset: u64,
    /// Upper bound on compressed bytes the decoder may consume.
    pub max_bytes: u32,
    pub request_id: RequestId,
}

/// Successfully decoded tile data plus metadata.
///
/// The pixel buffer is shared read-only between cache tiers and consumers;
/// entries are never mutated after creation, so handing out clones of the
/// `Arc` is safe under concurrent eviction.
#[derive(Clone, Debug)]
pub struct DecodedAsset {
    /// Number of 8x8 tiles decoded.
    pub tile_count: u32,
    /// Compressed bytes consumed from the source.
    pub bytes_consumed: u32,
    /// `tile_count * TILE_PIXEL_BYTES` bytes of indexed pixel data.
    pub pixels: Arc<[u8]>,
    /// Deterministic plausibility score in `[0.0, 1.0]` (see `score`).
    pub quality: f32,
}

impl DecodedAsset {
    /// Internal invariant checks applied wherever assets enter the system.
    pub(crate) fn assert_valid(&self) {
        assert_eq!(
            self.pixels.len(),
            self.tile_count as usize * TILE_PIXEL_BYTES,
            "pixel buffer length does not match tile count"
        );
        assert!(
            (0.0..=1.0).contains(&self.quality),
            "quality score out of range: {}",
            self.quality
        );
    }

    /// Total size of the asset payload in bytes, used for cache budgeting.
    pub fn size_bytes(&self) -> usize {
        self.pixels.len()
    }
}

/// Why a decode attempt produced no asset.
///
/// These are data-shaped outcomes, not failures of the calling request: all
/// kinds except `Cancelled` are delivered to the UI (as "no asset here") and
/// cached like successful decodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum DecodeError {
    /// The bytes at the offset are not a valid compressed stream.
    #[error("no compressed stream at offset")]
    NotCompressed,
    /// A stream started but ran past the readable window.
    #[error("compressed stream truncated")]
    Truncated,
    /// The worker process misbehaved (crash, protocol violation).
    #[error("decoder fault")]
    DecoderFault,
    /// The worker did not answer within the per-call deadline.
    #[error("decode timed out")]
    Timeout,
    /// The request was superseded before completion. Never cached, never
    /// delivered: cancellation is a property of the request, not the data.
    #[error("decode cancelled")]
    Cancelled,
}

impl DecodeError {
    /// Cancellation is expected during interactive scrubbing and is not
    /// logged as an error.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DecodeError::Cancelled)
    }

    /// Kinds caused by worker health rather than the bytes themselves.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, DecodeError::DecoderFault | DecodeError::Timeout)
    }
}

/// Transport-level dispatch failures.
///
/// Unlike [`DecodeError`], these say nothing about the bytes at the offset
/// and are never written to the asset cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// No worker could be spawned and the fallback path is unavailable.
    #[error("no decoder worker available")]
    WorkerUnavailable,
    /// The bounded dispatch queue was full; this request was shed.
    #[error("decoder queue full")]
    QueueFull,
}

/// The cacheable outcome of a decode attempt.
///
/// Decoding is deterministic for fixed bytes and parameters, so a verdict,
/// once computed, is immutable and safe to share.
pub type DecodeVerdict = Result<DecodedAsset, DecodeError>;

/// Composite cache key: which bytes, where, decoded how.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub offset: u64,
    /// Folds every decode-affecting parameter (`max_bytes`, candidate size
    /// bounds) so changed parameters never serve stale verdicts.
    pub params_hash: u64,
}

/// A scanner discovery: an offset that decoded into a plausible asset.
#[derive(Clone, Debug)]
pub struct ScoredCandidate {
    pub offset: u64,
    pub score: f32,
    pub asset: DecodedAsset,
}

/// Synchronous answer from `request_preview`: was the verdict already known?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache; the result is already on the delivery channel.
    Hit,
    /// Decode work was scheduled; a result will arrive asynchronously.
    Miss,
}

/// What a preview request resolved to.
#[derive(Clone, Debug)]
pub enum PreviewPayload {
    Asset(DecodedAsset),
    /// Decode ran and concluded there is nothing (or nothing healthy) here.
    NoAsset(DecodeError),
    /// The decode could not be dispatched at all (shed or degraded pool).
    Unavailable(PoolError),
}

/// Asynchronously delivered preview outcome.
///
/// Within one session these arrive in non-decreasing `request_id` order;
/// superseded requests produce no result at all.
#[derive(Clone, Debug)]
pub struct PreviewResult {
    pub session: SessionId,
    pub request_id: RequestId,
    pub offset: u64,
    pub payload: PreviewPayload,
}
