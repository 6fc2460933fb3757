#![allow(dead_code)] // Diagnostic accessors are intentionally broader than internal use.
//! Discovery and preview pipeline for compressed sprite assets embedded at
//! unknown offsets inside ROM images.
//!
//! ## Scope
//! This crate does everything *around* the decode: statistical pre-filtering
//! of empty regions, a persistent decoder process pool, offset scanning and
//! scoring, multi-tier verdict caching, and the debounced request
//! coordinator that serves an interactive scrubbing UI. The codec itself is
//! an external, stateless worker process behind a pipe protocol.
//!
//! ## Key invariants
//! - Decoding is deterministic for fixed bytes and parameters; verdicts are
//!   immutable once cached and replaced wholesale, never mutated.
//! - Work is bounded everywhere: pool queue depth, per-call deadlines,
//!   cache byte/entry budgets, and cooperative scan cancellation.
//! - Supersession is decided by monotone request ids, never by aborting
//!   work: a stale result is discarded, and delivered results within a
//!   session are strictly id-ordered.
//! - The pre-filter may pass regions that fail to decode, but never skips
//!   real compressed data: compressed streams are high-entropy by nature.
//!
//! ## Preview flow (one request)
//! 1) `request_preview` takes a fresh id and probes the cache (hit returns
//!    immediately).
//! 2) Interactive misses debounce; only a burst's last offset dispatches.
//! 3) Classifier gate, then the decoder pool, bounded by a hard timeout.
//! 4) Completion re-checks supersession, writes the cache, delivers.
//!
//! ## Scan flow (one range)
//! `cursor -> classifier gate -> cache probe -> decode -> score -> emit`,
//! lazily, cancellable at every step, with every verdict cached so later
//! previews and restarted scans are free.
//!
//! ## Notable entry points
//! - [`PreviewRuntime`]: compose-once context (cache + classifier + pool).
//! - [`PreviewCoordinator`] / [`OffsetScanner`]: per-session preview and
//!   background discovery.
//! - [`DecoderPool`] / [`AssetDecoder`]: process-backed decode transport
//!   and the seam tests substitute.

pub mod api;
pub mod cache;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod pool;
pub mod runtime;
pub mod scan;
pub mod score;
pub mod source;

pub use api::{
    CacheKey, CacheStatus, DecodeError, DecodeRequest, DecodeVerdict, DecodedAsset, Fingerprint,
    PoolError, PreviewPayload, PreviewResult, RequestId, ScoredCandidate, SessionId,
    TILE_PIXEL_BYTES,
};
pub use cache::{AssetCache, CacheError, CacheMetrics};
pub use classify::{classify_window, Classification, RegionClassifier, RegionStats};
pub use config::{
    CacheConfig, ClassifierConfig, CoordinatorConfig, PoolConfig, PoolStats, PreviewConfig,
    ScanConfig, ScanStats, WorkerCommand,
};
pub use coordinator::{PreviewCoordinator, PreviewState};
pub use pool::{AssetDecoder, DecoderPool, PoolInitError};
pub use runtime::{PreviewRuntime, RuntimeError, RuntimeStats};
pub use scan::{OffsetScanner, ScanEvent, ScanHandle, ScanIter, ScanProgress};
pub use score::score_tiles;
pub use source::Source;
