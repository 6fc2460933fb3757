//! Statistical pre-filter that decides which regions are worth decoding.
//!
//! # Problem statement
//! Invoking the decoder is expensive relative to reading bytes: most of a
//! ROM is padding, tables, or machine code, and blind decode attempts at
//! every step waste the worker pool on data that cannot be a compressed
//! stream. This module builds a cheap, heuristic gate that rejects such
//! regions up front.
//!
//! # High-level algorithm
//! 1. Shannon entropy over the window's byte histogram.
//! 2. Zero-byte fraction.
//! 3. Short repeating-pattern detection (period <= 16 covering > 90%).
//! A region is likely empty when entropy is below the floor, zeros exceed
//! the ceiling, or a repeating pattern covers the window.
//!
//! # Invariants and trade-offs
//! - Pure function of the bytes: identical windows always classify
//!   identically, and classification never fails for any byte content.
//! - The gate is heuristic: it can pass regions that do not decode. It must
//!   not reject real compressed data, which is inherently high-entropy, so
//!   the entropy floor defaults far below any real stream's entropy.
//! - Windows shorter than [`MIN_ENTROPY_LEN`] skip the entropy test (the
//!   estimate is too noisy) and fall back to the zero/pattern tests.
//!
//! # Complexity
//! One histogram pass plus `O(PATTERN_PERIOD_MAX * len)` for the pattern
//! probe, on windows of `region_size` bytes (4 KiB by default).

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::api::Fingerprint;
use crate::config::{ClassifierConfig, PATTERN_COVERAGE_MIN, PATTERN_PERIOD_MAX};
use crate::source::Source;

/// Minimum window length for a meaningful entropy estimate.
pub const MIN_ENTROPY_LEN: usize = 64;

/// Derived statistics for one byte window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionStats {
    /// Shannon entropy in bits per byte, `[0.0, 8.0]`.
    pub entropy: f64,
    /// Fraction of zero bytes, `[0.0, 1.0]`.
    pub zero_fraction: f64,
    /// A period <= 16 pattern covers more than 90% of the window.
    pub repeating: bool,
}

/// Verdict of the pre-filter for one region.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Classification {
    /// Skip decoding: the region cannot plausibly hold a compressed stream.
    pub likely_empty: bool,
    /// Normalized entropy, usable as a coarse interest ranking.
    pub score: f64,
    pub stats: RegionStats,
}

/// Classifier with a per-region memo table.
///
/// Classification is pure, so memoized results are valid for the lifetime
/// of the source identified by the fingerprint in the key.
pub struct RegionClassifier {
    cfg: ClassifierConfig,
    memo: Mutex<AHashMap<(Fingerprint, u64), Classification>>,
}

impl RegionClassifier {
    pub fn new(cfg: ClassifierConfig) -> Self {
        cfg.assert_valid();
        Self {
            cfg,
            memo: Mutex::new(AHashMap::new()),
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.cfg
    }

    /// Classifies the aligned region containing `offset`, memoized.
    pub fn classify_at(&self, source: &Source, offset: u64) -> Classification {
        let region_size = self.cfg.region_size as u64;
        let index = offset / region_size;
        let key = (source.fingerprint(), index);
        if let Some(hit) = self.memo.lock().get(&key) {
            return *hit;
        }
        let window = source.window(index * region_size, self.cfg.region_size);
        let result = classify_window(window, &self.cfg);
        self.memo.lock().insert(key, result);
        result
    }

    /// Drops memoized stats for one source.
    pub fn invalidate_source(&self, fingerprint: Fingerprint) {
        self.memo.lock().retain(|(fp, _), _| *fp != fingerprint);
    }
}

/// Pure classification of one byte window. Never fails.
pub fn classify_window(window: &[u8], cfg: &ClassifierConfig) -> Classification {
    if window.is_empty() {
        // Nothing to decode past the end of the blob.
        let stats = RegionStats {
            entropy: 0.0,
            zero_fraction: 1.0,
            repeating: false,
        };
        return Classification {
            likely_empty: true,
            score: 0.0,
            stats,
        };
    }

    let mut histogram = [0u64; 256];
    for &b in window {
        histogram[b as usize] += 1;
    }

    let entropy = shannon_entropy(&histogram, window.len());
    let zero_fraction = memchr::memchr_iter(0, window).count() as f64 / window.len() as f64;
    let repeating = repeating_pattern(window);

    let entropy_low = window.len() >= MIN_ENTROPY_LEN && entropy < cfg.entropy_threshold;
    let likely_empty = entropy_low || zero_fraction > cfg.zero_threshold || repeating;

    Classification {
        likely_empty,
        score: entropy / 8.0,
        stats: RegionStats {
            entropy,
            zero_fraction,
            repeating,
        },
    }
}

fn shannon_entropy(histogram: &[u64; 256], len: usize) -> f64 {
    let len = len as f64;
    let mut entropy = 0.0;
    for &count in histogram {
        if count == 0 {
            continue;
        }
        let p = count as f64 / len;
        entropy -= p * p.log2();
    }
    entropy
}

/// Probes for a short repeating fill (period <= 16 covering > 90%).
///
/// Catches structured padding like `FF 00 FF 00 ...` that keeps enough
/// entropy to slip past the histogram test.
fn repeating_pattern(window: &[u8]) -> bool {
    for period in 1..=PATTERN_PERIOD_MAX {
        if window.len() <= period {
            break;
        }
        let comparable = window.len() - period;
        let matches = window
            .iter()
            .zip(&window[period..])
            .filter(|(a, b)| a == b)
            .count();
        if matches as f64 / comparable as f64 > PATTERN_COVERAGE_MIN {
            return true;
        }
    }
    false
}
