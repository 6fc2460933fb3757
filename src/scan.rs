//! Offset scanner: walks a byte range and yields ranked sprite candidates.
//!
//! # Flow per step
//! classifier gate -> cache probe -> decode -> size bounds -> score ->
//! emit + cache write. The classifier keeps the decoder off empty space;
//! the cache write makes every verdict free for later preview requests and
//! scan restarts.
//!
//! # Invariants
//! - The sequence is lazy: work happens inside `next()`, nothing is
//!   prefetched, and consumers may stop after any candidate.
//! - Cancellation is cooperative and checked at every step boundary, so
//!   stop latency is bounded by one decode call.
//! - A scan is restartable: `resume` continues from a saved cursor, and
//!   prior verdicts short-circuit through the cache rather than being
//!   recomputed.
//! - Candidates are tracked ordered by score descending, ties broken by
//!   ascending offset.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info};

use crate::api::{CacheKey, DecodeRequest, RequestId, ScoredCandidate};
use crate::cache::AssetCache;
use crate::classify::RegionClassifier;
use crate::config::{ScanConfig, ScanStats};
use crate::pool::AssetDecoder;
use crate::source::Source;

/// Depth of the background scan's event channel.
const EVENT_CHANNEL_CAP: usize = 1024;

/// Events emitted by a background scan.
#[derive(Clone, Debug)]
pub enum ScanEvent {
    Candidate(ScoredCandidate),
    Progress(ScanProgress),
    /// Terminal event: the scan completed or was cancelled.
    Finished(ScanStats),
}

#[derive(Clone, Copy, Debug)]
pub struct ScanProgress {
    pub cursor: u64,
    pub range_end: u64,
    pub stats: ScanStats,
}

/// Mutable state owned exclusively by one scan invocation.
///
/// Discarded when the scan completes or is cancelled; a restart builds a
/// fresh session from the saved cursor.
struct ScanSession {
    cursor: u64,
    end: u64,
    request_seq: u64,
    stats: ScanStats,
    cancel: Arc<AtomicBool>,
    /// Discoveries so far, score descending then offset ascending.
    candidates: Vec<ScoredCandidate>,
}

impl ScanSession {
    fn new(range: Range<u64>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            cursor: range.start,
            end: range.end,
            request_seq: 0,
            stats: ScanStats::default(),
            cancel,
            candidates: Vec::new(),
        }
    }

    fn record(&mut self, candidate: ScoredCandidate) {
        let at = self
            .candidates
            .partition_point(|c| {
                c.score > candidate.score
                    || (c.score == candidate.score && c.offset < candidate.offset)
            });
        self.candidates.insert(at, candidate);
    }
}

/// Outcome of advancing the cursor by one step.
enum Step {
    Candidate(ScoredCandidate),
    /// Step consumed but nothing emitted (skipped, no asset, shed).
    Advanced,
    Cancelled,
    End,
}

/// Scanner component: stateless across scans, cheap to clone.
#[derive(Clone)]
pub struct OffsetScanner {
    classifier: Arc<RegionClassifier>,
    decoder: Arc<dyn AssetDecoder>,
    cache: Arc<AssetCache>,
    cfg: ScanConfig,
}

impl OffsetScanner {
    pub fn new(
        classifier: Arc<RegionClassifier>,
        decoder: Arc<dyn AssetDecoder>,
        cache: Arc<AssetCache>,
        cfg: ScanConfig,
    ) -> Self {
        cfg.assert_valid();
        Self {
            classifier,
            decoder,
            cache,
            cfg,
        }
    }

    /// Lazily scans `range`, yielding candidates in offset order.
    pub fn scan(&self, source: Source, range: Range<u64>) -> ScanIter {
        self.resume(source, range, None)
    }

    /// Continues a scan from a saved cursor within `range`.
    pub fn resume(&self, source: Source, range: Range<u64>, cursor: Option<u64>) -> ScanIter {
        let end = range.end.min(source.len());
        let start = cursor.unwrap_or(range.start).max(range.start);
        let cancel = Arc::new(AtomicBool::new(false));
        ScanIter {
            scanner: self.clone(),
            source,
            session: ScanSession::new(start..end, cancel),
        }
    }

    /// Runs the scan on a background thread, reporting over a channel.
    ///
    /// The returned handle cancels cooperatively; dropping it stops the
    /// scan rather than leaking a detached worker.
    pub fn spawn(&self, source: Source, range: Range<u64>) -> ScanHandle {
        let mut iter = self.scan(source, range);
        let cancel = iter.session.cancel.clone();
        let (tx, events) = bounded(EVENT_CHANNEL_CAP);
        let progress_every = self.cfg.progress_every_steps;
        let thread = thread::Builder::new()
            .name("offset-scan".into())
            .spawn(move || scan_main(&mut iter, tx, progress_every))
            .expect("spawning scan thread");
        ScanHandle {
            cancel,
            events,
            thread: Some(thread),
        }
    }
}

/// Lazy candidate sequence; all scan work happens inside `next()`.
pub struct ScanIter {
    scanner: OffsetScanner,
    source: Source,
    session: ScanSession,
}

impl ScanIter {
    /// Current cursor; feed back into `resume` to continue later.
    pub fn cursor(&self) -> u64 {
        self.session.cursor
    }

    pub fn stats(&self) -> ScanStats {
        self.session.stats
    }

    /// Candidates discovered so far, best first.
    pub fn candidates(&self) -> &[ScoredCandidate] {
        &self.session.candidates
    }

    /// Shareable cancellation flag for cooperative stop.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.session.cancel.clone()
    }

    fn step(&mut self) -> Step {
        let session = &mut self.session;
        if session.cancel.load(Ordering::Relaxed) {
            return Step::Cancelled;
        }
        if session.cursor >= session.end {
            return Step::End;
        }
        let cfg = &self.scanner.cfg;
        let offset = session.cursor;
        let advance = cfg.scan_step.min(session.end - offset);
        session.cursor += advance;
        session.stats.steps += 1;
        session.stats.bytes_scanned += advance;

        let classification = self.scanner.classifier.classify_at(&self.source, offset);
        if classification.likely_empty {
            session.stats.skipped_empty += 1;
            return Step::Advanced;
        }

        let key = CacheKey {
            fingerprint: self.source.fingerprint(),
            offset,
            params_hash: cfg.params_hash(),
        };
        let verdict = match self.scanner.cache.get(&key) {
            Some(hit) => {
                session.stats.cache_hits += 1;
                hit
            }
            None => {
                session.request_seq += 1;
                let request = DecodeRequest {
                    fingerprint: self.source.fingerprint(),
                    offset,
                    max_bytes: cfg.max_candidate_bytes,
                    request_id: RequestId(session.request_seq),
                };
                session.stats.decode_attempts += 1;
                match self.scanner.decoder.decode(&request) {
                    Ok(verdict) => {
                        self.scanner.cache.put(key, verdict.clone());
                        verdict
                    }
                    Err(pool_err) => {
                        // Transport failure, not a verdict about the bytes:
                        // count it and move on; the offset stays uncached.
                        debug!(offset, error = %pool_err, "decode dispatch failed during scan");
                        session.stats.pool_errors += 1;
                        return Step::Advanced;
                    }
                }
            }
        };

        let Ok(asset) = verdict else {
            return Step::Advanced;
        };
        if asset.bytes_consumed < cfg.min_candidate_bytes
            || asset.bytes_consumed > cfg.max_candidate_bytes
            || asset.quality < cfg.min_score
        {
            return Step::Advanced;
        }
        session.stats.candidates += 1;
        let candidate = ScoredCandidate {
            offset,
            score: asset.quality,
            asset,
        };
        session.record(candidate.clone());
        Step::Candidate(candidate)
    }
}

impl Iterator for ScanIter {
    type Item = ScoredCandidate;

    fn next(&mut self) -> Option<ScoredCandidate> {
        loop {
            match self.step() {
                Step::Candidate(c) => return Some(c),
                Step::Advanced => continue,
                Step::Cancelled | Step::End => return None,
            }
        }
    }
}

/// Handle to a background scan.
pub struct ScanHandle {
    cancel: Arc<AtomicBool>,
    events: Receiver<ScanEvent>,
    thread: Option<JoinHandle<()>>,
}

impl ScanHandle {
    /// Requests cooperative cancellation; the scan stops at the next step
    /// boundary and emits its terminal `Finished` event.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Event stream: candidates, periodic progress, one terminal Finished.
    pub fn events(&self) -> &Receiver<ScanEvent> {
        &self.events
    }

    /// Waits for the scan thread to finish.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn scan_main(iter: &mut ScanIter, tx: Sender<ScanEvent>, progress_every: u64) {
    let mut last_progress_step = 0u64;
    loop {
        let outcome = iter.step();
        let stats = iter.session.stats;
        match outcome {
            Step::Candidate(candidate) => {
                debug!(offset = candidate.offset, score = candidate.score, "scan candidate");
                if tx.send(ScanEvent::Candidate(candidate)).is_err() {
                    // Receiver gone: nobody is listening, stop scanning.
                    return;
                }
            }
            Step::Advanced => {}
            Step::Cancelled | Step::End => {
                info!(
                    steps = stats.steps,
                    skipped = stats.skipped_empty,
                    candidates = stats.candidates,
                    "scan finished"
                );
                let _ = tx.send(ScanEvent::Finished(stats));
                return;
            }
        }
        if stats.steps >= last_progress_step + progress_every {
            last_progress_step = stats.steps;
            let progress = ScanProgress {
                cursor: iter.session.cursor,
                range_end: iter.session.end,
                stats,
            };
            if tx.send(ScanEvent::Progress(progress)).is_err() {
                return;
            }
        }
    }
}
