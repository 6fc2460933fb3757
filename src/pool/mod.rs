//! Decoder process pool: amortizes process-spawn cost across decode calls.
//!
//! # Problem statement
//! The decoder is an external, process-isolated, stateless transform.
//! Spawning a fresh process per call costs orders of magnitude more than the
//! decode itself; a scan makes thousands of calls. The pool keeps N
//! long-lived workers, each serving one call at a time over length-prefixed
//! pipes, with FIFO dispatch through one bounded queue.
//!
//! # Invariants
//! - Dispatch is fair: jobs are served in arrival order from a single queue.
//! - The queue is bounded; on overflow the OLDEST pending job is shed with
//!   `PoolError::QueueFull` so a stalled pool cannot grow unbounded and
//!   fresh (interactive) work is never the casualty.
//! - A worker that misses the per-call deadline or breaks its pipe is
//!   killed and respawned lazily; its in-flight call resolves to `Timeout`
//!   or `DecoderFault` and is never silently retried.
//! - Shutdown is graceful (EOF signal, bounded wait, then kill) and leaves
//!   no orphan processes on any path, including drop without shutdown.
//!
//! # Degraded mode
//! If the pooled probe fails at construction (the worker cannot serve two
//! calls on one channel, or cannot spawn at all), the pool degrades to an
//! explicit single-shot mode: one process per call, higher latency, same
//! correctness. The mode is observable via `is_degraded` and announced once
//! at warn level. If the single-shot probe also fails, construction errors;
//! callers must surface that at open time, never lazily mid-scan.

pub mod protocol;
pub mod stub;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::api::{DecodeRequest, DecodeVerdict, PoolError};
use crate::config::{PoolConfig, PoolStats, WorkerCommand};
use worker::WorkerSlot;

/// Grace period for workers to exit after the EOF shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
/// Floor for probe deadlines; spawning can dwarf a single decode.
const PROBE_TIMEOUT_FLOOR: Duration = Duration::from_secs(1);

/// The seam between request producers and the decode transport.
///
/// The scanner and coordinator depend on this trait, not on the concrete
/// pool, so tests substitute deterministic in-process decoders.
pub trait AssetDecoder: Send + Sync {
    /// Blocks until the decode resolves or the per-call deadline passes.
    ///
    /// `Err(PoolError)` means the call never reached a decoder;
    /// `Ok(Err(DecodeError))` is a decode outcome like any other.
    fn decode(&self, request: &DecodeRequest) -> Result<DecodeVerdict, PoolError>;
}

/// Pool health counters (lock-free; relaxed ordering, pure accounting).
#[derive(Debug, Default)]
pub(crate) struct SharedStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    timeouts: AtomicU64,
    respawns: AtomicU64,
    shed: AtomicU64,
    fallback_calls: AtomicU64,
}

impl SharedStats {
    pub(crate) fn note_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn note_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn note_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn note_respawn(&self) {
        self.respawns.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn note_shed(&self) {
        self.shed.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn note_fallback(&self) {
        self.fallback_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            respawns: self.respawns.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls.load(Ordering::Relaxed),
        }
    }
}

/// Construction failure: neither the pool nor the single-shot fallback can
/// serve decodes. This is the pipeline's only fatal condition.
#[derive(Debug, thiserror::Error)]
#[error("decoder unavailable: pooled and single-shot probes both failed")]
pub struct PoolInitError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PoolMode {
    Pooled,
    SingleShot,
}

struct Job {
    offset: u64,
    max_bytes: u32,
    reply: Sender<Result<DecodeVerdict, PoolError>>,
}

/// Fixed-size pool of long-lived decoder worker processes.
pub struct DecoderPool {
    mode: PoolMode,
    cfg: PoolConfig,
    cmd: WorkerCommand,
    source_path: PathBuf,
    // Present in pooled mode; taken (dropped) on shutdown to disconnect.
    job_tx: Mutex<Option<Sender<Job>>>,
    job_rx: Receiver<Job>,
    slots: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SharedStats>,
}

impl DecoderPool {
    /// Probes the decoder and builds the pool, degrading to single-shot
    /// mode if persistent workers are unusable.
    pub fn new(
        cfg: PoolConfig,
        cmd: WorkerCommand,
        source_path: PathBuf,
    ) -> Result<Self, PoolInitError> {
        cfg.assert_valid();
        let stats = Arc::new(SharedStats::default());
        let probe_timeout = cfg.decode_timeout.max(PROBE_TIMEOUT_FLOOR);

        let mode = if pooled_probe(&cmd, &source_path, probe_timeout) {
            PoolMode::Pooled
        } else if single_shot_probe(&cmd, &source_path, probe_timeout) {
            warn!(
                program = %cmd.program.display(),
                "decoder pool unavailable; degrading to single-shot decode per call"
            );
            PoolMode::SingleShot
        } else {
            return Err(PoolInitError);
        };

        let (job_tx, job_rx) = bounded::<Job>(cfg.queue_cap);
        let mut slots = Vec::new();
        if mode == PoolMode::Pooled {
            for id in 0..cfg.pool_size {
                let slot = WorkerSlot::new(id, cmd.clone(), source_path.clone(), stats.clone());
                let rx = job_rx.clone();
                let timeout = cfg.decode_timeout;
                let shared = stats.clone();
                let handle = thread::Builder::new()
                    .name(format!("decoder-slot-{id}"))
                    .spawn(move || slot_main(slot, rx, timeout, shared))
                    .map_err(|_| PoolInitError)?;
                slots.push(handle);
            }
        }

        Ok(Self {
            mode,
            cfg,
            cmd,
            source_path,
            job_tx: Mutex::new(Some(job_tx)),
            job_rx,
            slots: Mutex::new(slots),
            stats,
        })
    }

    /// True when running without persistent workers (single-shot fallback).
    pub fn is_degraded(&self) -> bool {
        self.mode == PoolMode::SingleShot
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Signals workers to exit, waits briefly, force-kills stragglers.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let tx = self.job_tx.lock().take();
        drop(tx);
        let mut slots = self.slots.lock();
        for handle in slots.drain(..) {
            // Slot threads exit promptly once the queue disconnects; each
            // performs its own bounded child shutdown first.
            let _ = handle.join();
        }
    }

    fn decode_pooled(&self, offset: u64, max_bytes: u32) -> Result<DecodeVerdict, PoolError> {
        let (reply_tx, reply_rx) = bounded(1);
        let mut job = Job {
            offset,
            max_bytes,
            reply: reply_tx,
        };
        let tx = {
            let guard = self.job_tx.lock();
            guard.clone().ok_or(PoolError::WorkerUnavailable)?
        };

        // Drop-oldest backpressure: shed the front of the queue, keep the
        // newcomer. Interactive callers always get their freshest request in.
        loop {
            match tx.try_send(job) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    job = returned;
                    if let Ok(oldest) = self.job_rx.try_recv() {
                        self.stats.note_shed();
                        let _ = oldest.reply.send(Err(PoolError::QueueFull));
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(PoolError::WorkerUnavailable);
                }
            }
        }
        self.stats.note_dispatched();

        // Bounded: every job resolves within the per-call deadline, whether
        // decoded, timed out, or shed by a later arrival.
        reply_rx
            .recv()
            .unwrap_or(Err(PoolError::WorkerUnavailable))
    }

    fn decode_single_shot(&self, offset: u64, max_bytes: u32) -> Result<DecodeVerdict, PoolError> {
        self.stats.note_fallback();
        self.stats.note_dispatched();
        let mut slot = WorkerSlot::new(
            usize::MAX,
            self.cmd.clone(),
            self.source_path.clone(),
            self.stats.clone(),
        );
        let result = slot.decode_once(offset, max_bytes, self.cfg.decode_timeout);
        slot.shutdown(SHUTDOWN_GRACE);
        if result.is_ok() {
            self.stats.note_completed();
        }
        result
    }
}

impl AssetDecoder for DecoderPool {
    fn decode(&self, request: &DecodeRequest) -> Result<DecodeVerdict, PoolError> {
        match self.mode {
            PoolMode::Pooled => self.decode_pooled(request.offset, request.max_bytes),
            PoolMode::SingleShot => self.decode_single_shot(request.offset, request.max_bytes),
        }
    }
}

impl Drop for DecoderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn slot_main(
    mut slot: WorkerSlot,
    jobs: Receiver<Job>,
    timeout: Duration,
    stats: Arc<SharedStats>,
) {
    while let Ok(job) = jobs.recv() {
        let result = slot.decode_once(job.offset, job.max_bytes, timeout);
        if result.is_ok() {
            stats.note_completed();
        }
        // A caller that gave up on the reply is not an error here.
        let _ = job.reply.send(result);
    }
    slot.shutdown(SHUTDOWN_GRACE);
}

/// Verifies a worker can serve two calls over one channel, the property
/// that distinguishes a poolable decoder from a one-shot binary.
fn pooled_probe(cmd: &WorkerCommand, source_path: &std::path::Path, timeout: Duration) -> bool {
    let mut slot = WorkerSlot::new(
        0,
        cmd.clone(),
        source_path.to_path_buf(),
        Arc::new(SharedStats::default()),
    );
    let healthy = slot.probe(timeout) && slot.probe(timeout);
    debug!(healthy, "pooled decoder probe");
    slot.shutdown(SHUTDOWN_GRACE);
    healthy
}

/// Verifies a fresh process answers a single probe call.
fn single_shot_probe(cmd: &WorkerCommand, source_path: &std::path::Path, timeout: Duration) -> bool {
    let mut slot = WorkerSlot::new(
        0,
        cmd.clone(),
        source_path.to_path_buf(),
        Arc::new(SharedStats::default()),
    );
    let healthy = slot.probe(timeout);
    debug!(healthy, "single-shot decoder probe");
    slot.shutdown(SHUTDOWN_GRACE);
    healthy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_fails_when_no_decoder_exists() {
        let cmd = WorkerCommand {
            program: PathBuf::from("/nonexistent/decoder-binary"),
            args: vec![],
        };
        let got = DecoderPool::new(
            PoolConfig {
                decode_timeout: Duration::from_millis(50),
                ..PoolConfig::default()
            },
            cmd,
            PathBuf::from("/nonexistent/rom"),
        );
        assert!(got.is_err());
    }

    #[test]
    fn stats_snapshot_starts_at_zero() {
        let stats = SharedStats::default();
        let snap = stats.snapshot();
        assert_eq!(snap.dispatched, 0);
        assert_eq!(snap.shed, 0);
        stats.note_shed();
        assert_eq!(stats.snapshot().shed, 1);
    }
}
