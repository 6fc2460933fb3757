//! One decoder worker slot: child process lifecycle and per-call protocol.
//!
//! Each slot is an explicit state machine:
//!
//! ```text
//! Spawning -> Ready -> Busy -> Ready
//!                        \-> Dead -> Spawning (lazy, on next use)
//! ```
//!
//! A slot owns at most one child process. The child's stdout is drained by a
//! dedicated pump thread into a channel so the slot can wait with a hard
//! deadline (`recv_timeout`); blocking reads alone cannot be bounded. A slot
//! that times out or sees a broken pipe kills its child and respawns lazily
//! on the next request; outstanding work is never silently retried here,
//! retry policy belongs to the caller.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::api::{DecodeError, DecodeVerdict, DecodedAsset, PoolError, TILE_PIXEL_BYTES};
use crate::config::WorkerCommand;
use crate::pool::protocol::{read_response, write_request, WirePayload, WireReply};
use crate::pool::SharedStats;
use crate::score::score_tiles;

/// Poll interval while waiting for a child to exit gracefully.
const EXIT_POLL: Duration = Duration::from_millis(5);

/// A spawned child plus its reply pump.
pub(crate) struct LiveWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    replies: Receiver<io::Result<WireReply>>,
}

impl LiveWorker {
    /// Spawns a worker serving the given source blob.
    ///
    /// The source path is appended to the configured argv; the worker maps
    /// the blob itself so only `{offset, max_bytes}` ever crosses the pipe.
    pub(crate) fn spawn(cmd: &WorkerCommand, source_path: &Path) -> io::Result<Self> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .arg(source_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin not piped")
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "worker stdout not piped")
        })?;

        // Pump replies until EOF, error, or the slot hangs up. The final
        // error send tells the slot the channel is dead rather than slow.
        let (tx, replies) = bounded::<io::Result<WireReply>>(1);
        thread::Builder::new()
            .name("decoder-pump".into())
            .spawn(move || loop {
                match read_response(&mut stdout) {
                    Ok(reply) => {
                        if tx.send(Ok(reply)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            })?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            replies,
        })
    }

    fn send_request(&mut self, offset: u64, max_bytes: u32) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed"))?;
        write_request(stdin, offset, max_bytes)
    }

    /// Closes stdin (the EOF shutdown signal) and waits up to `grace` for
    /// the child to exit, force-killing stragglers. Never leaves orphans.
    pub(crate) fn shutdown(mut self, grace: Duration) {
        drop(self.stdin.take());
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                Ok(None) | Err(_) => break,
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        // Last-resort containment; normal paths go through shutdown().
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Slot states, tracked explicitly for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// No live child; one will be spawned on next use.
    Idle,
    Ready,
    Busy,
    Dead,
}

/// One worker slot of the pool.
pub(crate) struct WorkerSlot {
    id: usize,
    cmd: WorkerCommand,
    source_path: PathBuf,
    worker: Option<LiveWorker>,
    state: SlotState,
    stats: Arc<SharedStats>,
}

impl WorkerSlot {
    pub(crate) fn new(
        id: usize,
        cmd: WorkerCommand,
        source_path: PathBuf,
        stats: Arc<SharedStats>,
    ) -> Self {
        Self {
            id,
            cmd,
            source_path,
            worker: None,
            state: SlotState::Idle,
            stats,
        }
    }

    /// Runs one decode call through this slot's child process.
    ///
    /// `Err(PoolError)` means dispatch failed (no child could be spawned);
    /// `Ok(Err(DecodeError))` is a decode outcome like any other.
    pub(crate) fn decode_once(
        &mut self,
        offset: u64,
        max_bytes: u32,
        timeout: Duration,
    ) -> Result<DecodeVerdict, PoolError> {
        if self.worker.is_none() {
            let respawn = self.state == SlotState::Dead;
            match LiveWorker::spawn(&self.cmd, &self.source_path) {
                Ok(worker) => {
                    if respawn {
                        self.stats.note_respawn();
                    }
                    debug!(slot = self.id, respawn, "decoder worker spawned");
                    self.worker = Some(worker);
                    self.state = SlotState::Ready;
                }
                Err(e) => {
                    warn!(slot = self.id, error = %e, "decoder worker spawn failed");
                    self.state = SlotState::Dead;
                    return Err(PoolError::WorkerUnavailable);
                }
            }
        }
        let worker = self.worker.as_mut().expect("live worker just ensured");

        self.state = SlotState::Busy;
        if let Err(e) = worker.send_request(offset, max_bytes) {
            debug!(slot = self.id, error = %e, "worker pipe broke on send");
            self.recycle();
            return Ok(Err(DecodeError::DecoderFault));
        }

        match worker.replies.recv_timeout(timeout) {
            Ok(Ok(reply)) => {
                self.state = SlotState::Ready;
                match reply {
                    Ok(payload) => match payload_to_asset(payload) {
                        Ok(asset) => Ok(Ok(asset)),
                        Err(violation) => {
                            warn!(slot = self.id, violation, "worker protocol violation");
                            self.recycle();
                            Ok(Err(DecodeError::DecoderFault))
                        }
                    },
                    Err(decode_err) => Ok(Err(decode_err)),
                }
            }
            Ok(Err(io_err)) => {
                debug!(slot = self.id, error = %io_err, "worker channel broke mid-call");
                self.recycle();
                Ok(Err(DecodeError::DecoderFault))
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stats.note_timeout();
                debug!(slot = self.id, ?timeout, "worker exceeded decode deadline");
                self.recycle();
                Ok(Err(DecodeError::Timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.recycle();
                Ok(Err(DecodeError::DecoderFault))
            }
        }
    }

    /// Sends a health probe and waits for any well-formed answer.
    pub(crate) fn probe(&mut self, timeout: Duration) -> bool {
        matches!(self.decode_once(0, 0, timeout), Ok(Err(_)) | Ok(Ok(_)))
            && self.state == SlotState::Ready
    }

    pub(crate) fn state(&self) -> SlotState {
        self.state
    }

    fn recycle(&mut self) {
        // Kill-on-drop contains the child; respawn happens lazily.
        self.worker = None;
        self.state = SlotState::Dead;
    }

    pub(crate) fn shutdown(&mut self, grace: Duration) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown(grace);
        }
        self.state = SlotState::Idle;
    }
}

/// Validates a wire payload and attaches the deterministic quality score.
fn payload_to_asset(payload: WirePayload) -> Result<DecodedAsset, &'static str> {
    let WirePayload {
        tile_count,
        bytes_consumed,
        pixels,
    } = payload;
    let expected = tile_count as usize * TILE_PIXEL_BYTES;
    if pixels.len() != expected {
        return Err("pixel payload length does not match tile count");
    }
    let quality = score_tiles(&pixels);
    let asset = DecodedAsset {
        tile_count,
        bytes_consumed,
        pixels: Arc::from(pixels),
        quality,
    };
    asset.assert_valid();
    Ok(asset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_validation_rejects_length_mismatch() {
        let bad = WirePayload {
            tile_count: 2,
            bytes_consumed: 8,
            pixels: vec![0u8; TILE_PIXEL_BYTES],
        };
        assert!(payload_to_asset(bad).is_err());
    }

    #[test]
    fn payload_conversion_scores_deterministically() {
        let pixels: Vec<u8> = (0..TILE_PIXEL_BYTES).map(|i| (i % 13) as u8).collect();
        let payload = WirePayload {
            tile_count: 1,
            bytes_consumed: 40,
            pixels: pixels.clone(),
        };
        let a = payload_to_asset(payload.clone()).unwrap();
        let b = payload_to_asset(payload).unwrap();
        assert_eq!(a.quality, b.quality);
        assert_eq!(a.pixels, b.pixels);
        assert_eq!(a.bytes_consumed, 40);
    }

    #[test]
    fn spawn_failure_reports_worker_unavailable() {
        let cmd = WorkerCommand {
            program: PathBuf::from("/nonexistent/decoder-binary"),
            args: vec![],
        };
        let mut slot = WorkerSlot::new(
            0,
            cmd,
            PathBuf::from("/nonexistent/rom"),
            Arc::new(SharedStats::default()),
        );
        let got = slot.decode_once(0, 16, Duration::from_millis(50));
        assert!(matches!(got, Err(PoolError::WorkerUnavailable)));
        assert_eq!(slot.state(), SlotState::Dead);
    }
}
