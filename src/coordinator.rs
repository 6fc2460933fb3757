//! Preview request coordinator: turns a stream of rapidly superseded
//! "preview offset X" requests into debounced, cancellable, cached decode
//! work.
//!
//! # State machine (per session)
//!
//! ```text
//! Idle -> Debouncing -> Dispatched -> Delivering -> Idle
//!   \------ cache hit: Idle is never left ------/
//! ```
//!
//! # Supersession protocol
//! Every `request_preview` call takes a fresh monotone [`RequestId`] and
//! becomes the session's current target. Correctness never depends on
//! aborting in-flight work: results are filtered by id at two points:
//! before dispatch (a stale dispatch is dropped before it reaches the
//! decoder) and at completion (a stale result is discarded silently). The
//! delivery gate additionally enforces that delivered ids are strictly
//! increasing, so a late straggler can never overwrite a newer preview.
//!
//! # Threading
//! `request_preview` is non-blocking and safe to call from the UI thread:
//! the debounce wait and the decode happen on the session's command-loop
//! thread, and results are pushed onto a channel the UI drains each frame.
//! The core never calls into UI state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::api::{
    CacheKey, CacheStatus, DecodeError, DecodeRequest, PreviewPayload, PreviewResult, RequestId,
    SessionId,
};
use crate::cache::AssetCache;
use crate::classify::RegionClassifier;
use crate::config::{CoordinatorConfig, ScanConfig};
use crate::pool::AssetDecoder;
use crate::source::Source;

/// Observable coordinator state, for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviewState {
    Idle,
    Debouncing,
    Dispatched,
    Delivering,
}

enum Cmd {
    Request {
        offset: u64,
        id: RequestId,
        interactive: bool,
    },
    Shutdown,
}

/// Serializes delivery and enforces strictly increasing request ids.
struct DeliveryGate {
    last_delivered: Mutex<u64>,
    tx: Sender<PreviewResult>,
}

impl DeliveryGate {
    /// Delivers unless an equal-or-newer result already went out.
    fn deliver(&self, result: PreviewResult) -> bool {
        let mut last = self.last_delivered.lock();
        if result.request_id.0 <= *last {
            trace!(id = result.request_id.0, "discarding stale preview result");
            return false;
        }
        *last = result.request_id.0;
        self.tx.send(result).is_ok()
    }
}

struct Shared {
    /// Latest issued id; anything older is superseded.
    latest: AtomicU64,
    gate: DeliveryGate,
    state: Mutex<PreviewState>,
}

impl Shared {
    fn latest(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: PreviewState) {
        *self.state.lock() = state;
    }
}

/// One coordinator per active preview surface.
///
/// Sessions share nothing but the asset cache; the design supports many
/// concurrent sessions without cross-session ordering guarantees.
pub struct PreviewCoordinator {
    session: SessionId,
    source: Source,
    cache: Arc<AssetCache>,
    scan_cfg: ScanConfig,
    shared: Arc<Shared>,
    cmd_tx: Sender<Cmd>,
    results: Receiver<PreviewResult>,
    worker: Option<JoinHandle<()>>,
}

impl PreviewCoordinator {
    pub fn new(
        session: SessionId,
        source: Source,
        classifier: Arc<RegionClassifier>,
        decoder: Arc<dyn AssetDecoder>,
        cache: Arc<AssetCache>,
        scan_cfg: ScanConfig,
        cfg: CoordinatorConfig,
    ) -> Self {
        scan_cfg.assert_valid();
        let (cmd_tx, cmd_rx) = unbounded();
        let (result_tx, results) = unbounded();
        let shared = Arc::new(Shared {
            latest: AtomicU64::new(0),
            gate: DeliveryGate {
                last_delivered: Mutex::new(0),
                tx: result_tx,
            },
            state: Mutex::new(PreviewState::Idle),
        });

        let loop_ctx = LoopCtx {
            session,
            source: source.clone(),
            classifier,
            decoder,
            cache: cache.clone(),
            scan_cfg: scan_cfg.clone(),
            debounce: cfg.debounce,
            shared: shared.clone(),
        };
        let worker = thread::Builder::new()
            .name(format!("preview-session-{}", session.0))
            .spawn(move || command_loop(loop_ctx, cmd_rx))
            .expect("spawning coordinator thread");

        Self {
            session,
            source,
            cache,
            scan_cfg,
            shared,
            cmd_tx,
            results,
            worker: Some(worker),
        }
    }

    /// Registers `offset` as the session's current desired preview.
    ///
    /// Non-blocking. Returns `Hit` when the verdict was already cached (the
    /// result is on the channel before this returns); `Miss` schedules
    /// debounced decode work. `interactive` marks continuous-gesture
    /// requests (slider drags), which debounce; discrete navigation passes
    /// `false` and dispatches immediately.
    pub fn request_preview(&self, offset: u64, interactive: bool) -> CacheStatus {
        let id = RequestId(self.shared.latest.fetch_add(1, Ordering::SeqCst) + 1);
        let key = CacheKey {
            fingerprint: self.source.fingerprint(),
            offset,
            params_hash: self.scan_cfg.params_hash(),
        };
        if let Some(verdict) = self.cache.get(&key) {
            let payload = match verdict {
                Ok(asset) => PreviewPayload::Asset(asset),
                Err(err) => PreviewPayload::NoAsset(err),
            };
            self.shared.gate.deliver(PreviewResult {
                session: self.session,
                request_id: id,
                offset,
                payload,
            });
            return CacheStatus::Hit;
        }
        let _ = self.cmd_tx.send(Cmd::Request {
            offset,
            id,
            interactive,
        });
        CacheStatus::Miss
    }

    /// Channel of delivered previews, in increasing request-id order.
    pub fn results(&self) -> &Receiver<PreviewResult> {
        &self.results
    }

    pub fn state(&self) -> PreviewState {
        *self.shared.state.lock()
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    fn shutdown_worker(&mut self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PreviewCoordinator {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

struct LoopCtx {
    session: SessionId,
    source: Source,
    classifier: Arc<RegionClassifier>,
    decoder: Arc<dyn AssetDecoder>,
    cache: Arc<AssetCache>,
    scan_cfg: ScanConfig,
    debounce: Duration,
    shared: Arc<Shared>,
}

fn command_loop(ctx: LoopCtx, cmd_rx: Receiver<Cmd>) {
    while let Ok(cmd) = cmd_rx.recv() {
        let Cmd::Request {
            offset,
            id,
            interactive,
        } = cmd
        else {
            break;
        };

        let target = if interactive {
            match absorb_burst(&ctx, &cmd_rx, offset, id) {
                Some(target) => target,
                None => break,
            }
        } else {
            (offset, id)
        };
        ctx.shared.set_state(PreviewState::Idle);

        // Dispatch-time staleness check: if a newer request (including a
        // cache hit) arrived while debouncing, this dispatch never reaches
        // the decoder.
        let (offset, id) = target;
        if id.0 < ctx.shared.latest() {
            continue;
        }
        ctx.shared.set_state(PreviewState::Dispatched);
        let payload = dispatch(&ctx, offset, id);
        ctx.shared.set_state(PreviewState::Idle);

        let Some(payload) = payload else {
            continue;
        };
        // Completion-time staleness check, then the ordered delivery gate.
        if id.0 < ctx.shared.latest() {
            debug!(offset, id = id.0, "preview result superseded mid-decode");
            continue;
        }
        ctx.shared.set_state(PreviewState::Delivering);
        ctx.shared.gate.deliver(PreviewResult {
            session: ctx.session,
            request_id: id,
            offset,
            payload,
        });
        ctx.shared.set_state(PreviewState::Idle);
    }
    ctx.shared.set_state(PreviewState::Idle);
}

/// Debounce loop: absorbs a burst, keeping only its last target.
///
/// Each new interactive request restarts the window; a discrete request
/// ends the burst and dispatches immediately. Returns `None` on shutdown.
fn absorb_burst(
    ctx: &LoopCtx,
    cmd_rx: &Receiver<Cmd>,
    mut offset: u64,
    mut id: RequestId,
) -> Option<(u64, RequestId)> {
    ctx.shared.set_state(PreviewState::Debouncing);
    loop {
        match cmd_rx.recv_timeout(ctx.debounce) {
            Ok(Cmd::Request {
                offset: o,
                id: i,
                interactive,
            }) => {
                offset = o;
                id = i;
                if !interactive {
                    return Some((offset, id));
                }
            }
            Ok(Cmd::Shutdown) => return None,
            Err(RecvTimeoutError::Timeout) => return Some((offset, id)),
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Runs the classifier gate and the decode for one dispatched target.
///
/// Returns `None` when the outcome must not be delivered (`Cancelled`).
fn dispatch(ctx: &LoopCtx, offset: u64, id: RequestId) -> Option<PreviewPayload> {
    let classification = ctx.classifier.classify_at(&ctx.source, offset);
    if classification.likely_empty {
        // Gate skip: cheap "nothing here" without burning a pool slot. Not
        // cached; the cache holds decoder verdicts only.
        return Some(PreviewPayload::NoAsset(DecodeError::NotCompressed));
    }

    let request = DecodeRequest {
        fingerprint: ctx.source.fingerprint(),
        offset,
        max_bytes: ctx.scan_cfg.max_candidate_bytes,
        request_id: id,
    };
    match ctx.decoder.decode(&request) {
        Ok(Err(DecodeError::Cancelled)) => None,
        Ok(verdict) => {
            let key = CacheKey {
                fingerprint: ctx.source.fingerprint(),
                offset,
                params_hash: ctx.scan_cfg.params_hash(),
            };
            ctx.cache.put(key, verdict.clone());
            Some(match verdict {
                Ok(asset) => PreviewPayload::Asset(asset),
                Err(err) => PreviewPayload::NoAsset(err),
            })
        }
        Err(pool_err) => Some(PreviewPayload::Unavailable(pool_err)),
    }
}
