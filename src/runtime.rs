//! Top-level context: one object owning the cache, classifier and decoder.
//!
//! There is no ambient global state. A [`PreviewRuntime`] is constructed
//! once per opened source and handed by reference to whoever needs scans or
//! preview sessions; the asset cache inside it is the only state shared
//! between those consumers.
//!
//! Construction is where the pipeline's single fatal condition surfaces:
//! a decoder that can serve neither pooled nor single-shot calls fails
//! `open`, never a later scan.

use std::io;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::api::{Fingerprint, SessionId};
use crate::cache::{AssetCache, CacheMetrics};
use crate::classify::RegionClassifier;
use crate::config::{PoolStats, PreviewConfig, WorkerCommand};
use crate::coordinator::PreviewCoordinator;
use crate::pool::{AssetDecoder, DecoderPool, PoolInitError};
use crate::scan::{OffsetScanner, ScanHandle, ScanIter};
use crate::source::Source;

/// Failure to bring the pipeline up.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("could not open source: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Pool(#[from] PoolInitError),
}

/// Aggregated diagnostics for a front end's status pane.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeStats {
    pub pool: Option<PoolStats>,
    pub cache: CacheMetrics,
    /// Decoder running in single-shot fallback mode.
    pub pool_degraded: bool,
    /// Persistent cache tier latched an I/O failure.
    pub cache_degraded: bool,
}

/// Explicitly composed pipeline context (no service lookup, no singletons).
pub struct PreviewRuntime {
    cfg: PreviewConfig,
    source: Source,
    cache: Arc<AssetCache>,
    classifier: Arc<RegionClassifier>,
    decoder: Arc<dyn AssetDecoder>,
    /// Kept separately for stats and mode reporting when process-backed.
    pool: Option<Arc<DecoderPool>>,
    next_session: AtomicU32,
}

impl PreviewRuntime {
    /// Opens a source file and brings up the process-backed decoder.
    pub fn open(
        path: &Path,
        worker_cmd: WorkerCommand,
        cfg: PreviewConfig,
    ) -> Result<Self, RuntimeError> {
        cfg.assert_valid();
        let source = Source::open(path)?;
        let pool = Arc::new(DecoderPool::new(
            cfg.pool.clone(),
            worker_cmd,
            path.to_path_buf(),
        )?);
        info!(
            source = %path.display(),
            len = source.len(),
            degraded = pool.is_degraded(),
            "preview runtime up"
        );
        let decoder: Arc<dyn AssetDecoder> = pool.clone();
        Ok(Self::assemble(cfg, source, decoder, Some(pool)))
    }

    /// Builds a runtime around an injected decoder (tests, embedded use).
    pub fn with_decoder(
        source: Source,
        decoder: Arc<dyn AssetDecoder>,
        cfg: PreviewConfig,
    ) -> Self {
        cfg.assert_valid();
        Self::assemble(cfg, source, decoder, None)
    }

    fn assemble(
        cfg: PreviewConfig,
        source: Source,
        decoder: Arc<dyn AssetDecoder>,
        pool: Option<Arc<DecoderPool>>,
    ) -> Self {
        let cache = Arc::new(AssetCache::new(&cfg.cache));
        let classifier = Arc::new(RegionClassifier::new(cfg.classifier.clone()));
        Self {
            cfg,
            source,
            cache,
            classifier,
            decoder,
            pool,
            next_session: AtomicU32::new(0),
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    /// True when decodes run in single-shot fallback mode.
    pub fn is_degraded(&self) -> bool {
        self.pool.as_ref().is_some_and(|p| p.is_degraded())
    }

    /// Opens a new preview session with its own coordinator.
    pub fn session(&self) -> PreviewCoordinator {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        PreviewCoordinator::new(
            id,
            self.source.clone(),
            self.classifier.clone(),
            self.decoder.clone(),
            self.cache.clone(),
            self.cfg.scan.clone(),
            self.cfg.coordinator.clone(),
        )
    }

    fn scanner(&self) -> OffsetScanner {
        OffsetScanner::new(
            self.classifier.clone(),
            self.decoder.clone(),
            self.cache.clone(),
            self.cfg.scan.clone(),
        )
    }

    /// Lazy foreground scan over `range`.
    pub fn scan(&self, range: Range<u64>) -> ScanIter {
        self.scanner().scan(self.source.clone(), range)
    }

    /// Foreground scan resumed from a saved cursor.
    pub fn resume_scan(&self, range: Range<u64>, cursor: u64) -> ScanIter {
        self.scanner().resume(self.source.clone(), range, Some(cursor))
    }

    /// Background scan reporting over the returned handle's channel.
    pub fn start_scan(&self, range: Range<u64>) -> ScanHandle {
        self.scanner().spawn(self.source.clone(), range)
    }

    /// Drops all cached work for one source from both cache tiers.
    pub fn invalidate_source(&self, fingerprint: Fingerprint) {
        self.cache.invalidate_source(fingerprint);
        self.classifier.invalidate_source(fingerprint);
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            pool: self.pool.as_ref().map(|p| p.stats()),
            cache: self.cache.metrics(),
            pool_degraded: self.is_degraded(),
            cache_degraded: self.cache.is_persistent_degraded(),
        }
    }

    /// Graceful teardown of the worker pool; idempotent, also runs on drop.
    pub fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CacheStatus, PreviewPayload};
    use crate::pool::stub::ScriptedDecoder;
    use std::time::Duration;

    fn noisy(len: usize) -> Vec<u8> {
        let mut state = 0x0fed_cba9_8765_4321u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 40) as u8
            })
            .collect()
    }

    #[test]
    fn open_fails_fast_without_a_decoder() {
        let dir = std::env::temp_dir();
        let rom = dir.join(format!("spritescan_runtime_{}", std::process::id()));
        std::fs::write(&rom, noisy(4096)).unwrap();
        let got = PreviewRuntime::open(
            &rom,
            WorkerCommand {
                program: "/nonexistent/decoder-binary".into(),
                args: vec![],
            },
            PreviewConfig {
                pool: crate::config::PoolConfig {
                    decode_timeout: Duration::from_millis(50),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        assert!(matches!(got, Err(RuntimeError::Pool(_))));
        std::fs::remove_file(&rom).unwrap();
    }

    #[test]
    fn scan_results_warm_the_preview_path() {
        let decoder = Arc::new(ScriptedDecoder::new().script_asset(2048, 2));
        let runtime = PreviewRuntime::with_decoder(
            Source::from_bytes(noisy(8 * 1024)),
            decoder.clone(),
            PreviewConfig::default(),
        );

        let candidates: Vec<_> = runtime.scan(0..8 * 1024).collect();
        assert_eq!(candidates.len(), 1);

        // The scanner populated the cache: the preview is a synchronous hit.
        let session = runtime.session();
        assert_eq!(session.request_preview(2048, false), CacheStatus::Hit);
        let result = session
            .results()
            .recv_timeout(Duration::from_millis(100))
            .unwrap();
        assert!(matches!(result.payload, PreviewPayload::Asset(_)));
    }

    #[test]
    fn sessions_get_distinct_ids() {
        let runtime = PreviewRuntime::with_decoder(
            Source::from_bytes(noisy(4096)),
            Arc::new(ScriptedDecoder::new()),
            PreviewConfig::default(),
        );
        let a = runtime.session();
        let b = runtime.session();
        assert_ne!(a.session(), b.session());
    }
}
