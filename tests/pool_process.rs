//! End-to-end decoder pool tests against real worker processes.
//!
//! This binary doubles as the worker: when invoked with `--worker` it speaks
//! the pipe protocol over stdin/stdout, so the pool under test drives the
//! exact framing production workers use. The simulated decoder recognizes
//! sentinels planted in the test ROM:
//!
//! - `SPRT <n>`: decode `n` textured tiles.
//! - `SLOW`: hang past any reasonable deadline (timeout path).
//! - `BUSY`: decode slowly but within deadline (backpressure path).
//! - `DIE!`: exit without replying (broken-pipe path).
//! - anything else: `NotCompressed`.
//!
//! `--one-shot` makes the worker exit after a single reply, which fails the
//! pooled two-call probe and exercises the single-shot fallback mode.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spritescan_rs::pool::protocol::{
    read_request, write_response_err, write_response_ok,
};
use spritescan_rs::{
    AssetDecoder, DecodeError, DecodeRequest, DecoderPool, Fingerprint, PoolConfig, PoolError,
    RequestId, WorkerCommand, TILE_PIXEL_BYTES,
};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--worker") {
        worker_main(&args);
        return;
    }

    pooled_round_trip();
    timeout_recycles_the_worker();
    broken_pipe_is_contained();
    backpressure_sheds_queue_overflow();
    one_shot_worker_degrades_to_fallback();
    graceful_shutdown_leaves_no_worker();
    println!("pool_process: all scenarios passed");
}

// --------------------------
// Worker side
// --------------------------

fn worker_main(args: &[String]) {
    let one_shot = args.iter().any(|a| a == "--one-shot");
    // The pool appends the source path as the final argument.
    let source_path = args.last().expect("worker needs a source path");
    let rom = std::fs::read(source_path).unwrap_or_default();

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    while let Ok(Some((offset, max_bytes))) = read_request(&mut input) {
        if max_bytes == 0 {
            // Health probe.
            write_response_ok(&mut output, 0, 0, &[]).expect("probe reply");
        } else {
            respond(&mut output, &rom, offset);
        }
        if one_shot {
            return;
        }
    }
}

fn respond<W: Write>(output: &mut W, rom: &[u8], offset: u64) {
    let window = rom.get(offset as usize..).unwrap_or(&[]);
    if window.starts_with(b"SLOW") {
        thread::sleep(Duration::from_secs(30));
        let _ = write_response_err(output, DecodeError::NotCompressed);
    } else if window.starts_with(b"BUSY") {
        thread::sleep(Duration::from_millis(100));
        let _ = write_response_err(output, DecodeError::NotCompressed);
    } else if window.starts_with(b"DIE!") {
        std::process::exit(3);
    } else if window.starts_with(b"SPRT") && window.len() > 4 {
        let tiles = u32::from(window[4].clamp(1, 8));
        let pixels: Vec<u8> = (0..tiles as usize * TILE_PIXEL_BYTES)
            .map(|i| ((i * 7 + i / 8) % 16) as u8)
            .collect();
        write_response_ok(output, tiles, 5 + tiles * 20, &pixels).expect("asset reply");
    } else {
        write_response_err(output, DecodeError::NotCompressed).expect("error reply");
    }
}

// --------------------------
// Test-side helpers
// --------------------------

struct Fixture {
    pool: DecoderPool,
    _rom: tempfile::NamedTempFile,
}

fn rom_with_sentinels() -> tempfile::NamedTempFile {
    let mut rom = vec![0u8; 64 * 1024];
    rom[1024..1029].copy_from_slice(b"SPRT\x02");
    rom[2048..2052].copy_from_slice(b"SLOW");
    rom[3072..3076].copy_from_slice(b"BUSY");
    rom[4096..4100].copy_from_slice(b"DIE!");
    let mut file = tempfile::NamedTempFile::new().expect("temp rom");
    file.write_all(&rom).expect("write rom");
    file.flush().expect("flush rom");
    file
}

fn worker_command(one_shot: bool) -> WorkerCommand {
    let mut args = vec!["--worker".to_string()];
    if one_shot {
        args.push("--one-shot".to_string());
    }
    WorkerCommand {
        program: std::env::current_exe().expect("own path"),
        args,
    }
}

fn fixture(cfg: PoolConfig, one_shot: bool) -> Fixture {
    let rom = rom_with_sentinels();
    let pool = DecoderPool::new(cfg, worker_command(one_shot), rom.path().to_path_buf())
        .expect("pool must come up");
    Fixture { pool, _rom: rom }
}

fn request(offset: u64) -> DecodeRequest {
    DecodeRequest {
        fingerprint: Fingerprint([0; 32]),
        offset,
        max_bytes: 4096,
        request_id: RequestId(1),
    }
}

fn small_pool(timeout_ms: u64) -> PoolConfig {
    PoolConfig {
        pool_size: 1,
        queue_cap: 2,
        decode_timeout: Duration::from_millis(timeout_ms),
    }
}

// --------------------------
// Scenarios
// --------------------------

fn pooled_round_trip() {
    let fx = fixture(small_pool(1000), false);
    assert!(!fx.pool.is_degraded(), "probe must select pooled mode");

    let asset = fx
        .pool
        .decode(&request(1024))
        .expect("dispatch ok")
        .expect("asset decodes");
    assert_eq!(asset.tile_count, 2);
    assert_eq!(asset.pixels.len(), 2 * TILE_PIXEL_BYTES);
    assert!(asset.quality > 0.0);

    // Determinism across calls on the same worker.
    let again = fx.pool.decode(&request(1024)).unwrap().unwrap();
    assert_eq!(again.pixels, asset.pixels);
    assert_eq!(again.quality, asset.quality);

    let empty = fx.pool.decode(&request(0)).expect("dispatch ok");
    assert!(matches!(empty, Err(DecodeError::NotCompressed)));
    println!("  pooled_round_trip ok");
}

fn timeout_recycles_the_worker() {
    let timeout = Duration::from_millis(200);
    let fx = fixture(small_pool(200), false);

    let started = Instant::now();
    let verdict = fx.pool.decode(&request(2048)).expect("dispatch ok");
    let elapsed = started.elapsed();
    assert!(matches!(verdict, Err(DecodeError::Timeout)));
    assert!(
        elapsed < timeout + Duration::from_millis(500),
        "timeout resolved in {elapsed:?}"
    );

    // A fresh worker serves the next request.
    let asset = fx.pool.decode(&request(1024)).unwrap().unwrap();
    assert_eq!(asset.tile_count, 2);

    let stats = fx.pool.stats();
    assert!(stats.timeouts >= 1, "stats: {stats:?}");
    assert!(stats.respawns >= 1, "stats: {stats:?}");
    println!("  timeout_recycles_the_worker ok");
}

fn broken_pipe_is_contained() {
    let fx = fixture(small_pool(1000), false);
    let verdict = fx.pool.decode(&request(4096)).expect("dispatch ok");
    assert!(matches!(
        verdict,
        Err(DecodeError::DecoderFault) | Err(DecodeError::Timeout)
    ));
    // Contained: the pool still works.
    let asset = fx.pool.decode(&request(1024)).unwrap().unwrap();
    assert_eq!(asset.tile_count, 2);
    println!("  broken_pipe_is_contained ok");
}

fn backpressure_sheds_queue_overflow() {
    // One slow slot, queue depth 2, eight concurrent callers: the excess
    // must shed as QueueFull, not pile up.
    let fx = Arc::new(fixture(small_pool(2000), false));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let fx = fx.clone();
        handles.push(thread::spawn(move || fx.pool.decode(&request(3072))));
    }
    let mut shed = 0;
    let mut served = 0;
    for handle in handles {
        match handle.join().expect("caller thread") {
            Err(PoolError::QueueFull) => shed += 1,
            Ok(_) => served += 1,
            Err(other) => panic!("unexpected pool error: {other:?}"),
        }
    }
    assert!(served >= 1, "some requests must be served");
    assert!(shed >= 1, "overflow must shed as QueueFull");
    assert!(fx.pool.stats().shed >= shed as u64);
    println!("  backpressure_sheds_queue_overflow (served={served}, shed={shed}) ok");
}

fn one_shot_worker_degrades_to_fallback() {
    let fx = fixture(small_pool(1000), true);
    assert!(
        fx.pool.is_degraded(),
        "a one-shot worker cannot pass the pooled probe"
    );
    // Same correctness, one process per call.
    let asset = fx.pool.decode(&request(1024)).unwrap().unwrap();
    assert_eq!(asset.tile_count, 2);
    let again = fx.pool.decode(&request(1024)).unwrap().unwrap();
    assert_eq!(again.pixels, asset.pixels);
    assert!(fx.pool.stats().fallback_calls >= 2);
    println!("  one_shot_worker_degrades_to_fallback ok");
}

fn graceful_shutdown_leaves_no_worker() {
    let fx = fixture(small_pool(1000), false);
    let asset = fx.pool.decode(&request(1024)).unwrap().unwrap();
    assert_eq!(asset.tile_count, 2);
    fx.pool.shutdown();
    // After shutdown, dispatch reports unavailability instead of hanging.
    let verdict = fx.pool.decode(&request(1024));
    assert!(matches!(verdict, Err(PoolError::WorkerUnavailable)));
    println!("  graceful_shutdown_leaves_no_worker ok");
}
