//! Discovery scenario: a mostly-empty ROM with one planted asset.
//!
//! A 4 MiB all-zero blob hides one high-entropy compressed stream at
//! 0x200000. The scan must find exactly that offset, and the classifier
//! must keep the decoder off the zero fill entirely.

use std::sync::Arc;

use spritescan_rs::pool::stub::ScriptedDecoder;
use spritescan_rs::{
    AssetCache, CacheConfig, ClassifierConfig, OffsetScanner, RegionClassifier, ScanConfig,
    ScanEvent, Source,
};

const ROM_LEN: usize = 4 * 1024 * 1024;
const ASSET_OFFSET: u64 = 0x0020_0000;
const REGION_SIZE: usize = 4096;

/// Deterministic xorshift noise standing in for a compressed stream.
fn compressed_looking(len: usize) -> Vec<u8> {
    let mut state = 0x243f_6a88_85a3_08d3u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 33) as u8
        })
        .collect()
}

fn planted_rom() -> Source {
    let mut rom = vec![0u8; ROM_LEN];
    let stream = compressed_looking(REGION_SIZE);
    let at = ASSET_OFFSET as usize;
    rom[at..at + REGION_SIZE].copy_from_slice(&stream);
    Source::from_bytes(rom)
}

fn scanner(decoder: Arc<ScriptedDecoder>) -> OffsetScanner {
    OffsetScanner::new(
        Arc::new(RegionClassifier::new(ClassifierConfig::default())),
        decoder,
        Arc::new(AssetCache::new(&CacheConfig::default())),
        ScanConfig::default(),
    )
}

#[test]
fn scan_finds_exactly_the_planted_asset() {
    let decoder = Arc::new(ScriptedDecoder::new().script_asset(ASSET_OFFSET, 4));
    let scan = scanner(decoder.clone());

    let mut iter = scan.scan(planted_rom(), 0..ROM_LEN as u64);
    let candidates: Vec<_> = iter.by_ref().collect();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].offset, ASSET_OFFSET);
    assert!(candidates[0].score > 0.0);

    let stats = iter.stats();
    // Decode attempts are confined to the one noisy region.
    let region_steps = (REGION_SIZE as u64) / ScanConfig::default().scan_step;
    assert_eq!(stats.decode_attempts, region_steps);
    assert_eq!(decoder.calls(), region_steps);
    // At least 99% of the blob classified likely-empty and was skipped.
    assert!(stats.skipped_empty as f64 >= 0.99 * stats.steps as f64);
    assert_eq!(stats.candidates, 1);
    assert_eq!(stats.bytes_scanned, ROM_LEN as u64);
}

#[test]
fn background_scan_reports_the_same_discovery() {
    let decoder = Arc::new(ScriptedDecoder::new().script_asset(ASSET_OFFSET, 4));
    let scan = scanner(decoder);
    let handle = scan.spawn(planted_rom(), 0..ROM_LEN as u64);

    let mut offsets = Vec::new();
    let mut progress_seen = false;
    let final_stats = loop {
        match handle.events().recv().expect("scan events") {
            ScanEvent::Candidate(c) => offsets.push(c.offset),
            ScanEvent::Progress(p) => {
                progress_seen = true;
                assert!(p.cursor <= p.range_end);
            }
            ScanEvent::Finished(stats) => break stats,
        }
    };
    assert_eq!(offsets, vec![ASSET_OFFSET]);
    assert!(progress_seen, "long scans must report progress");
    assert_eq!(final_stats.candidates, 1);
    handle.join();
}

#[test]
fn rescans_are_served_from_the_cache() {
    let decoder = Arc::new(ScriptedDecoder::new().script_asset(ASSET_OFFSET, 4));
    let classifier = Arc::new(RegionClassifier::new(ClassifierConfig::default()));
    let cache = Arc::new(AssetCache::new(&CacheConfig::default()));
    let scan = OffsetScanner::new(classifier, decoder.clone(), cache, ScanConfig::default());
    let rom = planted_rom();

    let first: Vec<_> = scan.scan(rom.clone(), 0..ROM_LEN as u64).collect();
    let calls_after_first = decoder.calls();
    let second: Vec<_> = scan.scan(rom, 0..ROM_LEN as u64).collect();

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].offset, first[0].offset);
    assert_eq!(
        decoder.calls(),
        calls_after_first,
        "second pass must not re-decode"
    );
}
