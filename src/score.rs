//! Deterministic plausibility scoring for decoded tile data.
//!
//! The decoder will happily inflate garbage into pixels; the score separates
//! "decoded" from "looks like an asset". It is a pure function of the pixel
//! bytes, so identical decodes always score identically and cached verdicts
//! stay reproducible.
//!
//! Three signals, combined with fixed weights:
//! - **Non-degenerate tile fraction** (weight 0.5): a tile whose 64 pixels
//!   are all one value carries no image content. Sprites have some flat
//!   tiles (transparent borders), garbage decodes are often mostly flat.
//! - **Color diversity** (weight 0.3): mean per-tile distinct values,
//!   saturating at [`DIVERSITY_SATURATION`]. Real sprite tiles use a handful
//!   of palette indices; single-color noise uses one.
//! - **Row variation** (weight 0.2): fraction of adjacent row pairs that
//!   differ. Vertically smeared output (a common mis-decode shape) repeats
//!   rows wholesale.
//!
//! Thresholds live in `config` (`min_score`, default 0.35): a fully flat
//! decode scores 0.0, plain noise lands mid-range, and structured
//! multi-color tiles score above 0.6.

use crate::api::TILE_PIXEL_BYTES;

/// Tile edge length in pixels.
const TILE_EDGE: usize = 8;
/// Distinct values per tile at which the diversity signal saturates.
const DIVERSITY_SATURATION: usize = 16;

const WEIGHT_NON_DEGENERATE: f32 = 0.5;
const WEIGHT_DIVERSITY: f32 = 0.3;
const WEIGHT_ROW_VARIATION: f32 = 0.2;

/// Scores a decoded pixel buffer in `[0.0, 1.0]`.
///
/// `pixels` must hold whole tiles (`TILE_PIXEL_BYTES` each); a partial
/// trailing tile is a decoder protocol violation and is asserted against.
/// An empty buffer scores 0.0.
pub fn score_tiles(pixels: &[u8]) -> f32 {
    assert!(
        pixels.len() % TILE_PIXEL_BYTES == 0,
        "pixel buffer is not whole tiles"
    );
    let tile_count = pixels.len() / TILE_PIXEL_BYTES;
    if tile_count == 0 {
        return 0.0;
    }

    let mut non_degenerate = 0usize;
    let mut diversity_sum = 0.0f32;
    let mut varied_rows = 0usize;
    let mut row_pairs = 0usize;

    for tile in pixels.chunks_exact(TILE_PIXEL_BYTES) {
        let mut seen = [false; 256];
        let mut distinct = 0usize;
        for &px in tile {
            if !seen[px as usize] {
                seen[px as usize] = true;
                distinct += 1;
            }
        }
        if distinct > 1 {
            non_degenerate += 1;
        }
        diversity_sum += distinct.min(DIVERSITY_SATURATION) as f32 / DIVERSITY_SATURATION as f32;

        for row in 1..TILE_EDGE {
            let prev = &tile[(row - 1) * TILE_EDGE..row * TILE_EDGE];
            let cur = &tile[row * TILE_EDGE..(row + 1) * TILE_EDGE];
            row_pairs += 1;
            if prev != cur {
                varied_rows += 1;
            }
        }
    }

    let non_degenerate_frac = non_degenerate as f32 / tile_count as f32;
    let diversity = diversity_sum / tile_count as f32;
    let row_variation = if row_pairs == 0 {
        0.0
    } else {
        varied_rows as f32 / row_pairs as f32
    };

    let score = WEIGHT_NON_DEGENERATE * non_degenerate_frac
        + WEIGHT_DIVERSITY * diversity
        + WEIGHT_ROW_VARIATION * row_variation;
    score.clamp(0.0, 1.0)
}
