//! Packet-number compression and decompression (section 4.A).
//!
//! Packet numbers are logically 64-bit and monotonically increasing per
//! connection, but only the low 1, 2, or 4 bytes are placed on the wire.
//! The receiver reconstructs the full value from its own expectation of the
//! next packet number.

/// Truncate `full` to its low `width` bytes, big-endian.
pub fn compress(full: u64, width: usize) -> Vec<u8> {
    let bytes = full.to_be_bytes();
    bytes[8 - width..].to_vec()
}

/// Reconstruct a full 64-bit packet number from a `width`-byte wire value
/// and the receiver's expected next packet number.
///
/// The candidate whose low `8*width` bits equal `compressed` and whose
/// distance from `expected` is smallest wins; an exact tie prefers the
/// lower candidate (section 9, open question ii).
pub fn decompress(compressed: u64, width: usize, expected: u64) -> u64 {
    let bits = (width as u32) * 8;
    let span = 1u128 << bits;
    let mask = (span - 1) as u64;
    let truncated = compressed & mask;

    let base = expected & !mask;
    let candidate_mid = base | truncated;

    let mut best = candidate_mid;
    let mut best_dist = distance(candidate_mid, expected);

    if candidate_mid >= span as u64 {
        let lower = candidate_mid - span as u64;
        let d = distance(lower, expected);
        if d < best_dist || (d == best_dist && lower < best) {
            best = lower;
            best_dist = d;
        }
    }

    if let Some(upper) = candidate_mid.checked_add(span as u64) {
        let d = distance(upper, expected);
        if d < best_dist || (d == best_dist && upper < best) {
            best = upper;
        }
    }

    best
}

fn distance(a: u64, b: u64) -> u64 {
    a.abs_diff(b)
}

/// The minimal width (1, 2, or 4 bytes) that can represent `full` such that
/// it decompresses unambiguously against `expected`.
pub fn width_for(full: u64, expected: u64) -> usize {
    for width in [1usize, 2, 4] {
        let bits = (width as u32) * 8;
        let half_span = 1u64 << (bits.saturating_sub(1).min(63));
        if full.abs_diff(expected) < half_span {
            return width;
        }
    }
    4
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::primitives::rand::rand;

    #[test]
    fn round_trips_compress_decompress() {
        let cases: &[(u64, u64, usize)] = &[
            (0, 0, 1),
            (255, 0, 1),
            (65535, 0, 2),
            (1, 0, 1),
            (1_000_000, 999_900, 4),
        ];
        for &(full, expected, width) in cases {
            let compressed_bytes = compress(full, width);
            let mut wire = 0u64;
            for b in &compressed_bytes {
                wire = (wire << 8) | *b as u64;
            }
            let reconstructed = decompress(wire, width, expected);
            assert_eq!(
                reconstructed & ((1u64 << (width as u32 * 8)) - 1),
                full & ((1u64 << (width as u32 * 8)) - 1),
                "low bits must match for width {}",
                width
            );
        }
    }

    #[test]
    fn reconstructs_within_half_span_of_expected() {
        for _ in 0..500 {
            let width = [1usize, 2, 4][rand(3) as usize];
            let expected = ((rand(255) as u64) << 24) | ((rand(255) as u64) << 8) | rand(255) as u64;
            let span = 1u64 << (width as u32 * 8);
            let offset = (rand(255) as u64) % span;
            let full = expected.wrapping_add(offset).wrapping_sub(span / 2);
            let compressed = full & (span - 1);
            let reconstructed = decompress(compressed, width, expected);
            assert_eq!(reconstructed & (span - 1), compressed);
            assert!(reconstructed.abs_diff(expected) <= span / 2);
        }
    }

    #[test]
    fn exact_midpoint_tie_prefers_lower_candidate() {
        // width = 1 byte, span = 256, half span = 128.
        // expected such that both candidates are exactly 128 away.
        let expected: u64 = 128;
        let compressed: u64 = 0; // candidates: 0 and 256, both distance 128.
        let reconstructed = decompress(compressed, 1, expected);
        assert_eq!(reconstructed, 0);
    }
}
