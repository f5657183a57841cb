//! Approximate distinct counting.
//!
//! A slot's 384 bytes are treated as one bitmap: the top bits of a value's
//! hash pick a word, the next bits pick a bit. The estimate is linear
//! counting over the bitmap; merging sketches is a bitwise OR.

use vex_types::{bytes, LANE_COUNT};

use crate::consts::AGG_SLOT_SIZE;

/// Words in a sketch slot.
const WORDS: usize = AGG_SLOT_SIZE / 8;
/// Bits in a sketch slot.
const BITS: usize = WORDS * 64;

/// Observe masked lane hashes.
pub fn update(slot: &mut [u8], hashes: &[u128; LANE_COUNT], mask: u16) {
    for lane in 0..LANE_COUNT {
        if mask & (1 << lane) == 0 {
            continue;
        }
        let h = hashes[lane];
        let word = ((h >> 70) as usize) % WORDS;
        let bit = (h >> 64) as u32 & 63;
        let at = word * 8;
        let cur = bytes::u64_le(slot, at);
        bytes::put_u64_le(slot, at, cur | 1 << bit);
    }
}

/// OR another sketch into this one.
pub fn merge(dst: &mut [u8], src: &[u8]) {
    for word in 0..WORDS {
        let at = word * 8;
        let merged = bytes::u64_le(dst, at) | bytes::u64_le(src, at);
        bytes::put_u64_le(dst, at, merged);
    }
}

/// Linear-counting estimate of the number of distinct values observed.
pub fn estimate(slot: &[u8]) -> u64 {
    let set: u32 = (0..WORDS)
        .map(|w| bytes::u64_le(slot, w * 8).count_ones())
        .sum();
    let zeros = (BITS as u32 - set) as f64;
    if zeros <= 0.0 {
        return BITS as u64;
    }
    let m = BITS as f64;
    (m * (m / zeros).ln()).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(i: u64) -> u128 {
        let x = (i as u128).wrapping_mul(0x9e37_79b9_7f4a_7c15_f39c_c060_5ced_c835);
        x ^ (x >> 61)
    }

    #[test]
    fn empty_sketch_estimates_zero() {
        let slot = [0u8; AGG_SLOT_SIZE];
        assert_eq!(estimate(&slot), 0);
    }

    #[test]
    fn small_cardinalities_are_near_exact() {
        let mut slot = [0u8; AGG_SLOT_SIZE];
        for i in 0..20u64 {
            let mut hashes = [0u128; LANE_COUNT];
            hashes[0] = hash_of(i);
            update(&mut slot, &hashes, 1);
        }
        let est = estimate(&slot);
        assert!((15..=25).contains(&est), "estimate {est}");
    }

    #[test]
    fn duplicates_do_not_inflate() {
        let mut slot = [0u8; AGG_SLOT_SIZE];
        for _ in 0..1000 {
            let mut hashes = [0u128; LANE_COUNT];
            hashes[0] = hash_of(7);
            update(&mut slot, &hashes, 1);
        }
        assert_eq!(estimate(&slot), 1);
    }

    #[test]
    fn merge_is_union() {
        let mut a = [0u8; AGG_SLOT_SIZE];
        let mut b = [0u8; AGG_SLOT_SIZE];
        for i in 0..50u64 {
            let mut hashes = [0u128; LANE_COUNT];
            hashes[0] = hash_of(i);
            update(&mut a, &hashes, 1);
            hashes[0] = hash_of(i + 25);
            update(&mut b, &hashes, 1);
        }
        let solo = estimate(&a);
        merge(&mut a, &b);
        let merged = estimate(&a);
        assert!(merged > solo);
        // Idempotent: merging with itself changes nothing.
        let before = a.to_vec();
        let copy = a.to_vec();
        merge(&mut a, &copy);
        assert_eq!(a.to_vec(), before);
    }
}
