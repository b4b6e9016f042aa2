//! Helper functions for hashing, layout and base packing

use crate::constants::{FNV_OFFSET, FNV_PRIME};

/// FNV-1a over raw bytes. Stable across processes and builds, which the
/// slot mapping relies on.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[inline]
pub fn fnv1a_str(s: &str) -> u64 {
    fnv1a_64(s.as_bytes())
}

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// 2-bit code of a nucleotide.
#[inline]
pub fn encode_base(b: u8) -> Option<u64> {
    match b {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

#[inline]
pub fn decode_base(code: u64) -> u8 {
    match code & 0b11 {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        _ => b'T',
    }
}

#[inline]
pub fn is_extension(b: u8) -> bool {
    matches!(b, b'A' | b'C' | b'G' | b'T' | crate::constants::NO_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a_str("foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn bases_round_trip() {
        for b in [b'A', b'C', b'G', b'T'] {
            assert_eq!(decode_base(encode_base(b).unwrap()), b);
        }
        assert!(encode_base(b'N').is_none());
        assert!(encode_base(b'a').is_none());
    }
}
