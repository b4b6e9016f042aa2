//! Fixed-size k-mer keys and the records stored in the table.

use crate::constants::{KEY_WORDS, KMER_LEN, NO_EXTENSION, RECORD_SEALED, RECORD_WORDS};
use crate::errors::Error;
use crate::helpers::{decode_base, encode_base, fnv1a_64, is_extension};
use std::fmt;
use std::str::FromStr;

/// A k-mer packed 2 bits per base, base `i` at word `i / 32`, bit `2 * (i % 32)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackedKmer {
    words: [u64; KEY_WORDS],
}

impl PackedKmer {
    pub fn from_bytes(seq: &[u8]) -> Result<Self, Error> {
        if seq.len() != KMER_LEN {
            return Err(Error::InvalidKmer("wrong length"));
        }
        let mut words = [0u64; KEY_WORDS];
        for (i, &b) in seq.iter().enumerate() {
            let code = encode_base(b).ok_or(Error::InvalidKmer("symbol outside ACGT"))?;
            words[i / 32] |= code << (2 * (i % 32));
        }
        Ok(Self { words })
    }

    #[inline]
    pub(crate) fn from_words(words: [u64; KEY_WORDS]) -> Self {
        Self { words }
    }

    #[inline]
    pub fn words(&self) -> &[u64; KEY_WORDS] {
        &self.words
    }

    /// Base at position `i` as an ASCII byte.
    pub fn base(&self, i: usize) -> u8 {
        assert!(i < KMER_LEN, "base index {i} out of range");
        decode_base(self.words[i / 32] >> (2 * (i % 32)))
    }

    /// Hash used to pick the home slot. Identical on every rank.
    pub fn slot_hash(&self) -> u64 {
        let mut bytes = [0u8; KEY_WORDS * 8];
        for (chunk, w) in bytes.chunks_exact_mut(8).zip(self.words.iter()) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        fnv1a_64(&bytes)
    }
}

impl FromStr for PackedKmer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Display for PackedKmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seq: String = (0..KMER_LEN).map(|i| self.base(i) as char).collect();
        f.write_str(&seq)
    }
}

impl fmt::Debug for PackedKmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackedKmer({self})")
    }
}

/// One table record: a k-mer and its backward/forward extension symbols.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KmerPair {
    pub kmer: PackedKmer,
    pub backward: u8,
    pub forward: u8,
}

impl KmerPair {
    pub fn new(kmer: PackedKmer, backward: u8, forward: u8) -> Result<Self, Error> {
        if !is_extension(backward) || !is_extension(forward) {
            return Err(Error::InvalidKmer("extension outside ACGTF"));
        }
        Ok(Self {
            kmer,
            backward,
            forward,
        })
    }

    #[inline]
    pub fn key(&self) -> &PackedKmer {
        &self.kmer
    }

    pub fn has_backward(&self) -> bool {
        self.backward != NO_EXTENSION
    }

    pub fn has_forward(&self) -> bool {
        self.forward != NO_EXTENSION
    }

    /// Key words followed by the sealed payload word.
    pub(crate) fn to_words(&self) -> [u64; RECORD_WORDS] {
        let mut out = [0u64; RECORD_WORDS];
        out[..KEY_WORDS].copy_from_slice(&self.kmer.words);
        out[KEY_WORDS] = RECORD_SEALED | (self.forward as u64) << 8 | self.backward as u64;
        out
    }

    /// Inverse of `to_words`; `None` when the payload word is not sealed yet.
    pub(crate) fn from_words(key: [u64; KEY_WORDS], payload: u64) -> Option<Self> {
        if payload & RECORD_SEALED == 0 {
            return None;
        }
        Some(Self {
            kmer: PackedKmer::from_words(key),
            backward: payload as u8,
            forward: (payload >> 8) as u8,
        })
    }
}

/// `"<kmer> <backward><forward>"`, e.g. `"ACGT...A FC"`.
impl FromStr for KmerPair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let kmer = parts
            .next()
            .ok_or(Error::InvalidKmer("empty record"))?
            .parse::<PackedKmer>()?;
        let ext = parts
            .next()
            .ok_or(Error::InvalidKmer("missing extensions"))?
            .as_bytes();
        if ext.len() != 2 || parts.next().is_some() {
            return Err(Error::InvalidKmer("extensions must be two symbols"));
        }
        Self::new(kmer, ext[0], ext[1])
    }
}

impl fmt::Display for KmerPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}",
            self.kmer, self.backward as char, self.forward as char
        )
    }
}
