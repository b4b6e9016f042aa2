#![allow(dead_code)]

use kmerdht_core::constants::KMER_LEN;
use kmerdht_core::{KmerHashMap, KmerPair, LocalComm, PackedKmer};

/// Distinct seeds below 2^38 give distinct k-mers.
pub fn kmer(seed: u64) -> PackedKmer {
    let seq: String = (0..KMER_LEN)
        .map(|i| b"ACGT"[((seed >> (2 * (i % 32))) & 3) as usize] as char)
        .collect();
    seq.parse().unwrap()
}

pub fn record(seed: u64) -> KmerPair {
    let ext = b"ACGTF";
    KmerPair::new(
        kmer(seed),
        ext[(seed % 5) as usize],
        ext[((seed / 5) % 5) as usize],
    )
    .unwrap()
}

pub fn unique_job(tag: &str) -> String {
    format!("{tag}_{}", rand::random::<u64>())
}

pub fn solo_table(tag: &str, capacity: usize) -> KmerHashMap {
    KmerHashMap::new(LocalComm::solo(), &unique_job(tag), capacity).unwrap()
}

/// Seeds, starting at `from`, whose k-mer hashes to `home` in `table`.
pub fn seeds_with_home(table: &KmerHashMap, home: usize, from: u64) -> impl Iterator<Item = u64> + '_ {
    (from..).filter(move |&s| table.home_slot(&kmer(s)) == home)
}
