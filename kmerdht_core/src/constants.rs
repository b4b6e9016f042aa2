//! Constants and configuration for the distributed k-mer table

pub const PREFIX: &str = "kd"; // short: macOS caps shm names at 31 bytes

pub const FNV_OFFSET: u64 = 0xcbf29ce484222325;
pub const FNV_PRIME: u64 = 0x100000001b3;

pub const CACHE_LINE: usize = 64;

pub const SEGMENT_MAGIC: u64 = 0x4B4D_4552_4448_5431; // "KMERDHT1"
pub const RENDEZVOUS_MAGIC: u64 = 0x4B4D_4552_5244_5631; // "KMERRDV1"
pub const SEGMENT_VERSION: u16 = 1;

/// Number of bases in one k-mer.
#[cfg(not(feature = "long_kmers"))]
pub const KMER_LEN: usize = 19;
#[cfg(feature = "long_kmers")]
pub const KMER_LEN: usize = 51;

/// 2 bits per base, 32 bases per word.
pub const KEY_WORDS: usize = KMER_LEN.div_ceil(32);
/// Key words plus one payload word.
pub const RECORD_WORDS: usize = KEY_WORDS + 1;

/// Occupancy cell states. Transitions are one-way.
pub const SLOT_FREE: u32 = 0;
pub const SLOT_CLAIMED: u32 = 1;

/// Set in the payload word once the record is fully written.
pub const RECORD_SEALED: u64 = 1 << 63;

/// Extension symbol meaning "no neighbour in this direction".
pub const NO_EXTENSION: u8 = b'F';

/// Fixed size of one all-gather contribution in the rendezvous segment.
pub const GATHER_BYTES: usize = 128;
/// Upper bound on a single bootstrap barrier wait.
pub const BOOTSTRAP_TIMEOUT_SECS: u64 = 60;
