//! Data structures shared by the segment layer and the table handle

use crate::comm::Communicator;
use crate::partition::{Partition, PartitionPlan};
use crate::segment::Segment;
use std::sync::atomic::AtomicU64;

/// Segment header (aligned to cache line). Lives at offset 0 of every
/// rank's shared-memory segment.
#[repr(C, align(64))]
pub struct SegmentHeader {
    pub magic: AtomicU64,     // stored last by the creator, Release
    pub version: u16,         // layout version
    pub _reserved: [u8; 6],   // padding to 16 bytes total
    pub rank: u32,            // owning rank
    pub num_ranks: u32,       // ranks in the table
    pub global_capacity: u64, // slots across all ranks
    pub base: u64,            // first global slot of this partition
    pub slots: u64,           // slots in this partition
    pub record_words: u32,    // u64 words per record cell
    pub _pad: u32,
}

/// Handle to one rank's view of the distributed table.
///
/// Holds a mapping of every rank's segment, indexed by rank; the entry at
/// `rank` is the segment this process created and owns.
pub struct KmerHashMap {
    pub(crate) comm: Box<dyn Communicator>,
    pub(crate) plan: PartitionPlan,
    pub(crate) partition: Partition,
    pub(crate) rank: usize,
    pub(crate) segments: Vec<Segment>,
}
