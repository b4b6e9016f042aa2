//! Per-rank shared slot arrays.
//!
//! Each rank creates one named shared-memory segment holding its partition:
//!
//! ```text
//! +---------------+-------------------------+---------------------------------+
//! | SegmentHeader | occupancy: [AtomicU32]  | records: [[AtomicU64; RECORD_WORDS]] |
//! +---------------+-------------------------+---------------------------------+
//! ```
//!
//! Both arrays start on a cache line. Every other rank maps the same segment
//! by name and operates on it directly, which is what makes the occupancy and
//! record operations one-sided.

use crate::constants::{CACHE_LINE, GATHER_BYTES, RECORD_WORDS, SEGMENT_MAGIC, SEGMENT_VERSION};
use crate::errors::Error;
use crate::helpers::align_up;
use crate::partition::PartitionPlan;
use crate::platform::platform_drop;
use crate::types::SegmentHeader;
use log::{debug, warn};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::{
    mem::size_of,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

// ===== Compile-time layout checks =====
pub(crate) const HEADER_PADDED: usize = align_up(size_of::<SegmentHeader>(), CACHE_LINE);
const _: () = assert!(std::mem::align_of::<SegmentHeader>() == CACHE_LINE);
const _: () = assert!(HEADER_PADDED % CACHE_LINE == 0);

pub type RecordWords = [AtomicU64; RECORD_WORDS];

#[inline]
pub(crate) const fn records_offset(slots: usize) -> usize {
    align_up(HEADER_PADDED + slots * size_of::<AtomicU32>(), CACHE_LINE)
}

#[inline]
pub(crate) const fn region_size(slots: usize) -> usize {
    records_offset(slots) + slots * size_of::<RecordWords>()
}

/// What a rank broadcasts so peers can map its segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub rank: usize,
    pub slots: usize,
    pub os_id: String,
}

const DESC_FIXED: usize = 4 + 8 + 1;

impl SegmentDescriptor {
    /// `rank: u32 LE | slots: u64 LE | len: u8 | os_id`, zero padded.
    pub fn to_bytes(&self) -> Result<[u8; GATHER_BYTES], Error> {
        let id = self.os_id.as_bytes();
        if id.len() > GATHER_BYTES - DESC_FIXED {
            return Err(Error::Bootstrap(format!("segment name too long: {}", self.os_id)));
        }
        let mut out = [0u8; GATHER_BYTES];
        out[0..4].copy_from_slice(&(self.rank as u32).to_le_bytes());
        out[4..12].copy_from_slice(&(self.slots as u64).to_le_bytes());
        out[12] = id.len() as u8;
        out[DESC_FIXED..DESC_FIXED + id.len()].copy_from_slice(id);
        Ok(out)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, Error> {
        let malformed = || Error::Bootstrap("malformed segment descriptor".into());
        if raw.len() < DESC_FIXED {
            return Err(malformed());
        }
        let rank = u32::from_le_bytes(raw[0..4].try_into().map_err(|_| malformed())?) as usize;
        let slots = u64::from_le_bytes(raw[4..12].try_into().map_err(|_| malformed())?) as usize;
        let len = raw[12] as usize;
        let id = raw.get(DESC_FIXED..DESC_FIXED + len).ok_or_else(malformed)?;
        let os_id = std::str::from_utf8(id).map_err(|_| malformed())?.to_owned();
        Ok(Self { rank, slots, os_id })
    }
}

/// A mapped rank segment, either created by this process or opened as a peer.
pub struct Segment {
    shmem: Shmem,
    hdr: NonNull<SegmentHeader>,
    occupancy: NonNull<AtomicU32>,
    records: NonNull<RecordWords>,
    rank: usize,
    slots: usize,
}

// SAFETY: the pointers target the shared mapping owned by `shmem`, which
// lives as long as the Segment. All access to the arrays goes through
// atomics.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create this rank's segment. On unix a leftover segment with the same
    /// name (from a crashed run) is unlinked and replaced. Windows mappings
    /// have no name to unlink; a live one there fails with `MappingIdExists`.
    pub fn create(os_id: &str, rank: usize, plan: &PartitionPlan) -> Result<Self, Error> {
        let part = plan.partition(rank)?;
        let size = region_size(part.size);
        let conf = || ShmemConf::new().os_id(os_id).size(size);
        let shmem = match conf().create() {
            Ok(m) => m,
            Err(ShmemError::MappingIdExists) if cfg!(unix) => {
                warn!("[SEGMENT] stale segment {os_id} found, replacing it");
                platform_drop(os_id)?;
                conf().create()?
            }
            Err(e) => return Err(e.into()),
        };

        let base = shmem.as_ptr();
        let hdr_ptr = base as *mut SegmentHeader;
        let hdr = NonNull::new(hdr_ptr).ok_or(Error::Shmem(ShmemError::MapCreateFailed(0)))?;
        // fresh mappings are zero-filled: every slot starts free
        unsafe {
            core::ptr::write(
                hdr_ptr,
                SegmentHeader {
                    magic: AtomicU64::new(0),
                    version: SEGMENT_VERSION,
                    _reserved: [0; 6],
                    rank: rank as u32,
                    num_ranks: plan.num_ranks() as u32,
                    global_capacity: plan.global_capacity() as u64,
                    base: part.base as u64,
                    slots: part.size as u64,
                    record_words: RECORD_WORDS as u32,
                    _pad: 0,
                },
            );
            (*hdr_ptr).magic.store(SEGMENT_MAGIC, Ordering::Release);
        }
        debug!(
            "[SEGMENT] created {os_id}: rank={rank} base={} slots={} bytes={size}",
            part.base, part.size
        );
        Self::from_mapping(shmem, hdr, rank, part.size)
    }

    /// Map a peer's segment and check that it agrees with `plan`.
    pub fn open(desc: &SegmentDescriptor, plan: &PartitionPlan) -> Result<Self, Error> {
        let rank = desc.rank;
        let expected = plan.partition(rank)?;
        let mismatch = |reason| Error::SegmentMismatch { rank, reason };
        if desc.slots != expected.size {
            return Err(mismatch("descriptor slot count"));
        }
        let shmem = ShmemConf::new().os_id(&desc.os_id).open()?;
        if shmem.len() < region_size(expected.size) {
            return Err(mismatch("mapping too small"));
        }
        let hdr = NonNull::new(shmem.as_ptr() as *mut SegmentHeader)
            .ok_or(Error::Shmem(ShmemError::MapOpenFailed(0)))?;
        let h = unsafe { hdr.as_ref() };
        if h.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            return Err(mismatch("bad magic"));
        }
        if h.version != SEGMENT_VERSION || h.record_words as usize != RECORD_WORDS {
            return Err(mismatch("layout version"));
        }
        if h.rank as usize != rank
            || h.num_ranks as usize != plan.num_ranks()
            || h.global_capacity as usize != plan.global_capacity()
            || h.base as usize != expected.base
            || h.slots as usize != expected.size
        {
            return Err(mismatch("partition geometry"));
        }
        debug!("[SEGMENT] opened {} for rank {rank}", desc.os_id);
        Self::from_mapping(shmem, hdr, rank, expected.size)
    }

    fn from_mapping(
        shmem: Shmem,
        hdr: NonNull<SegmentHeader>,
        rank: usize,
        slots: usize,
    ) -> Result<Self, Error> {
        let base = shmem.as_ptr();
        let (occupancy, records) = unsafe {
            (
                NonNull::new(base.add(HEADER_PADDED) as *mut AtomicU32),
                NonNull::new(base.add(records_offset(slots)) as *mut RecordWords),
            )
        };
        match (occupancy, records) {
            (Some(occupancy), Some(records)) => Ok(Self {
                shmem,
                hdr,
                occupancy,
                records,
                rank,
                slots,
            }),
            _ => Err(Error::Shmem(ShmemError::MapOpenFailed(0))),
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Slots in this partition.
    #[inline]
    pub fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }

    /// True for the segment this process created.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    pub fn header(&self) -> &SegmentHeader {
        unsafe { self.hdr.as_ref() }
    }

    pub fn descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor {
            rank: self.rank,
            slots: self.slots,
            os_id: self.os_id().to_owned(),
        }
    }

    #[inline]
    pub fn occupancy(&self) -> &[AtomicU32] {
        unsafe { slice::from_raw_parts(self.occupancy.as_ptr(), self.slots) }
    }

    #[inline]
    pub fn records(&self) -> &[RecordWords] {
        unsafe { slice::from_raw_parts(self.records.as_ptr(), self.slots) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // the mapping is released (and, for the owner, unlinked) by Shmem's Drop
        debug!(
            "[SEGMENT] releasing {} (rank {}, owner={})",
            self.os_id(),
            self.rank,
            self.is_owner()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PREFIX;
    use crate::platform::make_os_id;

    fn unique_id(tag: &str) -> String {
        make_os_id(PREFIX, rand::random::<u64>(), tag)
    }

    #[test]
    fn layout_is_cache_aligned() {
        assert_eq!(HEADER_PADDED, 64);
        assert_eq!(records_offset(1) % CACHE_LINE, 0);
        assert!(region_size(10) >= HEADER_PADDED + 10 * 4 + 10 * 8 * RECORD_WORDS);
    }

    #[test]
    fn descriptor_bytes_round_trip() {
        let d = SegmentDescriptor {
            rank: 3,
            slots: 250,
            os_id: "/kd0011223344556677_3".into(),
        };
        let bytes = d.to_bytes().unwrap();
        assert_eq!(SegmentDescriptor::from_bytes(&bytes).unwrap(), d);
        assert!(SegmentDescriptor::from_bytes(&bytes[..5]).is_err());
    }

    #[test]
    fn created_segment_starts_free_and_peer_sees_writes() {
        let plan = PartitionPlan::new(16, 2).unwrap();
        let id = unique_id("0");
        let own = Segment::create(&id, 0, &plan).unwrap();
        assert!(own.is_owner());
        assert_eq!(own.slots(), 8);
        assert!(own.occupancy().iter().all(|c| c.load(Ordering::Relaxed) == 0));

        let peer = Segment::open(&own.descriptor(), &plan).unwrap();
        assert!(!peer.is_owner());
        own.occupancy()[5].store(1, Ordering::Release);
        assert_eq!(peer.occupancy()[5].load(Ordering::Acquire), 1);
        assert_eq!(peer.header().base, 0);
    }

    #[test]
    fn open_rejects_mismatched_plan() {
        let plan = PartitionPlan::new(16, 2).unwrap();
        let id = unique_id("1");
        let own = Segment::create(&id, 1, &plan).unwrap();
        let other = PartitionPlan::new(32, 2).unwrap();
        let mut desc = own.descriptor();
        assert!(matches!(
            Segment::open(&desc, &other),
            Err(Error::SegmentMismatch { rank: 1, .. })
        ));
        desc.slots = 16;
        desc.rank = 1;
        let res = Segment::open(&desc, &other);
        assert!(matches!(res, Err(Error::SegmentMismatch { rank: 1, .. })));
    }

    #[cfg(windows)]
    #[test]
    fn create_refuses_live_name() {
        let plan = PartitionPlan::new(4, 1).unwrap();
        let id = unique_id("w");
        let _live = Segment::create(&id, 0, &plan).unwrap();
        assert!(matches!(
            Segment::create(&id, 0, &plan),
            Err(Error::Shmem(ShmemError::MappingIdExists))
        ));
    }

    #[test]
    fn zero_slot_partition_maps_header_only() {
        let plan = PartitionPlan::new(6, 4).unwrap();
        let own = Segment::create(&unique_id("z"), 3, &plan).unwrap();
        assert_eq!(own.slots(), 0);
        assert!(own.occupancy().is_empty() && own.records().is_empty());
        let peer = Segment::open(&own.descriptor(), &plan).unwrap();
        assert_eq!(peer.header().base, 6);
        assert_eq!(peer.header().slots, 0);
    }

    #[cfg(unix)]
    #[test]
    fn create_replaces_stale_name() {
        let plan = PartitionPlan::new(4, 1).unwrap();
        let id = unique_id("s");
        let mut stale = Segment::create(&id, 0, &plan).unwrap();
        stale.occupancy()[0].store(1, Ordering::Release);
        // a crashed creator never unlinks its name
        stale.shmem.set_owner(false);
        let fresh = Segment::create(&id, 0, &plan).unwrap();
        assert!(fresh.is_owner());
        assert_eq!(fresh.occupancy()[0].load(Ordering::Acquire), 0);
        assert_eq!(stale.occupancy()[0].load(Ordering::Acquire), 1);
    }
}
