//! Remote addressing and the one-sided slot operations.
//!
//! A global slot index resolves to `(owner rank, local offset)` through the
//! partition plan, and from there to a cell inside the owner's mapped
//! segment. Nothing here contacts the owner: the segments were mapped during
//! bootstrap.

use crate::constants::{KEY_WORDS, RECORD_WORDS, SLOT_CLAIMED, SLOT_FREE};
use crate::kmer::KmerPair;
use crate::partition::PartitionPlan;
use crate::segment::{RecordWords, Segment};
use std::sync::atomic::{AtomicU32, Ordering};

/// Owner and local position of one global slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotAddr {
    pub owner: usize,
    pub local: usize,
}

#[inline]
pub fn resolve(plan: &PartitionPlan, global_idx: usize) -> SlotAddr {
    SlotAddr {
        owner: plan.owner_of(global_idx),
        local: plan.local_offset_of(global_idx),
    }
}

/// Occupancy cell of one slot, possibly in another rank's segment.
#[derive(Clone, Copy)]
pub struct OccupancyCell<'a> {
    cell: &'a AtomicU32,
    addr: SlotAddr,
}

impl<'a> OccupancyCell<'a> {
    pub(crate) fn new(segments: &'a [Segment], addr: SlotAddr) -> Self {
        Self {
            cell: &segments[addr.owner].occupancy()[addr.local],
            addr,
        }
    }

    #[inline]
    pub fn addr(&self) -> SlotAddr {
        self.addr
    }

    /// CAS free -> claimed. `true` iff this caller won the slot; no other
    /// caller, in any process, will ever get `true` for it again.
    #[inline]
    pub fn try_claim(&self) -> bool {
        self.cell
            .compare_exchange(SLOT_FREE, SLOT_CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Snapshot of the cell. Stale by the time it returns; only used to
    /// cut a probe chain short.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cell.load(Ordering::Acquire) == SLOT_FREE
    }
}

/// Record cell of one slot, possibly in another rank's segment.
#[derive(Clone, Copy)]
pub struct RecordCell<'a> {
    words: &'a RecordWords,
    addr: SlotAddr,
}

impl<'a> RecordCell<'a> {
    pub(crate) fn new(segments: &'a [Segment], addr: SlotAddr) -> Self {
        Self {
            words: &segments[addr.owner].records()[addr.local],
            addr,
        }
    }

    #[inline]
    pub fn addr(&self) -> SlotAddr {
        self.addr
    }

    /// Key words first, then the sealed payload word with Release. Only the
    /// winner of this slot's claim may call this, and only once.
    pub fn write(&self, rec: &KmerPair) {
        let words = rec.to_words();
        for (cell, w) in self.words[..KEY_WORDS].iter().zip(words.iter()) {
            cell.store(*w, Ordering::Relaxed);
        }
        self.words[KEY_WORDS].store(words[KEY_WORDS], Ordering::Release);
    }

    /// `None` while the slot is claimed but its record is not sealed yet.
    /// A sealed record is never torn: the Acquire on the payload word
    /// orders the key loads after the writer's key stores.
    pub fn read(&self) -> Option<KmerPair> {
        let payload = self.words[KEY_WORDS].load(Ordering::Acquire);
        let mut key = [0u64; KEY_WORDS];
        for (k, cell) in key.iter_mut().zip(self.words[..KEY_WORDS].iter()) {
            *k = cell.load(Ordering::Relaxed);
        }
        KmerPair::from_words(key, payload)
    }
}

const _: () = assert!(RECORD_WORDS == KEY_WORDS + 1);
