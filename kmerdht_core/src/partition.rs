//! Partition planning: how the global slot space is split across ranks.
//!
//! Every rank owns `stride = ceil(global_capacity / num_ranks)` consecutive
//! slots, except the last one which takes the remainder. The plan is a pure
//! function of `(global_capacity, num_ranks)`, so every rank derives every
//! other rank's partition locally.

use crate::errors::Error;

/// Contiguous range `[base, base + size)` of global slots owned by one rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub base: usize,
    pub size: usize,
}

impl Partition {
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    #[inline]
    pub fn contains(&self, global_idx: usize) -> bool {
        global_idx >= self.base && global_idx < self.end()
    }
}

/// Validated layout shared by all ranks of one table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionPlan {
    global_capacity: usize,
    num_ranks: usize,
    stride: usize,
}

impl PartitionPlan {
    /// Rejects `global_capacity < num_ranks` and every shape where the ceil
    /// stride overshoots the slot space, like 5 slots over 4 ranks. An exact
    /// fit such as 6 over 4 is accepted and leaves the last rank no slots.
    pub fn new(global_capacity: usize, num_ranks: usize) -> Result<Self, Error> {
        if global_capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        let misconfigured = Error::Misconfigured {
            global_capacity,
            num_ranks,
        };
        if num_ranks == 0 || global_capacity < num_ranks {
            return Err(misconfigured);
        }
        let stride = global_capacity.div_ceil(num_ranks);
        // last rank's base may sit at the end, never past it
        match (num_ranks - 1).checked_mul(stride) {
            Some(last_base) if last_base <= global_capacity => Ok(Self {
                global_capacity,
                num_ranks,
                stride,
            }),
            _ => Err(misconfigured),
        }
    }

    #[inline]
    pub fn global_capacity(&self) -> usize {
        self.global_capacity
    }

    #[inline]
    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Slots between the bases of two consecutive ranks.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn partition(&self, rank: usize) -> Result<Partition, Error> {
        if rank >= self.num_ranks {
            return Err(Error::InvalidRank {
                rank,
                num_ranks: self.num_ranks,
            });
        }
        let base = self.stride * rank;
        let size = if rank == self.num_ranks - 1 {
            self.global_capacity - base
        } else {
            self.stride
        };
        Ok(Partition { base, size })
    }

    pub fn partitions(&self) -> impl Iterator<Item = Partition> + '_ {
        (0..self.num_ranks).filter_map(move |r| self.partition(r).ok())
    }

    /// Rank whose partition holds `global_idx`.
    #[inline]
    pub fn owner_of(&self, global_idx: usize) -> usize {
        debug_assert!(global_idx < self.global_capacity);
        global_idx / self.stride
    }

    /// Position of `global_idx` inside its owner's arrays.
    #[inline]
    pub fn local_offset_of(&self, global_idx: usize) -> usize {
        debug_assert!(global_idx < self.global_capacity);
        global_idx % self.stride
    }
}

/// One-shot form: the partition of `rank`.
pub fn plan(global_capacity: usize, num_ranks: usize, rank: usize) -> Result<Partition, Error> {
    PartitionPlan::new(global_capacity, num_ranks)?.partition(rank)
}
