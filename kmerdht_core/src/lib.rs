pub mod comm;
pub mod constants;
pub mod errors;
pub mod helpers;
pub mod kmer;
pub mod partition;
pub mod platform;
pub mod public_api;
pub mod remote;
pub mod segment;
pub mod telemetry;
pub mod types;

pub use comm::{Communicator, LocalComm, ShmRendezvous};
pub use errors::Error;
pub use kmer::{KmerPair, PackedKmer};
pub use partition::{plan, Partition, PartitionPlan};
pub use remote::{OccupancyCell, RecordCell, SlotAddr};
pub use types::KmerHashMap;

use constants::{PREFIX, SLOT_FREE};
use helpers::fnv1a_str;
use log::{debug, info, warn};
#[cfg(feature = "trace")]
use log::trace;
use metrics::{counter, gauge, histogram};
use once_cell::sync::OnceCell;
use platform::{make_os_id, platform_drop};
use segment::{Segment, SegmentDescriptor};
use std::sync::atomic::Ordering;

// ---- logging bootstraper -------------------------------------------------
fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}

/// OS name of `rank`'s segment for `job`.
pub fn segment_os_id(job: &str, rank: usize) -> String {
    make_os_id(PREFIX, fnv1a_str(job), &rank.to_string())
}

/// Unlink every name a run of `job` with `num_ranks` ranks may have left
/// behind: the rank segments and the rendezvous directory. Names that do
/// not exist are skipped. Processes that still map them keep their mapping.
pub fn force_destroy(job: &str, num_ranks: usize) -> Result<(), Error> {
    ensure_logging();
    let mut first_err = None;
    let names = (0..num_ranks)
        .map(|r| segment_os_id(job, r))
        .chain(std::iter::once(comm::rendezvous_os_id(job)));
    for os_id in names {
        if let Err(e) = platform_drop(&os_id) {
            warn!("[DESTROY] could not unlink {os_id}: {e}");
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    info!("[DESTROY] job={job} ranks={num_ranks}");
    first_err.map_or(Ok(()), Err)
}

impl KmerHashMap {
    /// Collective constructor: every rank of `comm` must call it with the
    /// same `job` and `global_capacity`.
    ///
    /// Creates this rank's segment, exchanges descriptors with all peers,
    /// maps every peer segment and returns after a final barrier. From that
    /// point every rank may insert into and search any partition.
    pub fn new<C>(comm: C, job: &str, global_capacity: usize) -> Result<Self, Error>
    where
        C: Communicator + 'static,
    {
        ensure_logging();
        telemetry::init();

        let rank = comm.rank();
        let num_ranks = comm.size();
        let plan = PartitionPlan::new(global_capacity, num_ranks)?;
        let partition = plan.partition(rank)?;

        let own = Segment::create(&segment_os_id(job, rank), rank, &plan)?;
        let gathered = comm.all_gather(&own.descriptor().to_bytes()?)?;
        if gathered.len() != num_ranks {
            return Err(Error::Bootstrap(format!(
                "gathered {} descriptors, expected {num_ranks}",
                gathered.len()
            )));
        }

        let mut own = Some(own);
        let mut segments = Vec::with_capacity(num_ranks);
        for (r, raw) in gathered.iter().enumerate() {
            let seg = if r == rank {
                own.take()
                    .ok_or_else(|| Error::Bootstrap("own segment gathered twice".into()))?
            } else {
                let desc = SegmentDescriptor::from_bytes(raw)?;
                if desc.rank != r {
                    return Err(Error::SegmentMismatch {
                        rank: r,
                        reason: "descriptor gathered at wrong index",
                    });
                }
                Segment::open(&desc, &plan)?
            };
            segments.push(seg);
        }

        comm.barrier()?;
        info!(
            "[OPEN] job={job} rank={rank}/{num_ranks} global_capacity={global_capacity} \
             partition=[{}, {})",
            partition.base,
            partition.end()
        );
        Ok(Self {
            comm: Box::new(comm),
            plan,
            partition,
            rank,
            segments,
        })
    }

    /// Place `rec` in the first free slot at or after its home slot,
    /// wrapping around the whole table. `false` once every slot has been
    /// tried, i.e. the table is full.
    ///
    /// The same key inserted twice occupies two slots.
    pub fn insert(&self, rec: &KmerPair) -> bool {
        let cap = self.plan.global_capacity();
        let home = self.home_slot(rec.key());
        let mut probe = home;
        let mut collisions = 0u64;
        loop {
            #[cfg(feature = "trace")]
            trace!("[INSERT] {} probing slot {probe}", rec.kmer);
            if self.occupancy_handle(probe).try_claim() {
                self.record_handle(probe).write(rec);
                counter!(telemetry::INSERTS).increment(1);
                histogram!(telemetry::PROBE_LENGTH).record((collisions + 1) as f64);
                if collisions > 0 {
                    debug!(
                        "[INSERT] {} home={home} placed at {probe} after {collisions} collisions",
                        rec.kmer
                    );
                }
                return true;
            }
            collisions += 1;
            counter!(telemetry::INSERT_COLLISIONS).increment(1);
            probe = (probe + 1) % cap;
            if probe == home {
                counter!(telemetry::TABLE_FULL).increment(1);
                warn!("[INSERT] table full, dropping {}", rec.kmer);
                return false;
            }
        }
    }

    /// Insert every record; returns how many found a slot.
    pub fn bulk_insert(&self, recs: &[KmerPair]) -> usize {
        recs.iter().filter(|r| self.insert(r)).count()
    }

    /// Look `key` up along its probe chain. The chain ends at the first
    /// free slot or after a full wrap. Slots that are claimed but whose
    /// record is not written yet are skipped.
    pub fn find(&self, key: &PackedKmer) -> Option<KmerPair> {
        counter!(telemetry::LOOKUPS).increment(1);
        let cap = self.plan.global_capacity();
        let home = self.home_slot(key);
        let mut probe = home;
        loop {
            #[cfg(feature = "trace")]
            trace!("[FIND] {key} probing slot {probe}");
            if self.occupancy_handle(probe).is_empty() {
                break;
            }
            match self.record_handle(probe).read() {
                Some(rec) if rec.kmer == *key => return Some(rec),
                _ => {}
            }
            probe = (probe + 1) % cap;
            if probe == home {
                break;
            }
        }
        counter!(telemetry::LOOKUP_MISSES).increment(1);
        None
    }

    /// Slots owned by this rank.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.partition.size
    }

    #[inline]
    pub fn global_capacity(&self) -> usize {
        self.plan.global_capacity()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn num_ranks(&self) -> usize {
        self.plan.num_ranks()
    }

    #[inline]
    pub fn partition(&self) -> Partition {
        self.partition
    }

    #[inline]
    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    /// First slot probed for `key`.
    #[inline]
    pub fn home_slot(&self, key: &PackedKmer) -> usize {
        (key.slot_hash() % self.plan.global_capacity() as u64) as usize
    }

    #[inline]
    pub fn owner_of(&self, global_idx: usize) -> usize {
        self.plan.owner_of(global_idx)
    }

    #[inline]
    pub fn local_offset_of(&self, global_idx: usize) -> usize {
        self.plan.local_offset_of(global_idx)
    }

    /// Occupancy cell of a global slot, wherever it lives.
    ///
    /// # Panics
    /// If `global_idx >= global_capacity()`.
    pub fn occupancy_handle(&self, global_idx: usize) -> OccupancyCell<'_> {
        assert!(global_idx < self.plan.global_capacity(), "slot {global_idx} out of range");
        OccupancyCell::new(&self.segments, remote::resolve(&self.plan, global_idx))
    }

    /// Record cell of a global slot, wherever it lives.
    ///
    /// # Panics
    /// If `global_idx >= global_capacity()`.
    pub fn record_handle(&self, global_idx: usize) -> RecordCell<'_> {
        assert!(global_idx < self.plan.global_capacity(), "slot {global_idx} out of range");
        RecordCell::new(&self.segments, remote::resolve(&self.plan, global_idx))
    }

    /// Sealed records stored in this rank's partition, whoever wrote them.
    pub fn local_records(&self) -> impl Iterator<Item = KmerPair> + '_ {
        let part = self.partition;
        (part.base..part.end())
            .filter(move |&idx| !self.occupancy_handle(idx).is_empty())
            .filter_map(move |idx| self.record_handle(idx).read())
    }

    /// Claimed slots in this rank's partition.
    pub fn local_occupied(&self) -> usize {
        self.segments[self.rank]
            .occupancy()
            .iter()
            .filter(|c| c.load(Ordering::Acquire) != SLOT_FREE)
            .count()
    }

    /// Emit gauges (caller decides cadence).
    pub fn report_occupancy_metrics(&self) {
        gauge!(telemetry::LOCAL_OCCUPIED).set(self.local_occupied() as f64);
    }

    /// Collective barrier across all ranks of this table.
    pub fn barrier(&self) -> Result<(), Error> {
        self.comm.barrier()
    }

    /// Collective teardown: waits for every rank, then unmaps all segments
    /// and unlinks this rank's own.
    pub fn teardown(self) -> Result<(), Error> {
        let res = self.comm.barrier();
        info!(
            "[CLOSE] rank={} local_occupied={}",
            self.rank,
            self.local_occupied()
        );
        drop(self);
        res
    }
}
