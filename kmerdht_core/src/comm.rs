//! Bootstrap exchange between ranks.
//!
//! Table construction needs exactly two collective operations: an
//! all-gather of segment descriptors and a barrier. `Communicator` is that
//! seam; rank discovery itself is the caller's business.
//!
//! Two implementations ship with the crate:
//! - [`LocalComm`]: ranks are threads of one process.
//! - [`ShmRendezvous`]: ranks are processes on one host that meet in a named
//!   shared-memory directory segment.

use crate::constants::{BOOTSTRAP_TIMEOUT_SECS, CACHE_LINE, GATHER_BYTES, PREFIX, RENDEZVOUS_MAGIC};
use crate::errors::Error;
use crate::helpers::{align_up, fnv1a_str};
use crate::platform::make_os_id;
use log::{debug, trace};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::{
    mem::size_of,
    ptr::NonNull,
    slice,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Barrier, Mutex,
    },
    time::{Duration, Instant},
};

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Returns once every rank has entered the barrier.
    fn barrier(&self) -> Result<(), Error>;
    /// Every rank contributes `local`; every rank receives all contributions
    /// indexed by rank.
    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, Error>;
}

// ───────────────────────── in-process group ─────────────────────────── //

struct GroupShared {
    barrier: Barrier,
    board: Mutex<Vec<Vec<u8>>>,
}

/// One member of a group of thread ranks.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    shared: Arc<GroupShared>,
}

impl LocalComm {
    /// `size` connected members, member `i` has rank `i`.
    pub fn group(size: usize) -> Vec<LocalComm> {
        let shared = Arc::new(GroupShared {
            barrier: Barrier::new(size),
            board: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// A group of one.
    pub fn solo() -> LocalComm {
        LocalComm::group(1).remove(0)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<(), Error> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        let poisoned = |_| Error::Bootstrap("gather board poisoned".into());
        self.shared.board.lock().map_err(poisoned)?[self.rank] = local.to_vec();
        self.shared.barrier.wait();
        let all = self.shared.board.lock().map_err(poisoned)?.clone();
        // nobody may overwrite the board before everyone has read it
        self.shared.barrier.wait();
        Ok(all)
    }
}

// ───────────────────────── cross-process rendezvous ─────────────────── //

#[repr(C, align(64))]
struct RendezvousHeader {
    magic: AtomicU64, // stored last by the creator, Release
    num_ranks: AtomicU64,
    arrived: AtomicU64,
    generation: AtomicU64,
    joined: AtomicU64,
}

const RV_HEADER_PADDED: usize = align_up(size_of::<RendezvousHeader>(), CACHE_LINE);
/// Length word + payload words.
const GATHER_SLOT_WORDS: usize = 1 + GATHER_BYTES / 8;

const fn rendezvous_size(num_ranks: usize) -> usize {
    RV_HEADER_PADDED + num_ranks * GATHER_SLOT_WORDS * size_of::<AtomicU64>()
}

pub fn rendezvous_os_id(job: &str) -> String {
    make_os_id(PREFIX, fnv1a_str(job), "rv")
}

/// Ranks of one host meeting in a shared-memory directory named after the
/// job. The first rank to arrive creates the directory and unlinks it when
/// it drops; job names must therefore be unique among concurrent runs.
pub struct ShmRendezvous {
    shmem: Shmem,
    hdr: NonNull<RendezvousHeader>,
    slots: NonNull<AtomicU64>,
    rank: usize,
    size: usize,
    timeout: Duration,
}

// SAFETY: the pointers target the mapping owned by `shmem`; every shared
// field is atomic.
unsafe impl Send for ShmRendezvous {}
unsafe impl Sync for ShmRendezvous {}

impl ShmRendezvous {
    pub fn join(job: &str, rank: usize, num_ranks: usize) -> Result<Self, Error> {
        Self::join_with_timeout(job, rank, num_ranks, Duration::from_secs(BOOTSTRAP_TIMEOUT_SECS))
    }

    pub fn join_with_timeout(
        job: &str,
        rank: usize,
        num_ranks: usize,
        timeout: Duration,
    ) -> Result<Self, Error> {
        if num_ranks == 0 || rank >= num_ranks {
            return Err(Error::InvalidRank { rank, num_ranks });
        }
        let os_id = rendezvous_os_id(job);
        let size = rendezvous_size(num_ranks);
        let deadline = Instant::now() + timeout;

        let shmem = match ShmemConf::new().os_id(&os_id).size(size).create() {
            Ok(m) => {
                let hdr = unsafe { &*(m.as_ptr() as *const RendezvousHeader) };
                hdr.num_ranks.store(num_ranks as u64, Ordering::Relaxed);
                hdr.magic.store(RENDEZVOUS_MAGIC, Ordering::Release);
                debug!("[RENDEZVOUS] rank {rank} created {os_id} for {num_ranks} ranks");
                m
            }
            Err(ShmemError::MappingIdExists) => Self::attach(&os_id, deadline)?,
            Err(e) => return Err(e.into()),
        };

        let hdr = NonNull::new(shmem.as_ptr() as *mut RendezvousHeader)
            .ok_or(Error::Shmem(ShmemError::MapOpenFailed(0)))?;
        let slots = NonNull::new(unsafe { shmem.as_ptr().add(RV_HEADER_PADDED) } as *mut AtomicU64)
            .ok_or(Error::Shmem(ShmemError::MapOpenFailed(0)))?;
        let seen = unsafe { hdr.as_ref() }.num_ranks.load(Ordering::Relaxed) as usize;
        if seen != num_ranks || shmem.len() < size {
            return Err(Error::Bootstrap(format!(
                "rendezvous {os_id} was created for {seen} ranks, joining with {num_ranks}"
            )));
        }
        unsafe { hdr.as_ref() }.joined.fetch_add(1, Ordering::AcqRel);

        Ok(Self {
            shmem,
            hdr,
            slots,
            rank,
            size: num_ranks,
            timeout,
        })
    }

    /// Open a directory another rank is creating; retried until its header
    /// is published.
    fn attach(os_id: &str, deadline: Instant) -> Result<Shmem, Error> {
        loop {
            if let Ok(m) = ShmemConf::new().os_id(os_id).open() {
                if m.len() >= RV_HEADER_PADDED {
                    let hdr = unsafe { &*(m.as_ptr() as *const RendezvousHeader) };
                    if hdr.magic.load(Ordering::Acquire) == RENDEZVOUS_MAGIC {
                        return Ok(m);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Bootstrap(format!(
                    "rendezvous {os_id} never became ready"
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[inline]
    fn header(&self) -> &RendezvousHeader {
        unsafe { self.hdr.as_ref() }
    }

    fn slot(&self, rank: usize) -> &[AtomicU64] {
        unsafe {
            slice::from_raw_parts(
                self.slots.as_ptr().add(rank * GATHER_SLOT_WORDS),
                GATHER_SLOT_WORDS,
            )
        }
    }

    /// Ranks that have attached so far.
    pub fn joined(&self) -> usize {
        self.header().joined.load(Ordering::Acquire) as usize
    }

    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }
}

impl Communicator for ShmRendezvous {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<(), Error> {
        let hdr = self.header();
        let generation = hdr.generation.load(Ordering::Acquire);
        if hdr.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.size as u64 {
            // last one in: reset for the next round, then release everybody
            hdr.arrived.store(0, Ordering::Relaxed);
            hdr.generation.fetch_add(1, Ordering::Release);
            trace!("[RENDEZVOUS] rank {} released generation {generation}", self.rank);
            return Ok(());
        }
        let deadline = Instant::now() + self.timeout;
        let mut spins = 0u32;
        while hdr.generation.load(Ordering::Acquire) == generation {
            if spins < 1_000 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                if Instant::now() >= deadline {
                    return Err(Error::Bootstrap(format!(
                        "barrier timed out after {:?} (rank {}, generation {generation})",
                        self.timeout, self.rank
                    )));
                }
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        if local.len() > GATHER_BYTES {
            return Err(Error::Bootstrap(format!(
                "gather contribution of {} bytes exceeds {GATHER_BYTES}",
                local.len()
            )));
        }
        let mine = self.slot(self.rank);
        let mut padded = [0u8; GATHER_BYTES];
        padded[..local.len()].copy_from_slice(local);
        for (cell, chunk) in mine[1..].iter().zip(padded.chunks_exact(8)) {
            let word = u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8]));
            cell.store(word, Ordering::Relaxed);
        }
        mine[0].store(local.len() as u64, Ordering::Relaxed);
        self.barrier()?;

        let mut all = Vec::with_capacity(self.size);
        for r in 0..self.size {
            let slot = self.slot(r);
            let len = (slot[0].load(Ordering::Relaxed) as usize).min(GATHER_BYTES);
            let mut bytes = Vec::with_capacity(GATHER_BYTES);
            for cell in &slot[1..] {
                bytes.extend_from_slice(&cell.load(Ordering::Relaxed).to_le_bytes());
            }
            bytes.truncate(len);
            all.push(bytes);
        }
        self.barrier()?;
        Ok(all)
    }
}
