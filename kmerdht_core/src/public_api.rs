//! C ABI. Tables are addressed by `i32` handles from a process-wide
//! registry; every call also records its result as the thread's last error.

use crate::constants::KMER_LEN;
use crate::errors::{map_error, set_last_error, ErrorCode};
use crate::{force_destroy, KmerHashMap, KmerPair, PackedKmer, ShmRendezvous};
use dashmap::DashMap;
use log::warn;
use once_cell::sync::Lazy;
use std::{
    ffi::CStr,
    os::raw::c_char,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

static REGISTRY: Lazy<DashMap<i32, Arc<KmerHashMap>>> = Lazy::new(DashMap::new);
static NEXT_HANDLE: AtomicI32 = AtomicI32::new(1);

/// Bytes of a NUL-terminated k-mer string.
pub const KMER_CSTR_LEN: usize = KMER_LEN + 1;

/// Record returned by `kmerdht_find`.
#[repr(C)]
pub struct KmerRecordT {
    pub kmer: [c_char; KMER_CSTR_LEN],
    pub backward: c_char,
    pub forward: c_char,
}

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::Utf8Error);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

fn get_table(handle: i32) -> Result<Arc<KmerHashMap>, ErrorCode> {
    REGISTRY
        .get(&handle)
        .map(|entry| Arc::clone(&*entry))
        .ok_or(ErrorCode::InvalidHandle)
}

/// Record `res` as the last error and return its code.
fn finish(res: Result<(), ErrorCode>) -> ErrorCode {
    let code = res.err().unwrap_or(ErrorCode::Success);
    set_last_error(code);
    code
}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Collective: join the host-local rendezvous for `job` as `rank` and build
/// the table. Blocks until all `num_ranks` ranks have called it.
#[no_mangle]
pub extern "C" fn kmerdht_open(
    job_utf8: *const c_char,
    global_capacity: usize,
    rank: u32,
    num_ranks: u32,
    out_handle: *mut i32,
) -> ErrorCode {
    finish((|| -> Result<(), ErrorCode> {
        if out_handle.is_null() {
            return Err(ErrorCode::InvalidHandle);
        }
        let job = cstr(job_utf8)?;
        let comm = ShmRendezvous::join(job, rank as usize, num_ranks as usize)
            .map_err(|e| map_error(&e))?;
        let table = KmerHashMap::new(comm, job, global_capacity).map_err(|e| map_error(&e))?;
        let handle = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
        REGISTRY.insert(handle, Arc::new(table));
        unsafe { *out_handle = handle };
        Ok(())
    })())
}

/// Collective teardown. Fails with `HandleBusy` while another thread is
/// inside a call on the same handle; the handle stays valid in that case.
#[no_mangle]
pub extern "C" fn kmerdht_close(handle: i32) -> ErrorCode {
    finish((|| -> Result<(), ErrorCode> {
        // strong count is checked under the shard write lock
        let removed = REGISTRY.remove_if(&handle, |_, t| Arc::strong_count(t) == 1);
        let Some((_, table)) = removed else {
            if !REGISTRY.contains_key(&handle) {
                return Err(ErrorCode::InvalidHandle);
            }
            warn!("[CLOSE] handle {handle} still in use");
            return Err(ErrorCode::HandleBusy);
        };
        let table = Arc::try_unwrap(table).map_err(|_| ErrorCode::HandleBusy)?;
        table.teardown().map_err(|e| map_error(&e))
    })())
}

// ───────────────────────── records ───────────────────────────────────── //

/// `*out_inserted` is false when the table is full.
#[no_mangle]
pub extern "C" fn kmerdht_insert(
    handle: i32,
    kmer_utf8: *const c_char,
    backward: c_char,
    forward: c_char,
    out_inserted: *mut bool,
) -> ErrorCode {
    finish((|| -> Result<(), ErrorCode> {
        if out_inserted.is_null() {
            return Err(ErrorCode::InvalidHandle);
        }
        let table = get_table(handle)?;
        let kmer: PackedKmer = cstr(kmer_utf8)?.parse().map_err(|e| map_error(&e))?;
        let rec = KmerPair::new(kmer, backward as u8, forward as u8).map_err(|e| map_error(&e))?;
        unsafe { *out_inserted = table.insert(&rec) };
        Ok(())
    })())
}

/// `NotFound` when the k-mer is absent; `*out_record` is untouched then.
#[no_mangle]
pub extern "C" fn kmerdht_find(
    handle: i32,
    kmer_utf8: *const c_char,
    out_record: *mut KmerRecordT,
) -> ErrorCode {
    finish((|| -> Result<(), ErrorCode> {
        if out_record.is_null() {
            return Err(ErrorCode::InvalidHandle);
        }
        let table = get_table(handle)?;
        let kmer: PackedKmer = cstr(kmer_utf8)?.parse().map_err(|e| map_error(&e))?;
        let rec = table.find(&kmer).ok_or(ErrorCode::NotFound)?;
        let out = unsafe { &mut *out_record };
        out.kmer = [0; KMER_CSTR_LEN];
        for (i, dst) in out.kmer[..KMER_LEN].iter_mut().enumerate() {
            *dst = rec.kmer.base(i) as c_char;
        }
        out.backward = rec.backward as c_char;
        out.forward = rec.forward as c_char;
        Ok(())
    })())
}

// ───────────────────── capacity & maintenance ────────────────────────── //

/// Slots owned by the calling rank.
#[no_mangle]
pub extern "C" fn kmerdht_local_capacity(handle: i32, out: *mut u64) -> ErrorCode {
    finish((|| -> Result<(), ErrorCode> {
        if out.is_null() {
            return Err(ErrorCode::InvalidHandle);
        }
        let table = get_table(handle)?;
        unsafe { *out = table.capacity() as u64 };
        Ok(())
    })())
}

/// Unlink names left by a crashed run of `job`.
#[no_mangle]
pub extern "C" fn kmerdht_force_destroy(job_utf8: *const c_char, num_ranks: u32) -> ErrorCode {
    finish((|| -> Result<(), ErrorCode> {
        let job = cstr(job_utf8)?;
        force_destroy(job, num_ranks as usize).map_err(|e| map_error(&e))
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::get_last_error;
    use std::ffi::CString;

    fn kmer_str(seed: u64) -> String {
        (0..KMER_LEN)
            .map(|i| b"ACGT"[((seed >> (2 * (i % 32))) & 3) as usize] as char)
            .collect()
    }

    #[test]
    fn single_rank_through_the_c_surface() {
        let job = CString::new(format!("capi_{}", rand::random::<u64>())).unwrap();
        let mut h = 0;
        assert_eq!(kmerdht_open(job.as_ptr(), 16, 0, 1, &mut h), ErrorCode::Success);

        let mut cap = 0u64;
        assert_eq!(kmerdht_local_capacity(h, &mut cap), ErrorCode::Success);
        assert_eq!(cap, 16);

        let k = CString::new(kmer_str(0x1234_5678)).unwrap();
        let mut inserted = false;
        assert_eq!(
            kmerdht_insert(h, k.as_ptr(), b'A' as c_char, b'F' as c_char, &mut inserted),
            ErrorCode::Success
        );
        assert!(inserted);

        let mut out = KmerRecordT {
            kmer: [0; KMER_CSTR_LEN],
            backward: 0,
            forward: 0,
        };
        assert_eq!(kmerdht_find(h, k.as_ptr(), &mut out), ErrorCode::Success);
        let got = unsafe { CStr::from_ptr(out.kmer.as_ptr()) };
        assert_eq!(got.to_bytes(), k.as_bytes());
        assert_eq!(out.backward as u8, b'A');
        assert_eq!(out.forward as u8, b'F');

        let missing = CString::new(kmer_str(0x9999)).unwrap();
        assert_eq!(kmerdht_find(h, missing.as_ptr(), &mut out), ErrorCode::NotFound);
        assert_eq!(get_last_error(), ErrorCode::NotFound);

        assert_eq!(kmerdht_close(h), ErrorCode::Success);
        assert_eq!(kmerdht_close(h), ErrorCode::InvalidHandle);
    }

    #[test]
    fn close_of_busy_handle_keeps_it_usable() {
        let job = CString::new(format!("capi_busy_{}", rand::random::<u64>())).unwrap();
        let mut h = 0;
        assert_eq!(kmerdht_open(job.as_ptr(), 8, 0, 1, &mut h), ErrorCode::Success);

        let in_use = get_table(h).unwrap();
        assert_eq!(kmerdht_close(h), ErrorCode::HandleBusy);
        assert_eq!(get_last_error(), ErrorCode::HandleBusy);

        let k = CString::new(kmer_str(0xabc)).unwrap();
        let mut inserted = false;
        assert_eq!(
            kmerdht_insert(h, k.as_ptr(), b'C' as c_char, b'G' as c_char, &mut inserted),
            ErrorCode::Success
        );
        assert!(inserted);
        assert!(in_use.find(&k.to_str().unwrap().parse::<PackedKmer>().unwrap()).is_some());

        drop(in_use);
        assert_eq!(kmerdht_close(h), ErrorCode::Success);
        assert_eq!(kmerdht_close(h), ErrorCode::InvalidHandle);
    }

    #[test]
    fn bad_arguments_map_to_codes() {
        let job = CString::new(format!("capi_bad_{}", rand::random::<u64>())).unwrap();
        let mut h = 0;
        assert_eq!(kmerdht_open(job.as_ptr(), 0, 0, 1, &mut h), ErrorCode::ZeroCapacity);
        assert_eq!(kmerdht_open(job.as_ptr(), 3, 0, 4, &mut h), ErrorCode::Misconfigured);
        assert_eq!(kmerdht_open(job.as_ptr(), 8, 2, 1, &mut h), ErrorCode::InvalidRank);
        assert_eq!(
            kmerdht_open(std::ptr::null(), 8, 0, 1, &mut h),
            ErrorCode::Utf8Error
        );

        assert_eq!(kmerdht_open(job.as_ptr(), 8, 0, 1, &mut h), ErrorCode::Success);
        let short = CString::new("ACGT").unwrap();
        let mut inserted = true;
        assert_eq!(
            kmerdht_insert(h, short.as_ptr(), b'A' as c_char, b'C' as c_char, &mut inserted),
            ErrorCode::InvalidKmer
        );
        let k = CString::new(kmer_str(7)).unwrap();
        assert_eq!(
            kmerdht_insert(h, k.as_ptr(), b'X' as c_char, b'C' as c_char, &mut inserted),
            ErrorCode::InvalidKmer
        );
        assert_eq!(
            kmerdht_insert(-1, k.as_ptr(), b'A' as c_char, b'C' as c_char, &mut inserted),
            ErrorCode::InvalidHandle
        );
        assert_eq!(kmerdht_close(h), ErrorCode::Success);
        assert_eq!(kmerdht_force_destroy(job.as_ptr(), 1), ErrorCode::Success);
    }
}
