//! Error handling and C-ABI error codes for kmerdht

use shared_memory::ShmemError;
use std::cell::RefCell;
use std::fmt;
use std::os::raw::c_char;

/// Errors surfaced by table construction, bootstrap and record parsing.
///
/// A full table and a missing key are ordinary results (`false` / `None`)
/// and never show up here.
#[derive(Debug)]
pub enum Error {
    /// `global_capacity == 0`.
    ZeroCapacity,
    /// The slot space cannot be split into non-empty partitions.
    Misconfigured {
        global_capacity: usize,
        num_ranks: usize,
    },
    InvalidRank {
        rank: usize,
        num_ranks: usize,
    },
    InvalidKmer(&'static str),
    Shmem(ShmemError),
    /// A peer segment's header disagrees with the local partition plan.
    SegmentMismatch {
        rank: usize,
        reason: &'static str,
    },
    Bootstrap(String),
    Platform {
        op: &'static str,
        errno: i32,
    },
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ZeroCapacity => write!(f, "global capacity must be non-zero"),
            Error::Misconfigured {
                global_capacity,
                num_ranks,
            } => write!(
                f,
                "capacity {global_capacity} cannot be split into {num_ranks} non-empty partitions"
            ),
            Error::InvalidRank { rank, num_ranks } => {
                write!(f, "rank {rank} out of range for {num_ranks} ranks")
            }
            Error::InvalidKmer(why) => write!(f, "invalid k-mer: {why}"),
            Error::Shmem(e) => write!(f, "shared memory: {e}"),
            Error::SegmentMismatch { rank, reason } => {
                write!(f, "segment of rank {rank} does not match plan: {reason}")
            }
            Error::Bootstrap(msg) => write!(f, "bootstrap: {msg}"),
            Error::Platform { op, errno } => write!(f, "{op} failed (errno {errno})"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Shmem(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmemError> for Error {
    fn from(e: ShmemError) -> Self {
        Error::Shmem(e)
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_owned())
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    ZeroCapacity = 1,
    Misconfigured = 2,
    InvalidRank = 3,
    InvalidKmer = 4,
    InvalidHandle = 5,
    Utf8Error = 6,
    ShmemOpenFailed = 7,
    SegmentMismatch = 8,
    BootstrapFailed = 9,
    HandleBusy = 10,
    NotFound = 11,
    PlatformError = 12,
    Unknown = 255,
}

impl ErrorCode {
    /// NUL-terminated so the same bytes can be handed across the C ABI.
    pub fn as_cstr(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success\0",
            ErrorCode::ZeroCapacity => "Zero capacity\0",
            ErrorCode::Misconfigured => "Capacity cannot be partitioned across ranks\0",
            ErrorCode::InvalidRank => "Invalid rank\0",
            ErrorCode::InvalidKmer => "Invalid k-mer\0",
            ErrorCode::InvalidHandle => "Invalid handle\0",
            ErrorCode::Utf8Error => "UTF-8 conversion error\0",
            ErrorCode::ShmemOpenFailed => "Shared memory open failed\0",
            ErrorCode::SegmentMismatch => "Peer segment does not match partition plan\0",
            ErrorCode::BootstrapFailed => "Bootstrap exchange failed\0",
            ErrorCode::HandleBusy => "Handle still in use\0",
            ErrorCode::NotFound => "Not found\0",
            ErrorCode::PlatformError => "Platform call failed\0",
            ErrorCode::Unknown => "Unknown error\0",
        }
    }

    pub fn as_str(self) -> &'static str {
        let s = self.as_cstr();
        &s[..s.len() - 1]
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn kmerdht_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn kmerdht_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::ZeroCapacity => ErrorCode::ZeroCapacity,
        Error::Misconfigured { .. } => ErrorCode::Misconfigured,
        Error::InvalidRank { .. } => ErrorCode::InvalidRank,
        Error::InvalidKmer(_) => ErrorCode::InvalidKmer,
        Error::Shmem(_) => ErrorCode::ShmemOpenFailed,
        Error::SegmentMismatch { .. } => ErrorCode::SegmentMismatch,
        Error::Bootstrap(_) => ErrorCode::BootstrapFailed,
        Error::Platform { .. } => ErrorCode::PlatformError,
        Error::Other(_) => ErrorCode::Unknown,
    }
}
