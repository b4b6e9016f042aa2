//! Unix-specific platform code for kmerdht

use crate::errors::Error;

/// POSIX shm names need a leading slash and no other one.
pub fn make_os_id(prefix: &str, hash: u64, suffix: &str) -> String {
    format!("/{prefix}{hash:016x}_{suffix}")
}

/// Unlink a segment name. A name that is already gone is not an error.
pub fn platform_drop(os_id: &str) -> Result<(), Error> {
    use std::ffi::CString;
    let c_name = CString::new(os_id).map_err(|_| Error::from("segment name contains NUL"))?;
    let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if rc == 0 {
        return Ok(());
    }
    let err = errno::errno();
    if err.0 == libc::ENOENT {
        Ok(())
    } else {
        Err(Error::Platform {
            op: "shm_unlink",
            errno: err.0,
        })
    }
}
