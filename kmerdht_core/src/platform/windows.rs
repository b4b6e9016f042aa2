//! Windows-specific platform code for kmerdht

use crate::errors::Error;

/// Local namespace; `Global\` would need SeCreateGlobalPrivilege.
pub fn make_os_id(prefix: &str, hash: u64, suffix: &str) -> String {
    format!("{prefix}{hash:016x}_{suffix}")
}

/// On Windows a mapping disappears with its last handle, so there is no
/// name to unlink.
pub fn platform_drop(_os_id: &str) -> Result<(), Error> {
    Ok(())
}
