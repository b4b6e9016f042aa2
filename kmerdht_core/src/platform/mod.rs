//! Platform-specific module for kmerdht

#[cfg(target_os = "windows")]
pub mod windows;
#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::{make_os_id, platform_drop};
#[cfg(target_os = "windows")]
pub use windows::{make_os_id, platform_drop};
