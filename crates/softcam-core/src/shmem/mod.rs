//! Named shared memory regions and named cross-process locks.
//!
//! Both primitives are identified by a plain string name that every
//! cooperating process agrees on. A region is either created (the name must
//! be free) or opened (the name must exist); its lifetime follows the
//! underlying OS object, which stays alive while any process holds it.
//!
//! ## Platform support
//!
//! - Unix: `shm_open` / `mmap` with `flock`-based holder tracking and locks
//! - Windows: `CreateFileMappingW` / `MapViewOfFile` with named mutexes

#[cfg(unix)]
pub mod platform_unix;
#[cfg(windows)]
pub mod platform_windows;

#[cfg(unix)]
pub use platform_unix::{NamedLock, NamedLockGuard, SharedRegion};

#[cfg(windows)]
pub use platform_windows::{NamedLock, NamedLockGuard, SharedRegion};

use crate::{Result, SoftcamError};

/// Longest accepted object name in bytes.
pub const MAX_NAME_LENGTH: usize = 240;

/// Suffix appended to lock names on Unix, where locks are shm objects too,
/// so a lock never shares an object with a region of the same name.
#[cfg(unix)]
pub const LOCK_NAME_SUFFIX: &str = ".lock";

/// Check that `name` can be used for a shared object on every platform.
///
/// Names must be non-empty, at most [`MAX_NAME_LENGTH`] bytes, and free of
/// backslashes and NUL bytes. Forward slashes are allowed.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LENGTH
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(SoftcamError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("DirectShow Softcam/SharedMemory").is_ok());
        assert!(validate_name("shmemtest").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("\\").is_err());
        assert!(validate_name("a\0b").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }
}
