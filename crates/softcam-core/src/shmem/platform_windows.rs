//! Windows shared memory implementation using `CreateFileMapping`.
//!
//! Win32 specifics:
//! - Regions are pagefile-backed mappings (`INVALID_HANDLE_VALUE`), so the
//!   kernel reference-counts them across processes and deletes the object
//!   when the last handle closes
//! - `CreateFileMappingW` reports an existing object through
//!   `ERROR_ALREADY_EXISTS`; create treats that as a collision
//! - The mapped size comes from `VirtualQuery` and is page-rounded
//! - Locks are named kernel mutexes under the exact configured name, so
//!   other implementations of the protocol share them; an abandoned mutex
//!   still counts as acquired

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::{io, mem, ptr};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};
use winapi::ctypes::c_void;
use winapi::shared::minwindef::{DWORD, FALSE};
use winapi::shared::winerror::{ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile,
    VirtualQuery,
};
use winapi::um::synchapi::{CreateMutexW, ReleaseMutex, WaitForSingleObject};
use winapi::um::winbase::{INFINITE, WAIT_ABANDONED, WAIT_OBJECT_0};
use winapi::um::winnt::{HANDLE, MEMORY_BASIC_INFORMATION, PAGE_READWRITE};

use super::validate_name;
use crate::{Result, SoftcamError};

fn wide_name(name: &str) -> Result<Vec<u16>> {
    validate_name(name)?;
    Ok(OsStr::new(name)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect())
}

/// Platform shared memory handle for Windows.
pub struct SharedRegion {
    handle: HANDLE,
    view: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the handle and view stay valid for the lifetime of the value and
// are only released in `Drop`. Access to the mapped bytes is serialized by
// the named lock.
#[allow(unsafe_code)]
unsafe impl Send for SharedRegion {}
#[allow(unsafe_code)]
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a new region of at least `size` bytes.
    #[allow(unsafe_code)]
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SoftcamError::InvalidSize(size));
        }
        let wide = wide_name(name)?;
        let size64 = size as u64;

        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null_mut(),
                PAGE_READWRITE,
                (size64 >> 32) as DWORD,
                size64 as DWORD,
                wide.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(SoftcamError::SharedMemory(format!(
                "CreateFileMappingW failed for {name}: {}",
                io::Error::last_os_error()
            )));
        }
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(handle) };
            return Err(SoftcamError::AlreadyExists(name.to_string()));
        }

        let region = Self::map_view(handle, name)?;
        debug!("created shared memory {name} ({} bytes)", region.size);
        Ok(region)
    }

    /// Open an existing region, mapping the object's full size.
    #[allow(unsafe_code)]
    pub fn open(name: &str) -> Result<Self> {
        let wide = wide_name(name)?;
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, wide.as_ptr()) };
        if handle.is_null() {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(ERROR_FILE_NOT_FOUND as i32) {
                SoftcamError::NotFound(name.to_string())
            } else {
                SoftcamError::SharedMemory(format!("OpenFileMappingW failed for {name}: {err}"))
            });
        }

        let region = Self::map_view(handle, name)?;
        debug!("opened shared memory {name} ({} bytes)", region.size);
        Ok(region)
    }

    /// Map the whole object behind `handle`, taking ownership of the handle.
    #[allow(unsafe_code)]
    fn map_view(handle: HANDLE, name: &str) -> Result<Self> {
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if view.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(SoftcamError::SharedMemory(format!(
                "MapViewOfFile failed for {name}: {err}"
            )));
        }

        let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let written = unsafe {
            VirtualQuery(view, &raw mut info, mem::size_of::<MEMORY_BASIC_INFORMATION>())
        };
        if written == 0 {
            let err = io::Error::last_os_error();
            unsafe {
                UnmapViewOfFile(view);
                CloseHandle(handle);
            }
            return Err(SoftcamError::SharedMemory(format!(
                "VirtualQuery failed for {name}: {err}"
            )));
        }

        Ok(Self {
            handle,
            view: view.cast::<u8>(),
            size: info.RegionSize,
            name: name.to_string(),
        })
    }

    /// Size of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.view
    }

    /// Mutable base address of the mapping.
    ///
    /// Other processes may write through their own mappings at any time;
    /// dereference only while holding the matching named lock.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.view
    }

    /// Name the region was created or opened with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedRegion {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(self.view.cast::<c_void>());
            CloseHandle(self.handle);
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.size)
            .finish_non_exhaustive()
    }
}

/// Cross-process mutex identified by name.
///
/// The in-process mutex keeps threads that share one handle apart; Win32
/// mutexes are recursive for the owning thread and would let them through.
pub struct NamedLock {
    local: Mutex<()>,
    handle: HANDLE,
    name: String,
}

// SAFETY: a mutex handle may be waited on and released from any thread; the
// guard is not `Send`, so release happens on the acquiring thread.
#[allow(unsafe_code)]
unsafe impl Send for NamedLock {}
#[allow(unsafe_code)]
unsafe impl Sync for NamedLock {}

impl NamedLock {
    /// Open (creating if needed) the named mutex.
    #[allow(unsafe_code)]
    pub fn open(name: &str) -> Result<Self> {
        let wide = wide_name(name)?;
        let handle = unsafe { CreateMutexW(ptr::null_mut(), FALSE, wide.as_ptr()) };
        if handle.is_null() {
            return Err(SoftcamError::Lock(format!(
                "CreateMutexW failed for {name}: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(Self {
            local: Mutex::new(()),
            handle,
            name: name.to_string(),
        })
    }

    /// Block until the lock is held by this handle.
    #[allow(unsafe_code)]
    pub fn lock(&self) -> Result<NamedLockGuard<'_>> {
        let local = self.local.lock();
        match unsafe { WaitForSingleObject(self.handle, INFINITE) } {
            WAIT_OBJECT_0 => {}
            WAIT_ABANDONED => warn!("named lock {} was abandoned by its owner", self.name),
            _ => {
                return Err(SoftcamError::Lock(format!(
                    "WaitForSingleObject failed for {}: {}",
                    self.name,
                    io::Error::last_os_error()
                )));
            }
        }
        Ok(NamedLockGuard {
            handle: self.handle,
            _local: local,
        })
    }

    /// Name the lock was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLock {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

impl std::fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLock")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Scope guard releasing a [`NamedLock`] on drop.
pub struct NamedLockGuard<'a> {
    handle: HANDLE,
    _local: MutexGuard<'a, ()>,
}

impl Drop for NamedLockGuard<'_> {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if unsafe { ReleaseMutex(self.handle) } == 0 {
            warn!(
                "failed to release named lock: {}",
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_and_collide() {
        let name = format!("softcam-win-test/{}", std::process::id());
        let view1 = SharedRegion::create(&name, 888).unwrap();
        let view2 = SharedRegion::open(&name).unwrap();

        assert!(view1.len() >= 888);
        assert!(view2.len() >= 888);
        assert_ne!(view1.as_ptr(), view2.as_ptr());
        assert!(matches!(
            SharedRegion::create(&name, 888),
            Err(SoftcamError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_backslash_name_rejected() {
        assert!(matches!(
            SharedRegion::create("\\", 888),
            Err(SoftcamError::InvalidName(_))
        ));
    }
}
