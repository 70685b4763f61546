//! Unix shared memory implementation using `shm_open`.
//!
//! POSIX shared memory objects outlive every process that maps them, while
//! the frame buffer protocol expects Windows semantics: the object goes away
//! once its last handle is closed. Every handle therefore keeps a shared
//! `flock` on the object for as long as it is mapped. A non-blocking
//! exclusive `flock` succeeding means nobody holds the object any more, and
//! such an orphan is unlinked when it is found (by the last holder on drop,
//! or by the next create/open after a crash).
//!
//! The holder checks are only race-free when region operations run under the
//! named lock, which the frame buffer always does.
//!
//! Named locks are zero-length shm objects held with `flock(LOCK_EX)`.
//! `flock` belongs to the open file description, so two lock handles in the
//! same process exclude each other just like two processes do. The last lock
//! handle unlinks the object; a handle that finds its object unlinked after
//! acquiring it reopens the name and locks again.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::MetadataExt;

use libc::{EEXIST, EINTR, EINVAL, ENAMETOOLONG, ENOENT, EWOULDBLOCK};
use libc::{LOCK_EX, LOCK_NB, LOCK_SH, LOCK_UN, O_CREAT, O_EXCL, O_RDWR, S_IRUSR, S_IWUSR};
use libc::{c_int, c_uint, mode_t};
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::{LOCK_NAME_SUFFIX, validate_name};
use crate::{Result, SoftcamError};

/// Translate a protocol name into a POSIX shm name.
///
/// POSIX names must start with `/` and contain no other slash. `%`, `.` and
/// `/` are percent-encoded, so distinct names never share an object:
/// `DirectShow Softcam/SharedMemory` maps to
/// `/DirectShow Softcam%2FSharedMemory`.
pub fn posix_name(name: &str) -> Result<CString> {
    shm_path(name, "")
}

/// POSIX shm name of the lock object for `name`.
///
/// Escaped names contain no `.`, so the suffix keeps lock objects apart from
/// every region name.
pub fn posix_lock_name(name: &str) -> Result<CString> {
    shm_path(name, LOCK_NAME_SUFFIX)
}

fn shm_path(name: &str, suffix: &str) -> Result<CString> {
    validate_name(name)?;
    let mut path = String::with_capacity(name.len() + suffix.len() + 1);
    path.push('/');
    for c in name.chars() {
        match c {
            '%' => path.push_str("%25"),
            '.' => path.push_str("%2E"),
            '/' => path.push_str("%2F"),
            c => path.push(c),
        }
    }
    path.push_str(suffix);
    CString::new(path).map_err(|_| SoftcamError::InvalidName(name.to_string()))
}

#[allow(unsafe_code)]
fn shm_open(name: &CString, flags: c_int) -> io::Result<File> {
    // SAFETY: `name` is a valid NUL-terminated string.
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            flags,
            (S_IRUSR | S_IWUSR) as mode_t as c_uint,
        )
    };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by shm_open and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[allow(unsafe_code)]
fn shm_unlink(name: &CString) {
    // SAFETY: `name` is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(name.as_ptr()) } == -1 {
        warn!(
            "shm_unlink failed for {}: {}",
            name.to_string_lossy(),
            io::Error::last_os_error()
        );
    }
}

#[allow(unsafe_code)]
fn flock(file: &File, operation: c_int) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor stays open for the lifetime of `file`.
        if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(EINTR) {
            return Err(err);
        }
    }
}

/// `Ok(true)` when no other handle holds the object.
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    match flock(file, LOCK_EX | LOCK_NB) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e),
    }
}

fn create_error(name: &str, err: &io::Error) -> SoftcamError {
    match err.raw_os_error() {
        Some(EEXIST) => SoftcamError::AlreadyExists(name.to_string()),
        Some(EINVAL | ENAMETOOLONG) => SoftcamError::InvalidName(name.to_string()),
        _ => SoftcamError::SharedMemory(format!("shm_open failed for {name}: {err}")),
    }
}

/// Whether `file` is still the object `name` refers to.
fn is_current(name: &CString, file: &File) -> io::Result<bool> {
    let held = file.metadata()?;
    match shm_open(name, O_RDWR) {
        Ok(named) => {
            let named = named.metadata()?;
            Ok(held.dev() == named.dev() && held.ino() == named.ino())
        }
        Err(e) if e.raw_os_error() == Some(ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Unlink `name` if the object behind it has no holders left.
///
/// Returns `true` when the name is free afterwards.
fn reclaim_orphan(c_name: &CString) -> Result<bool> {
    let file = match shm_open(c_name, O_RDWR) {
        Ok(file) => file,
        Err(e) if e.raw_os_error() == Some(ENOENT) => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    if try_lock_exclusive(&file)? {
        debug!("reclaiming orphaned shared memory {}", c_name.to_string_lossy());
        shm_unlink(c_name);
        return Ok(true);
    }
    Ok(false)
}

/// Platform shared memory handle for Unix.
///
/// Maps a POSIX shm object read-write with `memmap2::MmapRaw`; the mapping
/// is exposed as raw pointers because other processes write to it
/// concurrently.
pub struct SharedRegion {
    /// Mapped view of the object.
    map: MmapRaw,
    /// The shm object, holding a shared `flock` while the region lives.
    file: File,
    /// POSIX shm name (e.g. `/DirectShow Softcam.SharedMemory`).
    shm_name: CString,
    /// Name as given by the caller.
    name: String,
}

impl SharedRegion {
    /// Create a new region of at least `size` bytes.
    ///
    /// Fails with [`SoftcamError::AlreadyExists`] when a live object with
    /// this name exists. A leftover object with no holders is reclaimed.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SoftcamError::InvalidSize(size));
        }
        let len = u64::try_from(size).map_err(|_| SoftcamError::InvalidSize(size))?;
        let shm_name = posix_name(name)?;

        let file = match shm_open(&shm_name, O_CREAT | O_EXCL | O_RDWR) {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(EEXIST) && reclaim_orphan(&shm_name)? => {
                shm_open(&shm_name, O_CREAT | O_EXCL | O_RDWR)
                    .map_err(|e| create_error(name, &e))?
            }
            Err(e) => return Err(create_error(name, &e)),
        };

        let map = Self::size_and_map(&file, len, size).inspect_err(|_| shm_unlink(&shm_name))?;

        debug!("created shared memory {name} ({} bytes)", map.len());
        Ok(Self {
            map,
            file,
            shm_name,
            name: name.to_string(),
        })
    }

    fn size_and_map(file: &File, len: u64, size: usize) -> Result<MmapRaw> {
        flock(file, LOCK_SH)?;
        file.set_len(len)?;
        Ok(MmapOptions::new().len(size).map_raw(file)?)
    }

    /// Open an existing region, mapping the object's full size.
    ///
    /// Fails with [`SoftcamError::NotFound`] when no live object with this
    /// name exists.
    pub fn open(name: &str) -> Result<Self> {
        let shm_name = posix_name(name)?;
        let file = shm_open(&shm_name, O_RDWR).map_err(|e| match e.raw_os_error() {
            Some(ENOENT) => SoftcamError::NotFound(name.to_string()),
            _ => SoftcamError::SharedMemory(format!("shm_open failed for {name}: {e}")),
        })?;

        if try_lock_exclusive(&file)? {
            debug!("shared memory {name} has no holders, removing it");
            shm_unlink(&shm_name);
            return Err(SoftcamError::NotFound(name.to_string()));
        }
        flock(&file, LOCK_SH)?;

        let size = usize::try_from(file.metadata()?.len())
            .map_err(|_| SoftcamError::SharedMemory(format!("{name} is too large to map")))?;
        if size == 0 {
            return Err(SoftcamError::SharedMemory(format!("{name} has zero length")));
        }
        let map = MmapOptions::new().len(size).map_raw(&file)?;

        debug!("opened shared memory {name} ({size} bytes)");
        Ok(Self {
            map,
            file,
            shm_name,
            name: name.to_string(),
        })
    }

    /// Size of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    /// Mutable base address of the mapping.
    ///
    /// Other processes may write through their own mappings at any time;
    /// dereference only while holding the matching named lock.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Name the region was created or opened with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // The shared flock is released when `file` closes; if nobody else
        // holds one the object would otherwise linger.
        match try_lock_exclusive(&self.file) {
            Ok(true) => {
                debug!("last holder of {}, unlinking", self.name);
                shm_unlink(&self.shm_name);
            }
            Ok(false) => {}
            Err(e) => warn!("holder check failed for {}: {e}", self.name),
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.map.len())
            .finish_non_exhaustive()
    }
}

/// Cross-process mutex identified by name.
///
/// The in-process mutex also guards the lock object's descriptor, so threads
/// sharing one handle are serialized; the `flock` then excludes every other
/// handle.
pub struct NamedLock {
    file: Mutex<File>,
    shm_name: CString,
    name: String,
}

impl NamedLock {
    /// Open (creating if needed) the lock object for `name`.
    pub fn open(name: &str) -> Result<Self> {
        let shm_name = posix_lock_name(name)?;
        let file = shm_open(&shm_name, O_CREAT | O_RDWR)
            .map_err(|e| SoftcamError::Lock(format!("shm_open failed for {name}: {e}")))?;
        Ok(Self {
            file: Mutex::new(file),
            shm_name,
            name: name.to_string(),
        })
    }

    /// Block until the lock is held by this handle.
    pub fn lock(&self) -> Result<NamedLockGuard<'_>> {
        let mut file = self.file.lock();
        loop {
            flock(&file, LOCK_EX).map_err(|e| self.lock_error("flock", &e))?;
            if is_current(&self.shm_name, &file).map_err(|e| self.lock_error("fstat", &e))? {
                return Ok(NamedLockGuard { file });
            }

            // Unlinked by its last holder; lock whatever the name holds now.
            debug!("lock object for {} was replaced, reopening", self.name);
            *file = shm_open(&self.shm_name, O_CREAT | O_RDWR)
                .map_err(|e| self.lock_error("shm_open", &e))?;
        }
    }

    fn lock_error(&self, call: &str, err: &io::Error) -> SoftcamError {
        SoftcamError::Lock(format!("{call} failed for {}: {err}", self.name))
    }

    /// Name the lock was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        let file = self.file.get_mut();
        // Only unlink the object the name still refers to, and only while
        // no other handle holds it.
        let last = match try_lock_exclusive(file) {
            Ok(true) => is_current(&self.shm_name, file),
            other => other,
        };
        match last {
            Ok(true) => {
                debug!("last holder of lock {}, unlinking", self.name);
                shm_unlink(&self.shm_name);
            }
            Ok(false) => {}
            Err(e) => warn!("holder check failed for lock {}: {e}", self.name),
        }
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
    file: MutexGuard<'a, File>,
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, LOCK_UN) {
            warn!("failed to release named lock: {e}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const SHMEM_SIZE: usize = 888;

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "softcam-unix-test/{}/{tag}/{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_posix_name() {
        let name = posix_name("DirectShow Softcam/SharedMemory").unwrap();
        assert_eq!(name.to_str().unwrap(), "/DirectShow Softcam%2FSharedMemory");
        assert_eq!(posix_name("a.b%c").unwrap().to_str().unwrap(), "/a%2Eb%25c");
        assert_eq!(
            posix_lock_name("x/y").unwrap().to_str().unwrap(),
            "/x%2Fy.lock"
        );
        assert!(posix_name("\\").is_err());
        assert!(posix_name("").is_err());
    }

    #[test]
    fn test_posix_names_are_distinct() {
        let names = ["x/y", "x.y", "x%2Fy", "x%2Ey", "x/y.lock"];
        let mut mapped: Vec<CString> = names.iter().map(|n| posix_name(n).unwrap()).collect();
        mapped.extend(names.iter().map(|n| posix_lock_name(n).unwrap()));
        let count = mapped.len();
        mapped.sort();
        mapped.dedup();
        assert_eq!(mapped.len(), count);
    }

    #[test]
    fn test_slash_and_dot_names_are_independent() {
        let base = unique_name("alias");
        let slashed = format!("{base}/x");
        let dotted = format!("{base}.x");

        let region1 = SharedRegion::create(&slashed, SHMEM_SIZE).unwrap();
        let region2 = SharedRegion::create(&dotted, 2 * SHMEM_SIZE).unwrap();
        assert_eq!(SharedRegion::open(&slashed).unwrap().len(), SHMEM_SIZE);
        assert_eq!(SharedRegion::open(&dotted).unwrap().len(), 2 * SHMEM_SIZE);
        drop((region1, region2));
    }

    #[test]
    fn test_create_maps_requested_size() {
        let name = unique_name("basic");
        let region = SharedRegion::create(&name, SHMEM_SIZE).unwrap();

        assert!(!region.as_ptr().is_null());
        assert!(region.len() >= SHMEM_SIZE);
        assert_eq!(region.name(), name);
    }

    #[test]
    fn test_create_then_open_shares_memory() {
        let name = unique_name("share");
        let view1 = SharedRegion::create(&name, SHMEM_SIZE).unwrap();
        let view2 = SharedRegion::open(&name).unwrap();

        assert_ne!(view1.as_ptr(), view2.as_ptr());
        assert!(view2.len() >= SHMEM_SIZE);

        #[allow(unsafe_code)]
        unsafe {
            *view1.as_mut_ptr() = 0x42;
            *view1.as_mut_ptr().add(SHMEM_SIZE - 1) = 0xFF;
            assert_eq!(*view2.as_ptr(), 0x42);
            assert_eq!(*view2.as_ptr().add(SHMEM_SIZE - 1), 0xFF);
        }
    }

    #[test]
    fn test_invalid_arguments() {
        let name = unique_name("invalid");
        assert!(matches!(
            SharedRegion::create(&name, 0),
            Err(SoftcamError::InvalidSize(0))
        ));
        assert!(matches!(
            SharedRegion::create("\\", SHMEM_SIZE),
            Err(SoftcamError::InvalidName(_))
        ));

        let _view1 = SharedRegion::create(&name, SHMEM_SIZE).unwrap();
        assert!(matches!(
            SharedRegion::open(&unique_name("another")),
            Err(SoftcamError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_before_create_fails() {
        let name = unique_name("order");
        let view1 = SharedRegion::open(&name);
        let view2 = SharedRegion::create(&name, SHMEM_SIZE);

        assert!(matches!(view1, Err(SoftcamError::NotFound(_))));
        assert!(view2.is_ok());
    }

    #[test]
    fn test_multiple_create_fails() {
        let name = unique_name("twice");
        let view1 = SharedRegion::create(&name, SHMEM_SIZE).unwrap();
        let view2 = SharedRegion::create(&name, SHMEM_SIZE);

        assert!(matches!(view2, Err(SoftcamError::AlreadyExists(_))));
        assert!(view1.len() >= SHMEM_SIZE);
    }

    #[test]
    fn test_multiple_open_succeeds() {
        let name = unique_name("many");
        let view1 = SharedRegion::create(&name, SHMEM_SIZE).unwrap();
        let view2 = SharedRegion::open(&name).unwrap();
        let view3 = SharedRegion::open(&name).unwrap();

        assert_ne!(view1.as_ptr(), view2.as_ptr());
        assert_ne!(view1.as_ptr(), view3.as_ptr());
        assert_ne!(view2.as_ptr(), view3.as_ptr());
        assert!(view2.len() >= SHMEM_SIZE);
        assert!(view3.len() >= SHMEM_SIZE);
    }

    #[test]
    fn test_opener_keeps_name_alive() {
        let name = unique_name("keepalive");
        let creator = SharedRegion::create(&name, SHMEM_SIZE).unwrap();
        let opener = SharedRegion::open(&name).unwrap();
        drop(creator);

        assert!(matches!(
            SharedRegion::create(&name, SHMEM_SIZE),
            Err(SoftcamError::AlreadyExists(_))
        ));
        drop(opener);

        assert!(matches!(
            SharedRegion::open(&name),
            Err(SoftcamError::NotFound(_))
        ));
        assert!(SharedRegion::create(&name, SHMEM_SIZE).is_ok());
    }

    #[test]
    fn test_orphaned_object_is_reclaimed() {
        let name = unique_name("orphan");
        let shm_name = posix_name(&name).unwrap();

        // An object nobody holds, as left behind by a crashed process.
        let stale = shm_open(&shm_name, O_CREAT | O_EXCL | O_RDWR).unwrap();
        stale.set_len(SHMEM_SIZE as u64).unwrap();
        drop(stale);

        assert!(matches!(
            SharedRegion::open(&name),
            Err(SoftcamError::NotFound(_))
        ));

        let stale = shm_open(&shm_name, O_CREAT | O_EXCL | O_RDWR).unwrap();
        drop(stale);
        let region = SharedRegion::create(&name, SHMEM_SIZE).unwrap();
        assert!(region.len() >= SHMEM_SIZE);
    }

    #[test]
    fn test_named_lock_excludes_other_handles() {
        let name = unique_name("lock");
        let lock1 = NamedLock::open(&name).unwrap();
        let lock2 = NamedLock::open(&name).unwrap();
        assert_eq!(lock1.name(), name);

        let released = Arc::new(AtomicBool::new(false));
        let guard = lock1.lock().unwrap();

        let waiter = {
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                let _guard = lock2.lock().unwrap();
                released.load(Ordering::SeqCst)
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        released.store(true, Ordering::SeqCst);
        drop(guard);

        assert!(waiter.join().unwrap(), "second handle acquired the lock early");
    }

    #[test]
    fn test_named_lock_excludes_after_object_replaced() {
        let name = unique_name("replaced");
        let lock1 = NamedLock::open(&name).unwrap();
        let lock2 = NamedLock::open(&name).unwrap();

        // The idle third handle unlinks the object both others opened
        drop(NamedLock::open(&name).unwrap());

        let released = Arc::new(AtomicBool::new(false));
        let guard = lock1.lock().unwrap();
        let waiter = {
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                let _guard = lock2.lock().unwrap();
                released.load(Ordering::SeqCst)
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        released.store(true, Ordering::SeqCst);
        drop(guard);

        assert!(waiter.join().unwrap(), "handles locked different objects");
    }

    #[test]
    fn test_lock_object_removed_with_last_handle() {
        let name = unique_name("lockgone");
        let shm_name = posix_lock_name(&name).unwrap();
        let lock1 = NamedLock::open(&name).unwrap();
        let lock2 = NamedLock::open(&name).unwrap();

        let guard = lock1.lock().unwrap();
        drop(lock2);
        assert!(shm_open(&shm_name, O_RDWR).is_ok(), "unlinked while held");
        drop(guard);
        drop(lock1);

        let gone = shm_open(&shm_name, O_RDWR);
        assert!(matches!(gone, Err(e) if e.raw_os_error() == Some(ENOENT)));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_unlink_is_a_warning() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();

        let missing = posix_name(&unique_name("missing")).unwrap();
        tracing::subscriber::with_default(subscriber, || shm_unlink(&missing));

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("WARN"), "{output}");
        assert!(output.contains("shm_unlink failed"), "{output}");
    }

    #[test]
    fn test_named_lock_reacquire() {
        let lock = NamedLock::open(&unique_name("relock")).unwrap();
        drop(lock.lock().unwrap());
        drop(lock.lock().unwrap());
    }
}
