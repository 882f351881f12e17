//! POSIX shared-memory segments (the C1 primitive).
//!
//! A segment is a named `shm_open` object plus one local mapping. Segments
//! are identified cross-process by a 32-bit id baked into the name, so a
//! peer that only knows the id can attach. The mapping is RAII: dropping
//! the segment unmaps; unlinking the name is a separate, explicit step
//! because the last detacher owns it, not necessarily the creator.
//!
//! Queue segments additionally use an advisory OFD file-range lock on byte
//! 0: shared for data-plane operations, exclusive for structural mutations.
//! OFD locks conflict per open-file-description, which is exactly the
//! granularity we need between processes; within one process the queue node
//! wraps the segment in an `RwLock` as well, since locks on the same
//! description do not conflict with themselves.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info};
use memmap2::{MmapOptions, MmapRaw};
use shared::constants::{QUEUE_LOCK_LEN, QUEUE_LOCK_START, SHM_NAME_MAX};
use shared::errors::ShmemError;

/// A named shared-memory object with a local read-write mapping.
pub struct ShmemSegment {
    name: String,
    file: File,
    map: Option<MmapRaw>,
    len: usize,
}

// The raw mapping is shared mutable memory; all access goes through atomics
// or the locking protocol of the owning component.
unsafe impl Send for ShmemSegment {}
unsafe impl Sync for ShmemSegment {}

impl ShmemSegment {
    /// Create a fresh segment. Fails if the name already exists.
    pub fn create(name: &str, size: usize) -> Result<Self, ShmemError> {
        let file = shm_file(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;
        let mut seg = ShmemSegment {
            name: name.to_owned(),
            file,
            map: None,
            len: 0,
        };
        seg.resize(size)?;
        info!("created segment `{}` ({} bytes)", seg.name, size);
        Ok(seg)
    }

    /// Attach an existing segment at its current size.
    pub fn attach(name: &str) -> Result<Self, ShmemError> {
        let file = shm_file(name, libc::O_RDWR)?;
        let mut seg = ShmemSegment {
            name: name.to_owned(),
            file,
            map: None,
            len: 0,
        };
        seg.remap_to_current()?;
        debug!("attached segment `{}` ({} bytes)", seg.name, seg.len);
        Ok(seg)
    }

    /// Open the segment, creating it (at `size` bytes) if it does not exist
    /// yet. Returns whether this call created it. Losing a creation race
    /// degrades to a plain attach, possibly observing a zero-length segment
    /// the winner has not sized yet; callers resolve that under the
    /// exclusive file lock.
    pub fn open_or_create(name: &str, size: usize) -> Result<(Self, bool), ShmemError> {
        match Self::create(name, size) {
            Ok(seg) => Ok((seg, true)),
            Err(ShmemError::Open { ref source, .. })
                if source.kind() == io::ErrorKind::AlreadyExists =>
            {
                Ok((Self::attach(name)?, false))
            }
            Err(e) => Err(e),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Base address of the mapping. Panics if the segment is still
    /// zero-length (possible only between a racy attach and the first
    /// locked resize).
    pub fn as_ptr(&self) -> *mut u8 {
        self.map
            .as_ref()
            .expect("segment accessed before it was sized")
            .as_mut_ptr()
    }

    /// Grow the segment to `size` bytes and remap. Shrinking is not
    /// supported; a smaller request only refreshes the mapping.
    pub fn resize(&mut self, size: usize) -> Result<(), ShmemError> {
        if size > self.len {
            let rc = unsafe { libc::ftruncate(self.file.as_raw_fd(), size as libc::off_t) };
            if rc == -1 {
                return Err(ShmemError::Resize {
                    name: self.name.clone(),
                    size,
                    source: io::Error::last_os_error(),
                });
            }
        }
        self.remap_to_current()
    }

    /// Refresh the mapping after another process grew the segment.
    pub fn remap_to_current(&mut self) -> Result<(), ShmemError> {
        let size = self.stat()?;
        if size == 0 {
            self.map = None;
            self.len = 0;
            return Ok(());
        }
        if self.map.is_some() && size == self.len {
            return Ok(());
        }
        let map = MmapOptions::new()
            .len(size)
            .map_raw(&self.file)
            .map_err(|source| ShmemError::Map {
                name: self.name.clone(),
                size,
                source,
            })?;
        self.map = Some(map);
        self.len = size;
        Ok(())
    }

    /// Current size of the underlying object in bytes.
    pub fn stat(&self) -> Result<usize, ShmemError> {
        let meta = self.file.metadata().map_err(|source| ShmemError::Stat {
            name: self.name.clone(),
            source,
        })?;
        Ok(meta.len() as usize)
    }

    /// Remove the name. Existing mappings stay valid; new attaches fail.
    /// Unlinking an already-unlinked segment is not an error.
    pub fn unlink(&self) -> Result<(), ShmemError> {
        let c_name = c_name(&self.name)?;
        let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(ShmemError::Unlink {
                name: self.name.clone(),
                source: err,
            });
        }
        info!("unlinked segment `{}`", self.name);
        Ok(())
    }

    /// Take the advisory file-range lock in shared (read) mode.
    pub fn lock_shared(&self) -> Result<FileRangeLock, ShmemError> {
        self.range_lock(libc::F_RDLCK as libc::c_short)
    }

    /// Take the advisory file-range lock in exclusive (write) mode.
    pub fn lock_exclusive(&self) -> Result<FileRangeLock, ShmemError> {
        self.range_lock(libc::F_WRLCK as libc::c_short)
    }

    fn range_lock(&self, l_type: libc::c_short) -> Result<FileRangeLock, ShmemError> {
        fcntl_range(self.file.as_raw_fd(), libc::F_OFD_SETLKW, l_type).map_err(|source| {
            ShmemError::Lock {
                name: self.name.clone(),
                source,
            }
        })?;
        Ok(FileRangeLock {
            fd: self.file.as_raw_fd(),
        })
    }
}

impl Drop for ShmemSegment {
    fn drop(&mut self) {
        debug!("detached segment `{}`", self.name);
    }
}

/// RAII holder for the advisory lock; unlocks on drop. Holds the raw fd
/// rather than a borrow so the caller can resize the segment under the
/// lock; it must not outlive the segment it came from.
pub struct FileRangeLock {
    fd: std::os::fd::RawFd,
}

impl Drop for FileRangeLock {
    fn drop(&mut self) {
        // Releasing a held OFD lock only fails on programmer error (bad fd).
        let _ = fcntl_range(self.fd, libc::F_OFD_SETLK, libc::F_UNLCK as libc::c_short);
    }
}

fn fcntl_range(fd: std::os::fd::RawFd, cmd: libc::c_int, l_type: libc::c_short) -> io::Result<()> {
    let fl = libc::flock {
        l_type,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: QUEUE_LOCK_START,
        l_len: QUEUE_LOCK_LEN,
        l_pid: 0,
    };
    loop {
        let rc = unsafe { libc::fcntl(fd, cmd, &fl) };
        if rc != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn shm_file(name: &str, oflag: libc::c_int) -> Result<File, ShmemError> {
    let c_name = c_name(name)?;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0o600 as libc::mode_t) };
    if fd == -1 {
        return Err(ShmemError::Open {
            name: name.to_owned(),
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: fd is a freshly opened descriptor we own.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn c_name(name: &str) -> Result<CString, ShmemError> {
    if name.len() >= SHM_NAME_MAX {
        return Err(ShmemError::NameTooLong {
            name: name.to_owned(),
            max: SHM_NAME_MAX,
        });
    }
    CString::new(name).map_err(|_| ShmemError::NameTooLong {
        name: name.to_owned(),
        max: SHM_NAME_MAX,
    })
}

static NEXT_LOCAL_ID: AtomicU32 = AtomicU32::new(1);

/// Mint a segment id that is unique on this host with high probability:
/// low pid bits in the top half, a per-process counter in the bottom.
/// Collisions are resolved by the `O_EXCL` create in [`create_unique`].
pub fn mint_segment_id() -> u32 {
    let pid = std::process::id() & 0xffff;
    let seq = NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed) & 0xffff;
    pid << 16 | seq
}

/// Create a segment under a fresh id, retrying on the (unlikely) case that
/// another process owns a segment with the same minted name.
pub fn create_unique(
    make_name: impl Fn(u32) -> String,
    size: usize,
) -> Result<(u32, ShmemSegment), ShmemError> {
    loop {
        let id = mint_segment_id();
        match ShmemSegment::create(&make_name(id), size) {
            Ok(seg) => return Ok((id, seg)),
            Err(ShmemError::Open { ref source, .. })
                if source.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_name(tag: &str) -> String {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        format!(
            "/hazcat-shmem-test.{}.{}.{}",
            std::process::id(),
            tag,
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Drop guard so a failing assertion does not leak tmpfs entries.
    struct Unlinked(String);
    impl Drop for Unlinked {
        fn drop(&mut self) {
            if let Ok(n) = c_name(&self.0) {
                unsafe { libc::shm_unlink(n.as_ptr()) };
            }
        }
    }

    #[test]
    fn two_mappings_see_the_same_bytes() {
        let name = test_name("peer");
        let a = ShmemSegment::create(&name, 4096).unwrap();
        let _guard = Unlinked(name.clone());
        let b = ShmemSegment::attach(&name).unwrap();

        unsafe {
            a.as_ptr().add(100).write(0xab);
        }
        assert_eq!(unsafe { b.as_ptr().add(100).read() }, 0xab);
        assert_eq!(b.len(), 4096);
    }

    #[test]
    fn resize_preserves_contents() {
        let name = test_name("grow");
        let mut seg = ShmemSegment::create(&name, 128).unwrap();
        let _guard = Unlinked(name.clone());
        unsafe { seg.as_ptr().write(42) };

        seg.resize(4 * 4096).unwrap();
        assert_eq!(seg.len(), 4 * 4096);
        assert_eq!(unsafe { seg.as_ptr().read() }, 42);
        // Fresh pages come in zeroed.
        assert_eq!(unsafe { seg.as_ptr().add(4 * 4096 - 1).read() }, 0);
    }

    #[test]
    fn open_or_create_reports_the_winner() {
        let name = test_name("race");
        let (_first, created) = ShmemSegment::open_or_create(&name, 256).unwrap();
        let _guard = Unlinked(name.clone());
        assert!(created);
        let (_second, created) = ShmemSegment::open_or_create(&name, 256).unwrap();
        assert!(!created);
    }

    #[test]
    fn oversized_names_are_rejected() {
        let long = format!("/{}", "x".repeat(SHM_NAME_MAX));
        match ShmemSegment::create(&long, 64) {
            Err(ShmemError::NameTooLong { max, .. }) => assert_eq!(max, SHM_NAME_MAX),
            Err(e) => panic!("expected NameTooLong, got {e}"),
            Ok(_) => panic!("oversized name was accepted"),
        }
    }

    #[test]
    fn shared_locks_coexist_across_descriptions() {
        let name = test_name("lock");
        let a = ShmemSegment::create(&name, 64).unwrap();
        let _guard = Unlinked(name.clone());
        let b = ShmemSegment::attach(&name).unwrap();

        let la = a.lock_shared().unwrap();
        let _lb = b.lock_shared().unwrap();
        drop(la);
        // After both shared locks are gone an exclusive lock is obtainable.
        drop(_lb);
        let _ex = a.lock_exclusive().unwrap();
    }

    #[test]
    fn minted_ids_do_not_repeat_locally() {
        let a = mint_segment_id();
        let b = mint_segment_id();
        assert_ne!(a, b);
        assert_eq!(a >> 16, (std::process::id() & 0xffff));
    }
}
