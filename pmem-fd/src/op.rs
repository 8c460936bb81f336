use core::ffi::{c_int, c_void};
use alloc::sync::Arc;

/// Interact with the `mprotect`, `msync`, `fdatasync` family of calls.
///
/// Cloning is cheap, all clones share one table.
#[derive(Clone)]
pub struct Os {
    inner: Arc<OsInner>,
}

struct OsInner {
    vtable: OsVTable,
}

/// An error returned by one of the OS calls, carrying `errno`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OsError(pub c_int);

/// *Fixed* type, not platform dependent.
type OffT = i64;
type BlkSizeT = i64;
type BlkCntT = i64;

#[non_exhaustive]
#[derive(Default, Debug)]
pub struct Stat {
    pub st_mode: u32,
    pub st_size: OffT,
    pub st_blksize: BlkSizeT,
    pub st_blocks: BlkCntT,
}

/// Access rights of a page in a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

/// A table of OS functions.
///
/// This enumerates the functions required to maintain the persistent and transient mappings of a
/// page store. A vtable must contain functions that behave according the POSIX/libc's
/// specification of the correspondingly named functions, see Safety precondition of
/// [`Os::new_unchecked`]. Note that a default table can be initialized when linking against
/// `libc`.
///
/// You're encouraged to provide your own objects here instead of hooking the functions themselves
/// with override/linker tricks.
#[non_exhaustive]
pub struct OsVTable {
    pub fstat: fn(c_int, Option<&mut Stat>) -> c_int,
    pub ftruncate: fn(c_int, OffT) -> c_int,
    pub fdatasync: fn(c_int) -> c_int,
    pub mprotect: fn(*mut c_void, usize, Protection) -> c_int,
    pub msync: fn(*mut c_void, usize) -> c_int,
    /// Drop private copies of the range so it reads through to the file again.
    pub madvise_dontneed: fn(*mut c_void, usize) -> c_int,
    pub errno: fn() -> c_int,
}

impl Os {
    /// Create an `Os` from a customized vtable.
    ///
    /// # Safety
    ///
    /// The VTable must contain correct functions that implement the named interfaces.
    pub unsafe fn new_unchecked(vtable: OsVTable) -> Self {
        Os {
            inner: Arc::new(OsInner { vtable }),
        }
    }

    #[cfg(feature = "libc")]
    pub fn new() -> Self {
        unsafe {
            Self::new_unchecked(OsVTable::new_libc())
        }
    }

    pub fn stat(&self, fd: c_int) -> Result<Stat, OsError> {
        let mut stat = Stat::default();
        let ret = (self.inner.vtable.fstat)(fd, Some(&mut stat));
        self.check(ret)?;
        Ok(stat)
    }

    pub fn truncate(&self, fd: c_int, len: u64) -> Result<(), OsError> {
        let len = OffT::try_from(len).map_err(|_| OsError(Self::EFBIG))?;
        let ret = (self.inner.vtable.ftruncate)(fd, len);
        self.check(ret)
    }

    pub fn datasync(&self, fd: c_int) -> Result<(), OsError> {
        let ret = (self.inner.vtable.fdatasync)(fd);
        self.check(ret)
    }

    /// Change the protection of a page aligned range.
    ///
    /// # Safety
    ///
    /// The range must be a mapping owned by the caller. Revoking access makes later accesses
    /// through references into that range fault.
    pub unsafe fn protect(&self, ptr: *mut u8, len: usize, prot: Protection) -> Result<(), OsError> {
        let ret = (self.inner.vtable.mprotect)(ptr as *mut c_void, len, prot);
        self.check(ret)
    }

    /// Synchronously write back a page aligned range of a shared mapping.
    pub fn sync_range(&self, ptr: *mut u8, len: usize) -> Result<(), OsError> {
        let ret = (self.inner.vtable.msync)(ptr as *mut c_void, len);
        self.check(ret)
    }

    /// Discard the private copy of a page aligned range of a private file mapping.
    ///
    /// # Safety
    ///
    /// The range must be a private mapping owned by the caller and no references into it may be
    /// alive, its contents change to those of the underlying file.
    pub unsafe fn discard(&self, ptr: *mut u8, len: usize) -> Result<(), OsError> {
        let ret = (self.inner.vtable.madvise_dontneed)(ptr as *mut c_void, len);
        self.check(ret)
    }

    fn check(&self, ret: c_int) -> Result<(), OsError> {
        if ret < 0 {
            Err(OsError((self.inner.vtable.errno)()))
        } else {
            Ok(())
        }
    }

    const EFBIG: c_int = 27;
}

impl OsVTable {
    #[cfg(feature = "libc")]
    pub fn new_libc() -> Self {
        fn _fstat(fd: c_int, stat: Option<&mut Stat>) -> c_int {
            let mut uninit = core::mem::MaybeUninit::<libc::stat>::zeroed();
            // Safety: passing the correct pointer to a struct of libc::stat.
            let ret = unsafe { libc::fstat(fd, uninit.as_mut_ptr()) };

            if ret == 0 {
                // Safety: always initialized on return with success.
                let lstat = unsafe { uninit.assume_init() };
                if let Some(stat) = stat {
                    *stat = Stat {
                        st_mode: lstat.st_mode,
                        st_size: lstat.st_size as OffT,
                        st_blksize: lstat.st_blksize as BlkSizeT,
                        st_blocks: lstat.st_blocks as BlkCntT,
                    };
                };
            }

            ret
        }

        fn _ftruncate(fd: c_int, len: OffT) -> c_int {
            unsafe { libc::ftruncate(fd, len) }
        }

        fn _fdatasync(fd: c_int) -> c_int {
            unsafe { libc::fdatasync(fd) }
        }

        fn _mprotect(addr: *mut c_void, len: usize, prot: Protection) -> c_int {
            let prot = match prot {
                Protection::None => libc::PROT_NONE,
                Protection::Read => libc::PROT_READ,
                Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            };

            unsafe { libc::mprotect(addr, len, prot) }
        }

        fn _msync(addr: *mut c_void, len: usize) -> c_int {
            unsafe { libc::msync(addr, len, libc::MS_SYNC) }
        }

        fn _madvise_dontneed(addr: *mut c_void, len: usize) -> c_int {
            unsafe { libc::madvise(addr, len, libc::MADV_DONTNEED) }
        }

        fn _errno() -> c_int {
            unsafe { *libc::__errno_location() }
        }

        OsVTable {
            fstat: _fstat,
            ftruncate: _ftruncate,
            fdatasync: _fdatasync,
            mprotect: _mprotect,
            msync: _msync,
            madvise_dontneed: _madvise_dontneed,
            errno: _errno,
        }
    }
}

impl core::fmt::Display for OsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "os call failed with errno {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for OsError {}

#[cfg(feature = "std")]
impl From<OsError> for std::io::Error {
    fn from(err: OsError) -> Self {
        std::io::Error::from_raw_os_error(err.0)
    }
}
