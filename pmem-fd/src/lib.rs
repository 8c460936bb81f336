#![cfg_attr(not(feature = "std"), no_std)]

use core::ffi::c_int as RawFd;
extern crate alloc;

mod flush;
pub mod op;

pub use flush::{persist_range, Durability, CACHE_LINE};
pub use op::{Os, OsError, OsVTable, Protection, Stat};

/// The granularity of protection, logging and commit.
pub const PAGE_SIZE: usize = 4096;

/// A file holding the persistent image of a store.
///
/// Either a regular file on a (persistent) file system or an anonymous memory file. The
/// descriptor is closed on drop.
#[cfg(feature = "std")]
pub struct BackingFd {
    file: std::fs::File,
}

#[cfg(feature = "std")]
impl BackingFd {
    /// Open or create the file at `path` for reading and writing.
    pub fn open(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        Ok(BackingFd { file })
    }

    /// Create an anonymous memory file, the image lives as long as a descriptor to it.
    #[cfg(feature = "memfile")]
    pub fn anonymous(name: &str) -> Result<Self, std::io::Error> {
        use std::os::unix::io::{FromRawFd, IntoRawFd};

        let memfile = memfile::MemFile::create_default(name)?;
        // Safety: we take over the only owner of this descriptor.
        let file = unsafe { std::fs::File::from_raw_fd(memfile.into_raw_fd()) };
        Ok(BackingFd { file })
    }

    pub fn from_file(file: std::fs::File) -> Self {
        BackingFd { file }
    }

    /// Size the file to exactly `len` bytes.
    #[cfg(feature = "libc")]
    pub fn truncate(&self, os: &Os, len: u64) -> Result<(), OsError> {
        os.truncate(self.as_raw_fd(), len)
    }

    /// The current size of the file.
    #[cfg(feature = "libc")]
    pub fn len(&self, os: &Os) -> Result<u64, OsError> {
        let stat = os.stat(self.as_raw_fd())?;
        Ok(stat.st_size.max(0) as u64)
    }

    pub fn file(&self) -> &std::fs::File {
        &self.file
    }

    pub fn try_clone(&self) -> Result<Self, std::io::Error> {
        Ok(BackingFd { file: self.file.try_clone()? })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        std::os::unix::io::AsRawFd::as_raw_fd(&self.file)
    }

    pub fn into_file(self) -> std::fs::File {
        self.file
    }
}

#[cfg(feature = "std")]
impl std::os::unix::io::AsRawFd for BackingFd {
    fn as_raw_fd(&self) -> RawFd {
        BackingFd::as_raw_fd(self)
    }
}

#[cfg(all(test, feature = "std", feature = "libc", feature = "memfile"))]
mod tests {
    use super::*;

    #[test]
    fn anonymous_backing_truncates() {
        let os = Os::new();
        let fd = BackingFd::anonymous("pmem-fd-test").expect("to create a memory file");
        assert_eq!(fd.len(&os).unwrap(), 0);

        fd.truncate(&os, 4 * PAGE_SIZE as u64).unwrap();
        assert_eq!(fd.len(&os).unwrap(), 4 * PAGE_SIZE as u64);
        os.datasync(fd.as_raw_fd()).unwrap();
    }

    #[test]
    fn errno_is_reported() {
        let os = Os::new();
        let err = os.datasync(-1).unwrap_err();
        assert_eq!(err.0, libc::EBADF);
    }
}
