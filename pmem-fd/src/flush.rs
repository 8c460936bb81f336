//! Making stores to a shared mapping durable.
use core::ffi::c_int as RawFd;

use crate::op::{Os, OsError};

/// Size of a cache line written back by one flush instruction.
pub const CACHE_LINE: usize = 64;

/// How updates of a persistent mapping are pushed to the medium.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Durability {
    /// `msync` of the touched pages.
    #[default]
    Msync,
    /// Cache-line write back (`clflush`) followed by a full fence.
    Flush,
    /// Both of the above, flush first.
    MsyncAndFlush,
    /// `fdatasync` of the whole backing file.
    Fdatasync,
}

impl Durability {
    /// Persist a range of the mapping of `fd`.
    ///
    /// The range must be page aligned for the `msync` based variants.
    pub fn persist(self, os: &Os, fd: RawFd, ptr: *mut u8, len: usize) -> Result<(), OsError> {
        match self {
            Durability::Msync => os.sync_range(ptr, len),
            Durability::Flush => {
                persist_range(ptr, len);
                Ok(())
            }
            Durability::MsyncAndFlush => {
                persist_range(ptr, len);
                os.sync_range(ptr, len)
            }
            Durability::Fdatasync => os.datasync(fd),
        }
    }

    /// Parse the names accepted in configuration, `msync`, `clflush`, `both` or `fdatasync`.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "msync" => Durability::Msync,
            "clflush" | "flush" => Durability::Flush,
            "both" => Durability::MsyncAndFlush,
            "fdatasync" => Durability::Fdatasync,
            _ => return None,
        })
    }
}

/// Write back every cache line overlapping the range, then fence.
///
/// On targets without a cache-line flush instruction this is only the fence.
pub fn persist_range(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let start = (ptr as usize) & !(CACHE_LINE - 1);
        let end = (ptr as usize).saturating_add(len);
        let mut line = start;
        while line < end {
            // Safety: `clflush` on an address of a mapped line has no effect besides write back.
            unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) };
            line += CACHE_LINE;
        }

        // Safety: fence instruction, always available with sse2.
        unsafe { core::arch::x86_64::_mm_mfence() };
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (ptr, len);
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[test]
fn names_roundtrip_configuration() {
    assert_eq!(Durability::from_name("msync"), Some(Durability::Msync));
    assert_eq!(Durability::from_name("clflush"), Some(Durability::Flush));
    assert_eq!(Durability::from_name("both"), Some(Durability::MsyncAndFlush));
    assert_eq!(Durability::from_name("fdatasync"), Some(Durability::Fdatasync));
    assert_eq!(Durability::from_name("fsync"), None);
}

#[test]
fn flush_of_heap_memory() {
    let data = [0u8; 3 * CACHE_LINE + 7];
    // Unaligned start and odd length must stay inside the lines of the buffer.
    persist_range(data[5..].as_ptr(), data.len() - 5);
    persist_range(data.as_ptr(), 0);
}
