use thiserror::Error;

use crate::entry::Handle;

#[derive(Debug, Error)]
pub enum LogError {
    /// Every slot of the region is in use.
    #[error("log region exhausted, all {0} slots in use")]
    Exhausted(u32),
    /// The region header does not carry the log magic.
    #[error("region is not a durable log")]
    BadMagic,
    /// The header describes a layout that does not fit the region.
    #[error("log header describes {header} slots but the region has {region}")]
    BadLayout { header: u64, region: u64 },
    /// A store entry holds at most one word, wider writes are logged as memcpy.
    #[error("store of {0} bytes does not fit a single entry")]
    StoreTooWide(usize),
    /// The handle refers to a slot that was freed since.
    #[error("stale handle {0:?}")]
    Stale(Handle),
    #[error("log region i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum GcError {
    /// Another collection pass is running on the same log.
    #[error("a collection is already in progress")]
    Busy,
    #[error(transparent)]
    Log(#[from] LogError),
}
