use std::io;

use pmem_state::{Handle, LogError, PersistentAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoverError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("durable log: {0}")]
    Log(#[from] LogError),
    /// A replayed write does not fit its region.
    #[error("write of {len} bytes at {addr:?} is outside of the region")]
    OutOfRange { addr: PersistentAddr, len: u64 },
    /// A data entry whose bytes could not be read back.
    #[error("entry {0:?} lost its data")]
    MissingData(Handle),
}
