//! Page-granular shadow memory over a persistent image.
//!
//! Every thread works on a private copy of the image, a [`Workspace`]. Pages it writes are
//! tracked as dirty and a commit moves them into the shared, persistent mapping of the
//! [`PageStore`]: the new page images are first written to a per-transaction memory log and made
//! durable, only then does the persistent mapping change. When several threads dirty the same
//! page without an intervening commit, a twin of the page taken when the second writer arrives
//! lets each commit write back only the bytes its thread changed.
//!
//! A [`LookupTable`] records for every page which memory log holds its newest image, and a
//! [`VarMap`] names the variables of the image, which together let recovery restore a variable
//! without replaying anything.
mod config;
mod error;
mod lookup;
mod memlog;
mod store;
mod twin;
mod varmap;
mod workspace;

#[cfg(test)]
mod tests;

pub use config::{Config, HeapKind, LogDestination, PMEM_DURABILITY, PMEM_LOG_DEST};
pub use error::{fatal, PageError};
pub use lookup::{lookup_name, read_lookup, LookupInfo, LookupTable};
pub use memlog::{
    last_xact, memlog_name, memlogs, parse_memlog_name, read_log, LogContents, LogRecord,
    MemoryLogger,
};
pub use store::{Access, CommitStats, PageOwner, PageStore};
pub use twin::{diff_apply, diff_apply_scalar, PageBuf, Sharing, TwinPool};
pub use varmap::{VarEntry, VarLocation, VarMap};
pub use workspace::{SectionLock, Workspace};

pub use pmem_fd::{Durability, PAGE_SIZE};
