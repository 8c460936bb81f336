//! The durable log of a crash-consistent persistent memory program.
//!
//! Every thread appends the synchronization operations it performs, and the stores it makes to
//! persistent memory, to its own list of entries in a shared, mapped log region. After a crash
//! these lists are what recovery replays, in an order consistent with the recorded
//! acquire/release pairs.
//!
//! ## Retiring the log
//!
//! The log would grow without bound. The [`Collector`] periodically proves which outermost
//! critical sections are no longer needed: a section is kept as long as one of the releases it
//! observed can not be resolved to a closed section (or to a release collected earlier), and as
//! long as any section it depends on is kept. Everything before the first kept section of a
//! thread is excised by swinging the shared header pointer to a new list of log structures.
//!
//! Slots are addressed by [`Handle`]s carrying a generation so that a thread racing with the
//! collector observes a freed entry as stale instead of reading its reused slot.
mod arena;
mod entry;
mod error;
mod gc;
mod graph;
mod log;
mod owner;

#[cfg(test)]
mod tests;

pub use arena::{LogRegion, SLOT_BYTES};
pub use entry::{EntryKind, Handle, LogEntry, LogStructure, PersistentAddr};
pub use error::{GcError, LogError};
pub use gc::{create_ocs_marker, Collector, GcHandle, GcRound, OcsMarker};
pub use graph::{DependencyGraph, NodeId};
pub use log::{DurableLog, Entries, LogStats, ThreadLog};
pub use owner::{LockSet, OwnerSnapshot, OwnerTable, TAB_SIZE};
