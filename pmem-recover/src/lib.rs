//! Recovery after a crash of a persistent memory program.
//!
//! Two independent paths lead back to a consistent state:
//!
//! - [`PageRecovery`] restores named variables from the memory logs that page commits wrote. The
//!   lookup table points every committed page at the log holding its newest image, so restoring
//!   is a lookup and a read.
//! - [`Replayer`] replays a durable log of stores and synchronization into the persistent regions,
//!   ordering the writes of all threads by the acquire/release pairs they recorded.
//!
//! Whether recovery is needed at all is told by the [`CrashFlags`] of the log directory or by the
//! [`CrashRegistry`] of running executables.
mod crash;
mod error;
mod pages;
mod region;
mod replay;

#[cfg(test)]
mod tests;

pub use crash::{CrashFlags, CrashRegistry};
pub use error::RecoverError;
pub use pages::PageRecovery;
pub use region::{region_name, RegionMap};
pub use replay::{ReplayStats, ReplayTarget, Replayer};
