use std::fmt::Display;
use std::io;
use std::path::PathBuf;

use pmem_fd::OsError;
use pmem_state::LogError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Os(#[from] OsError),
    #[error("durable log: {0}")]
    Log(#[from] LogError),
    /// An access outside of the store's image.
    #[error("range {offset:#x}+{len:#x} is outside of the store")]
    OutOfBounds { offset: usize, len: usize },
    /// Writing a memory log failed on every attempt.
    #[error("failed to write memory log {path:?}: {source}")]
    LogWrite { path: PathBuf, source: io::Error },
    /// Unlock of a section that was not entered.
    #[error("no section to leave")]
    NotInSection,
}

/// Terminate the process after an error that could leave durable state inconsistent.
pub fn fatal(what: &str, err: &dyn Display) -> ! {
    tracing::error!(%err, "{what}");
    eprintln!("pmem: fatal: {what}: {err}");
    std::process::abort()
}
