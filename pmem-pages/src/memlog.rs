//! Per-transaction page logs, written before the persistent mapping changes.
//!
//! A log is a file `MemLog_<tid>_<xact>` in the log directory holding a sequence of records
//! `page_no (u64 LE) ++ image` followed by a sentinel record. A log without the sentinel was cut
//! short by a crash and its transaction never reached the persistent mapping in full.
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use pmem_fd::PAGE_SIZE;

use crate::PageError;

const SENTINEL_PAGE: u64 = u64::MAX;
const SENTINEL: &[u8; 8] = b"PMEMLOG\0";
const RECORD: usize = 8 + PAGE_SIZE;
const ATTEMPTS: usize = 3;

pub fn memlog_name(tid: u32, xact: u64) -> String {
    format!("MemLog_{tid}_{xact}")
}

/// Split a log file name into its thread and transaction.
pub fn parse_memlog_name(name: &str) -> Option<(u32, u64)> {
    let rest = name.strip_prefix("MemLog_")?;
    let (tid, xact) = rest.split_once('_')?;
    Some((tid.parse().ok()?, xact.parse().ok()?))
}

/// Writes the page logs of one thread.
pub struct MemoryLogger {
    dir: PathBuf,
    tid: u32,
    open: Option<OpenLog>,
}

struct OpenLog {
    file: File,
    path: PathBuf,
    xact: u64,
    offset: u64,
}

impl MemoryLogger {
    pub fn new(dir: impl Into<PathBuf>, tid: u32) -> Self {
        MemoryLogger {
            dir: dir.into(),
            tid,
            open: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// The transaction of the currently open log.
    pub fn xact(&self) -> Option<u64> {
        self.open.as_ref().map(|log| log.xact)
    }

    pub fn path(&self) -> Option<&Path> {
        self.open.as_ref().map(|log| log.path.as_path())
    }

    /// Start the log of transaction `xact`, replacing any leftover file of the same name.
    pub fn open(&mut self, xact: u64) -> Result<(), PageError> {
        let path = self.dir.join(memlog_name(self.tid, xact));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| PageError::LogWrite {
                path: path.clone(),
                source,
            })?;

        tracing::trace!(tid = self.tid, xact, "memory log opened");
        self.open = Some(OpenLog {
            file,
            path,
            xact,
            offset: 0,
        });

        Ok(())
    }

    /// Append the image of a page, returning the offset of the image in the log.
    pub fn append(&mut self, page_no: u64, image: &[u8]) -> Result<u64, PageError> {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        let log = self.open.as_mut().ok_or_else(not_open)?;

        let mut record = Vec::with_capacity(RECORD);
        record.extend_from_slice(&page_no.to_le_bytes());
        record.extend_from_slice(image);

        let at = log.offset;
        log.write_all_at(&record, at)?;
        log.offset += record.len() as u64;
        Ok(at + 8)
    }

    /// Finish the log: its contents are durable before the sentinel is, and the sentinel is
    /// durable on return.
    pub fn close(&mut self) -> Result<(), PageError> {
        let Some(mut log) = self.open.take() else {
            return Ok(());
        };

        log.sync()?;

        let mut record = [0u8; 16];
        record[..8].copy_from_slice(&SENTINEL_PAGE.to_le_bytes());
        record[8..].copy_from_slice(SENTINEL);
        let at = log.offset;
        log.write_all_at(&record, at)?;
        log.sync()?;

        tracing::trace!(tid = self.tid, xact = log.xact, bytes = at + 16, "memory log closed");
        Ok(())
    }
}

impl OpenLog {
    /// Write with bounded retries, reopening the file after each failure.
    fn write_all_at(&mut self, bytes: &[u8], at: u64) -> Result<(), PageError> {
        let mut last = None;
        for attempt in 0..ATTEMPTS {
            match self.file.write_all_at(bytes, at) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(path = ?self.path, attempt, %err, "memory log write failed");
                    last = Some(err);
                }
            }

            match OpenOptions::new().write(true).open(&self.path) {
                Ok(file) => self.file = file,
                Err(err) => last = Some(err),
            }
        }

        Err(PageError::LogWrite {
            path: self.path.clone(),
            source: last.unwrap_or_else(|| io::ErrorKind::WriteZero.into()),
        })
    }

    fn sync(&self) -> Result<(), PageError> {
        self.file.sync_data().map_err(|source| PageError::LogWrite {
            path: self.path.clone(),
            source,
        })
    }
}

fn not_open() -> PageError {
    io::Error::new(io::ErrorKind::NotConnected, "no memory log is open").into()
}

/// One logged page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub page_no: u64,
    /// Offset of the image in the file.
    pub offset: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogContents {
    pub records: Vec<LogRecord>,
    /// Whether the sentinel was found after the records.
    pub complete: bool,
}

/// Scan the records of a log file.
pub fn read_log(path: &Path) -> io::Result<LogContents> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut contents = LogContents::default();
    let mut at = 0;
    while bytes.len() - at >= 8 {
        let mut word = [0; 8];
        word.copy_from_slice(&bytes[at..at + 8]);
        let page_no = u64::from_le_bytes(word);

        if page_no == SENTINEL_PAGE {
            contents.complete = bytes.get(at + 8..at + 16) == Some(&SENTINEL[..]);
            break;
        }

        if bytes.len() - at < RECORD {
            break;
        }

        contents.records.push(LogRecord {
            page_no,
            offset: (at + 8) as u64,
        });
        at += RECORD;
    }

    Ok(contents)
}

/// The largest transaction of any log in `dir`, zero if there is none.
pub fn last_xact(dir: &Path) -> io::Result<u64> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut last = 0;
    for entry in entries {
        let entry = entry?;
        if let Some((_, xact)) = entry.file_name().to_str().and_then(parse_memlog_name) {
            last = last.max(xact);
        }
    }

    Ok(last)
}

/// All logs in `dir` as `(tid, xact, path)`, ordered by transaction.
pub fn memlogs(dir: &Path) -> io::Result<Vec<(u32, u64, PathBuf)>> {
    let mut logs = vec![];
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some((tid, xact)) = entry.file_name().to_str().and_then(parse_memlog_name) {
            logs.push((tid, xact, entry.path()));
        }
    }

    logs.sort_by_key(|&(tid, xact, _)| (xact, tid));
    Ok(logs)
}
