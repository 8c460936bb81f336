use std::io;
use std::path::PathBuf;

use pmem_fd::{Durability, PAGE_SIZE};

/// Which lookup table a store records its pages in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HeapKind {
    #[default]
    Heap,
    Globals,
}

impl HeapKind {
    /// Suffix of the metadata files, `lookup_<suffix>` and friends.
    pub fn suffix(self) -> &'static str {
        match self {
            HeapKind::Heap => "heap",
            HeapKind::Globals => "globals",
        }
    }
}

/// Where memory logs and recovery metadata are written.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum LogDestination {
    /// The working directory, on a local drive.
    #[default]
    Disk,
    /// A DRAM backed tmpfs mounted at `/mnt/tmpfs/`.
    DramTmpfs,
    /// A tmpfs on NVM backed memory.
    Nvram(PathBuf),
    Directory(PathBuf),
}

impl LogDestination {
    pub fn dir(&self) -> PathBuf {
        match self {
            LogDestination::Disk => PathBuf::from("./"),
            LogDestination::DramTmpfs => PathBuf::from("/mnt/tmpfs/"),
            LogDestination::Nvram(path) | LogDestination::Directory(path) => path.clone(),
        }
    }

    /// Parse `disk`, `dram_tmpfs`, `nvram:<path>` or `dir:<path>`.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "disk" => LogDestination::Disk,
            "dram_tmpfs" => LogDestination::DramTmpfs,
            other => {
                if let Some(path) = other.strip_prefix("nvram:") {
                    LogDestination::Nvram(path.into())
                } else if let Some(path) = other.strip_prefix("dir:") {
                    LogDestination::Directory(path.into())
                } else {
                    return None;
                }
            }
        })
    }
}

/// Configuration of a [`PageStore`](crate::PageStore).
#[derive(Clone, Debug)]
pub struct Config {
    /// The file holding the persistent image.
    pub backing_file: PathBuf,
    /// Size of the image in pages of 4096 bytes.
    pub pages: usize,
    pub kind: HeapKind,
    pub log_destination: LogDestination,
    /// How an update of the persistent mapping is made durable.
    pub durability: Durability,
    /// Keep pages owned by a single thread dirty across commits until another thread needs them.
    pub lazy_commit: bool,
    /// Append stores to the durable log of the thread, if the store has one.
    pub entry_logging: bool,
    /// The region id used in logged addresses.
    pub region: u16,
    /// Failed `try_lock` attempts before a waiting thread yields.
    pub trylock_spins: u32,
}

pub const PMEM_LOG_DEST: &str = "PMEM_LOG_DEST";
pub const PMEM_DURABILITY: &str = "PMEM_DURABILITY";

impl Default for Config {
    fn default() -> Self {
        Config {
            backing_file: PathBuf::from("pmem.img"),
            pages: 256,
            kind: HeapKind::Heap,
            log_destination: LogDestination::Disk,
            durability: Durability::Msync,
            lazy_commit: false,
            entry_logging: true,
            region: 1,
            trylock_spins: 64,
        }
    }
}

impl Config {
    pub fn log_dir(&self) -> PathBuf {
        self.log_destination.dir()
    }

    pub fn image_len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn validate(&self) -> io::Result<()> {
        fn invalid(msg: &str) -> io::Error {
            io::Error::new(io::ErrorKind::InvalidInput, msg)
        }

        if self.pages == 0 {
            return Err(invalid("a store needs at least one page"));
        }

        if self.pages.checked_mul(PAGE_SIZE).is_none() || self.pages > u32::MAX as usize {
            return Err(invalid("store size overflows"));
        }

        if self.backing_file.as_os_str().is_empty() {
            return Err(invalid("no backing file"));
        }

        if let LogDestination::Nvram(path) | LogDestination::Directory(path) = &self.log_destination {
            if path.as_os_str().is_empty() {
                return Err(invalid("empty log directory"));
            }
        }

        Ok(())
    }

    /// Apply `PMEM_LOG_DEST` and `PMEM_DURABILITY` from the environment.
    pub fn from_env(mut self) -> io::Result<Self> {
        if let Ok(dest) = std::env::var(PMEM_LOG_DEST) {
            self.log_destination = LogDestination::parse(&dest).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{PMEM_LOG_DEST}: unknown destination {dest:?}"),
                )
            })?;
        }

        if let Ok(method) = std::env::var(PMEM_DURABILITY) {
            self.durability = Durability::from_name(&method).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{PMEM_DURABILITY}: unknown method {method:?}"),
                )
            })?;
        }

        Ok(self)
    }
}

#[test]
fn destinations_parse() {
    assert_eq!(LogDestination::parse("disk"), Some(LogDestination::Disk));
    assert_eq!(LogDestination::parse("dram_tmpfs").map(|d| d.dir()), Some("/mnt/tmpfs/".into()));
    assert_eq!(
        LogDestination::parse("nvram:/mnt/pmem0"),
        Some(LogDestination::Nvram("/mnt/pmem0".into()))
    );
    assert_eq!(LogDestination::parse("tape"), None);
}

#[test]
fn validate_rejects_empty_store() {
    let config = Config {
        pages: 0,
        ..Config::default()
    };

    let err = config.validate().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    assert!(Config::default().validate().is_ok());
}
