//! Detecting that a previous run did not shut down cleanly.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const RUNNING: &str = "_running";
const CRASHED: &str = "_crashed";

/// Marker files in the log directory of a program.
///
/// `_running` exists while the program runs. Finding it at start means the last run never
/// reached [`CrashFlags::finalize`], and `_crashed` is created so the fact survives until the
/// recovered run finishes in turn.
#[derive(Debug)]
pub struct CrashFlags {
    dir: PathBuf,
    crashed: bool,
}

impl CrashFlags {
    pub fn initialize(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let crashed = Self::is_flagged(dir);

        if crashed {
            touch(&dir.join(CRASHED))?;
            tracing::warn!(dir = ?dir, "previous run did not finish");
        } else {
            touch(&dir.join(RUNNING))?;
        }

        Ok(CrashFlags {
            dir: dir.to_owned(),
            crashed,
        })
    }

    /// Whether a run in `dir` is active or crashed, without claiming the directory.
    pub fn is_flagged(dir: &Path) -> bool {
        dir.join(RUNNING).exists() || dir.join(CRASHED).exists()
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// Record a clean shutdown.
    pub fn finalize(self) -> io::Result<()> {
        for name in [CRASHED, RUNNING] {
            match std::fs::remove_file(self.dir.join(name)) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
                _ => {}
            }
        }

        Ok(())
    }
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn touch(path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    file.sync_all()
}

/// A table of running executables and their instance ids.
///
/// Each line is `<instance id> <absolute path>`. An executable still listed when it starts again
/// crashed in its previous run.
#[derive(Debug)]
pub struct CrashRegistry {
    path: PathBuf,
    entries: BTreeMap<PathBuf, u64>,
}

impl CrashRegistry {
    pub fn open(path: &Path) -> io::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err),
        };

        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let parsed = line
                .split_once(' ')
                .and_then(|(id, exe)| Some((id.parse::<u64>().ok()?, exe)));

            match parsed {
                Some((id, exe)) if !exe.is_empty() => {
                    entries.insert(PathBuf::from(exe), id);
                }
                _ => tracing::warn!(line, "malformed crash registry line"),
            }
        }

        Ok(CrashRegistry {
            path: path.to_owned(),
            entries,
        })
    }

    /// The instance id of `exe` if its last run did not unregister.
    pub fn was_running(&self, exe: &Path) -> Option<u64> {
        let exe = absolute(exe).ok()?;
        self.entries.get(&exe).copied()
    }

    /// Register a start of `exe`. A crashed instance keeps its id.
    pub fn register(&mut self, exe: &Path) -> io::Result<u64> {
        let exe = absolute(exe)?;
        if let Some(id) = self.entries.get(&exe) {
            return Ok(*id);
        }

        let id = self.entries.values().max().map_or(1, |id| id + 1);
        self.entries.insert(exe, id);
        self.store()?;
        Ok(id)
    }

    /// Remove `exe` on clean shutdown. Returns whether it was registered.
    pub fn unregister(&mut self, exe: &Path) -> io::Result<bool> {
        let exe = absolute(exe)?;
        if self.entries.remove(&exe).is_none() {
            return Ok(false);
        }

        self.store()?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the file atomically.
    fn store(&self) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        for (exe, id) in &self.entries {
            writeln!(file, "{id} {}", exe.display())?;
        }

        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}
