//! Names of persistent variables and where they live in the image.
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use pmem_fd::PAGE_SIZE;

/// A variable of `size` bytes at `page_offset` within page `page_no`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarEntry {
    pub size: usize,
    pub page_no: usize,
    pub page_offset: usize,
}

impl VarEntry {
    pub fn at(offset: usize, size: usize) -> Self {
        VarEntry {
            size,
            page_no: offset / PAGE_SIZE,
            page_offset: offset % PAGE_SIZE,
        }
    }

    pub fn offset(&self) -> usize {
        self.page_no * PAGE_SIZE + self.page_offset
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarLocation {
    Paged(VarEntry),
    /// An old entry `name:hexaddr`, with the address relative to the start of the image.
    Legacy { addr: u64 },
}

impl VarLocation {
    /// The entry, with `size` filled in for legacy entries that do not record one.
    pub fn resolve(self, size: usize) -> VarEntry {
        match self {
            VarLocation::Paged(entry) => entry,
            VarLocation::Legacy { addr } => VarEntry::at(addr as usize, size),
        }
    }
}

fn parse_paged(size: &str, page_no: &str, page_offset: &str) -> Option<VarLocation> {
    Some(VarLocation::Paged(VarEntry {
        size: size.parse().ok()?,
        page_no: page_no.parse().ok()?,
        page_offset: page_offset.parse().ok()?,
    }))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VarMap {
    vars: BTreeMap<String, VarLocation>,
}

impl VarMap {
    pub fn new() -> Self {
        VarMap::default()
    }

    pub fn insert(&mut self, name: &str, entry: VarEntry) {
        self.vars.insert(name.to_owned(), VarLocation::Paged(entry));
    }

    pub fn get(&self, name: &str) -> Option<VarLocation> {
        self.vars.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, VarLocation)> {
        self.vars.iter().map(|(name, loc)| (name.as_str(), *loc))
    }

    /// Parse lines `name:size:pageNo:pageOffset` or `name:hexaddr`. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut map = VarMap::new();
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let fields: Vec<&str> = line.split(':').collect();
            let location = match fields[..] {
                [_, size, page_no, page_offset] => parse_paged(size, page_no, page_offset),
                [_, addr] => {
                    let addr = addr.trim_start_matches("0x");
                    u64::from_str_radix(addr, 16)
                        .ok()
                        .map(|addr| VarLocation::Legacy { addr })
                }
                _ => None,
            };

            match location {
                Some(location) if !fields[0].is_empty() => {
                    map.vars.insert(fields[0].to_owned(), location);
                }
                _ => tracing::warn!(line, "malformed var map line"),
            }
        }

        map
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for (name, location) in &self.vars {
            let line = match location {
                VarLocation::Paged(entry) => {
                    format!("{name}:{}:{}:{}\n", entry.size, entry.page_no, entry.page_offset)
                }
                VarLocation::Legacy { addr } => format!("{name}:{addr:x}\n"),
            };
            text.push_str(&line);
        }

        text
    }

    /// Replace the file at `path`, durably.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        file.write_all(self.to_text().as_bytes())?;
        file.sync_data()
    }

    /// Merge every file in `dir` with `varmap` in its name.
    pub fn load_dir(dir: &Path) -> io::Result<Self> {
        let mut map = VarMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let is_varmap = entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.contains("varmap"));

            if !is_varmap || !entry.file_type()?.is_file() {
                continue;
            }

            match std::fs::read_to_string(entry.path()) {
                Ok(text) => map.vars.extend(VarMap::parse(&text).vars),
                Err(err) => {
                    tracing::warn!(path = ?entry.path(), %err, "skipping unreadable variable map");
                }
            }
        }

        Ok(map)
    }
}
