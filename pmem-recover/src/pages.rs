//! Restoring variables from the memory logs of committed pages.
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use pmem_pages::{
    lookup_name, memlog_name, read_log, read_lookup, Config, LookupInfo, VarMap, PAGE_SIZE,
};

/// The recovery view of a log directory: lookup records and variable names.
pub struct PageRecovery {
    dir: PathBuf,
    lookup: Vec<LookupInfo>,
    varmap: VarMap,
    /// Completeness of every memory log read so far.
    complete: HashMap<(u32, u64), bool>,
}

impl PageRecovery {
    pub fn open(config: &Config) -> io::Result<Self> {
        let dir = config.log_dir();
        let lookup = read_lookup(&dir.join(lookup_name(config.kind)))?;
        let varmap = VarMap::load_dir(&dir)?;

        tracing::debug!(
            dir = ?dir,
            pages = lookup.len(),
            vars = varmap.len(),
            "recovery metadata loaded"
        );

        Ok(PageRecovery {
            dir,
            lookup,
            varmap,
            complete: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn lookup(&self, page: usize) -> Option<LookupInfo> {
        self.lookup.get(page).copied()
    }

    /// Restore up to `size` bytes of the variable `name` into `dest`.
    ///
    /// Returns the number of bytes restored, zero if the variable is unknown. Bytes on pages that
    /// were never committed are left as they are and not counted.
    pub fn recover(&mut self, dest: &mut [u8], size: usize, name: &str) -> usize {
        let Some(location) = self.varmap.get(name) else {
            tracing::warn!(name, "no such variable");
            return 0;
        };

        let entry = location.resolve(size);
        let size = size.min(entry.size).min(dest.len());
        let start = entry.offset();

        let mut restored = 0;
        let mut at = 0;
        while at < size {
            let pos = start + at;
            let page = pos / PAGE_SIZE;
            let within = pos % PAGE_SIZE;
            let chunk = (PAGE_SIZE - within).min(size - at);

            if self.read_page(page, within, &mut dest[at..at + chunk]) {
                restored += chunk;
            }
            at += chunk;
        }

        if restored != size {
            tracing::warn!(name, restored, expected = size, "variable restored partially");
        }

        restored
    }

    /// Restore every committed page into an image of the store.
    pub fn recover_image(&mut self, image: &mut [u8]) -> usize {
        let pages = (image.len() / PAGE_SIZE).min(self.lookup.len());
        let mut restored = 0;
        for page in 0..pages {
            if self.read_page(page, 0, &mut image[page * PAGE_SIZE..][..PAGE_SIZE]) {
                restored += 1;
            }
        }

        restored
    }

    /// Copy part of the logged image of `page`. False if the page has no usable image.
    fn read_page(&mut self, page: usize, within: usize, dest: &mut [u8]) -> bool {
        let Some(info) = self.lookup.get(page).copied() else {
            tracing::warn!(page, "page is not in the lookup table");
            return false;
        };

        if !info.dirtied {
            return false;
        }

        let path = self.dir.join(memlog_name(info.thread, info.xact));
        if !self.is_complete(info.thread, info.xact, &path) {
            tracing::warn!(page, path = ?path, "memory log is truncated");
            return false;
        }

        let read = File::open(&path)
            .and_then(|file| file.read_exact_at(dest, info.offset + within as u64));

        match read {
            Ok(()) => {
                tracing::trace!(page, xact = info.xact, "page restored");
                true
            }
            Err(err) => {
                tracing::warn!(page, path = ?path, %err, "cannot read memory log");
                false
            }
        }
    }

    fn is_complete(&mut self, tid: u32, xact: u64, path: &Path) -> bool {
        *self
            .complete
            .entry((tid, xact))
            .or_insert_with(|| read_log(path).map_or(false, |log| log.complete))
    }
}
