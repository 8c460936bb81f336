//! Where the last committed image of each page can be found after a crash.
//!
//! Commits record into a buffer table first. The buffered records move to the real table when
//! the committing thread leaves its outermost section, so recovery never sees a page image from
//! the middle of a section.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapRaw;
use parking_lot::Mutex;

use crate::config::HeapKind;

/// Words per record in a lookup table.
const RECORD_WORDS: usize = 4;

/// The location of the newest logged image of a page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LookupInfo {
    pub xact: u64,
    pub thread: u32,
    /// Offset of the page image in the memory log of `(thread, xact)`.
    pub offset: u64,
    pub dirtied: bool,
}

impl LookupInfo {
    fn to_words(self) -> [u64; RECORD_WORDS] {
        [self.xact, u64::from(self.thread), self.offset, u64::from(self.dirtied)]
    }

    fn from_words(words: [u64; RECORD_WORDS]) -> Self {
        LookupInfo {
            xact: words[0],
            thread: words[1] as u32,
            offset: words[2],
            dirtied: words[3] != 0,
        }
    }
}

pub fn lookup_name(kind: HeapKind) -> String {
    format!("lookup_{}", kind.suffix())
}

/// A file of words, shared through a mapping.
struct WordFile {
    map: MmapRaw,
    _file: File,
    len: usize,
}

impl WordFile {
    fn create(path: &Path, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len((len * 8) as u64)?;
        let map = MmapRaw::map_raw(&file)?;
        Ok(WordFile {
            map,
            _file: file,
            len,
        })
    }

    fn words(&self) -> &[AtomicU64] {
        // Safety: the mapping is page aligned, `len` words long and lives as long as `self`.
        unsafe { core::slice::from_raw_parts(self.map.as_ptr() as *const AtomicU64, self.len) }
    }

    fn record(&self, page: usize) -> LookupInfo {
        let words = &self.words()[page * RECORD_WORDS..][..RECORD_WORDS];
        LookupInfo::from_words(core::array::from_fn(|i| words[i].load(Ordering::Acquire)))
    }

    fn set_record(&self, page: usize, info: LookupInfo) {
        let words = &self.words()[page * RECORD_WORDS..][..RECORD_WORDS];
        for (word, value) in words.iter().zip(info.to_words()) {
            word.store(value, Ordering::Release);
        }
    }
}

/// The lookup table of a store with its buffer and page dependence.
pub struct LookupTable {
    pages: usize,
    path: PathBuf,
    real: WordFile,
    buffered: WordFile,
    /// Word zero is the count of buffered pages, the page numbers follow.
    pagenos: WordFile,
    /// The last thread, plus one, to log each page.
    dependence: WordFile,
    buffer: Mutex<()>,
}

impl LookupTable {
    /// Create empty tables for `pages` pages in `dir`.
    pub fn create(dir: &Path, kind: HeapKind, pages: usize) -> io::Result<Self> {
        let suffix = kind.suffix();
        let path = dir.join(lookup_name(kind));
        let real = WordFile::create(&path, pages * RECORD_WORDS)?;
        let buffered = WordFile::create(&dir.join(format!("lookup_{suffix}_tmp")), pages * RECORD_WORDS)?;
        let pagenos = WordFile::create(&dir.join(format!("pagenos_{suffix}_tmp")), pages + 1)?;
        let dependence = WordFile::create(&dir.join(format!("dependence_{suffix}")), pages)?;

        Ok(LookupTable {
            pages,
            path,
            real,
            buffered,
            pagenos,
            dependence,
            buffer: Mutex::new(()),
        })
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The committed record of a page.
    pub fn get(&self, page: usize) -> LookupInfo {
        self.real.record(page)
    }

    /// The buffered record of a page, not yet visible to recovery.
    pub fn buffered(&self, page: usize) -> LookupInfo {
        self.buffered.record(page)
    }

    /// Buffer the newest image of `page`.
    pub fn record_lookup(&self, page: usize, info: LookupInfo) {
        let _guard = self.buffer.lock();
        let fresh = !self.buffered.record(page).dirtied;
        self.buffered.set_record(page, info);

        if fresh {
            let count = &self.pagenos.words()[0];
            let at = count.load(Ordering::Relaxed) as usize;
            self.pagenos.words()[1 + at].store(page as u64, Ordering::Relaxed);
            count.store(at as u64 + 1, Ordering::Release);
        }
    }

    /// Note `tid` as the last thread to log `page`. Returns whether another thread was.
    pub fn record_dependence(&self, page: usize, tid: u32) -> bool {
        let previous = self.dependence.words()[page].swap(u64::from(tid) + 1, Ordering::AcqRel);
        previous != 0 && previous != u64::from(tid) + 1
    }

    /// Move all buffered records to the real table and forget page dependence.
    pub fn commit_buffer(&self) -> io::Result<usize> {
        let _guard = self.buffer.lock();
        let count = &self.pagenos.words()[0];
        let buffered = count.load(Ordering::Acquire) as usize;

        for slot in &self.pagenos.words()[1..1 + buffered] {
            let page = slot.load(Ordering::Relaxed) as usize;
            self.real.set_record(page, self.buffered.record(page));
            self.buffered.set_record(page, LookupInfo::default());
        }

        count.store(0, Ordering::Release);
        for word in self.dependence.words() {
            word.store(0, Ordering::Relaxed);
        }

        if buffered > 0 {
            self.real.map.flush()?;
            tracing::trace!(pages = buffered, "lookup buffer committed");
        }

        Ok(buffered)
    }
}

/// Read a lookup table written by a previous run.
pub fn read_lookup(path: &Path) -> io::Result<Vec<LookupInfo>> {
    let bytes = std::fs::read(path)?;
    let records = bytes
        .chunks_exact(RECORD_WORDS * 8)
        .map(|record| {
            LookupInfo::from_words(core::array::from_fn(|i| {
                let mut word = [0; 8];
                word.copy_from_slice(&record[i * 8..][..8]);
                u64::from_le_bytes(word)
            }))
        })
        .collect();

    Ok(records)
}
