//! Slots of the log region and their allocation.
//!
//! The region is an array of 64 byte slots, each eight atomic little-endian words. Slot `0` is the
//! header, all others are log entries, log structures or data chunks. Every slot starts with a
//! meta word of `generation << 32 | tag << 8 | state`; an entry is written completely before its
//! meta word is stored, and the meta word is what freeing changes. Readers compare the meta word
//! before and after copying a slot so a concurrently freed slot is observed as such.
use core::sync::atomic::{fence, AtomicU64, Ordering};
use std::{fs::File, io, path::Path};

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use pmem_fd::persist_range;

use crate::entry::Handle;
use crate::error::LogError;

pub const SLOT_WORDS: usize = 8;
pub const SLOT_BYTES: usize = SLOT_WORDS * 8;

pub(crate) const MAGIC: u64 = u64::from_le_bytes(*b"PMEMLOG1");

const H_MAGIC: usize = 0;
const H_HEAD: usize = 1;
const H_HIGH: usize = 2;
const H_SLOTS: usize = 3;

pub(crate) const W_META: usize = 0;
pub(crate) const W_ADDR: usize = 1;
pub(crate) const W_VALUE: usize = 2;
pub(crate) const W_SIZE: usize = 3;
pub(crate) const W_NEXT: usize = 4;
pub(crate) const W_TID: usize = 5;

pub(crate) const TAG_STRUCTURE: u8 = 12;
pub(crate) const TAG_DATA: u8 = 13;

/// Words of a data chunk that carry payload, the others are meta and next.
pub(crate) const DATA_WORDS: [usize; 6] = [1, 2, 3, 5, 6, 7];
pub(crate) const DATA_BYTES: usize = DATA_WORDS.len() * 8;

const LIVE: u64 = 1;

/// The memory holding a log.
///
/// Either a shared file mapping, which is what makes the log survive a crash, or plain memory for
/// tests and tools which only need the structure.
pub struct LogRegion {
    backing: Backing,
}

enum Backing {
    Memory(Box<[AtomicU64]>),
    Map(MmapRaw),
}

impl LogRegion {
    pub fn in_memory(slots: u32) -> Self {
        let words = (0..slots as usize * SLOT_WORDS)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>();

        LogRegion {
            backing: Backing::Memory(words.into_boxed_slice()),
        }
    }

    /// Create, or truncate, a log file with room for `slots` slots and map it.
    pub fn create(path: &Path, slots: u32) -> Result<Self, LogError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(u64::from(slots) * SLOT_BYTES as u64)?;
        Self::from_file(&file)
    }

    /// Map an existing log file.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Self::from_file(&file)
    }

    /// Map the whole of `file`, which must span at least two slots.
    pub fn from_file(file: &File) -> Result<Self, LogError> {
        let len = file.metadata()?.len();

        if len % SLOT_BYTES as u64 != 0 || len < 2 * SLOT_BYTES as u64 {
            return Err(LogError::BadLayout {
                header: 0,
                region: len / SLOT_BYTES as u64,
            });
        }

        let len = usize::try_from(len).map_err(|_| LogError::BadLayout {
            header: 0,
            region: len / SLOT_BYTES as u64,
        })?;

        let map = MmapOptions::new().len(len).map_raw(file)?;
        Ok(LogRegion {
            backing: Backing::Map(map),
        })
    }

    fn words(&self) -> &[AtomicU64] {
        match &self.backing {
            Backing::Memory(words) => words,
            Backing::Map(map) => {
                let ptr = map.as_ptr() as *const AtomicU64;
                // Safety: the mapping is page aligned, as long as `self`, and only ever accessed
                // through atomics by this process.
                unsafe { core::slice::from_raw_parts(ptr, map.len() / 8) }
            }
        }
    }

    pub fn slot_capacity(&self) -> u32 {
        u32::try_from(self.words().len() / SLOT_WORDS).unwrap_or(u32::MAX)
    }

    pub(crate) fn word(&self, slot: u32, word: usize) -> &AtomicU64 {
        &self.words()[slot as usize * SLOT_WORDS + word]
    }

    /// Write back one slot to the medium.
    pub(crate) fn persist(&self, slot: u32) {
        let ptr = self.word(slot, 0) as *const AtomicU64 as *const u8;
        persist_range(ptr, SLOT_BYTES);
    }

    /// Synchronously flush the whole region.
    pub fn sync(&self) -> io::Result<()> {
        match &self.backing {
            Backing::Memory(_) => Ok(()),
            Backing::Map(map) => map.flush(),
        }
    }
}

/// Allocation of slots of a region.
pub(crate) struct Arena {
    region: LogRegion,
    free: Mutex<Vec<u32>>,
}

impl Arena {
    /// Initialize a fresh header, discarding all previous content.
    pub(crate) fn init(region: LogRegion) -> Result<Self, LogError> {
        let slots = region.slot_capacity();
        if slots < 2 {
            return Err(LogError::BadLayout {
                header: 0,
                region: u64::from(slots),
            });
        }

        for slot in 1..slots {
            for word in 0..SLOT_WORDS {
                region.word(slot, word).store(0, Ordering::Relaxed);
            }
        }

        region.word(0, H_HEAD).store(0, Ordering::Relaxed);
        region.word(0, H_HIGH).store(1, Ordering::Relaxed);
        region.word(0, H_SLOTS).store(u64::from(slots), Ordering::Relaxed);
        region.word(0, H_MAGIC).store(MAGIC, Ordering::Release);
        region.persist(0);
        region.sync()?;

        Ok(Arena {
            region,
            free: Mutex::new(Vec::new()),
        })
    }

    /// Attach to an initialized header.
    ///
    /// The free list is rebuilt from all slots below the high water mark which are not live.
    pub(crate) fn attach(region: LogRegion) -> Result<Self, LogError> {
        if region.word(0, H_MAGIC).load(Ordering::Acquire) != MAGIC {
            return Err(LogError::BadMagic);
        }

        let slots = region.word(0, H_SLOTS).load(Ordering::Relaxed);
        let high = region.word(0, H_HIGH).load(Ordering::Relaxed);
        if slots != u64::from(region.slot_capacity()) || high == 0 || high > slots {
            return Err(LogError::BadLayout {
                header: slots,
                region: u64::from(region.slot_capacity()),
            });
        }

        let free = (1..high as u32)
            .filter(|&idx| region.word(idx, W_META).load(Ordering::Relaxed) & 0xff != LIVE)
            .collect();

        Ok(Arena {
            region,
            free: Mutex::new(free),
        })
    }

    pub(crate) fn region(&self) -> &LogRegion {
        &self.region
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.region.slot_capacity()
    }

    pub(crate) fn high_water(&self) -> u32 {
        self.region.word(0, H_HIGH).load(Ordering::Acquire) as u32
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn header(&self) -> Handle {
        Handle::from_word(self.region.word(0, H_HEAD).load(Ordering::Acquire))
    }

    pub(crate) fn cas_header(&self, old: Handle, new: Handle) -> bool {
        let swapped = self
            .region
            .word(0, H_HEAD)
            .compare_exchange(old.to_word(), new.to_word(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if swapped {
            self.region.persist(0);
        }

        swapped
    }

    pub(crate) fn alloc(&self) -> Result<u32, LogError> {
        if let Some(idx) = self.free.lock().pop() {
            return Ok(idx);
        }

        let high = self.region.word(0, H_HIGH);
        let capacity = u64::from(self.capacity());
        let mut current = high.load(Ordering::Acquire);
        loop {
            if current >= capacity {
                return Err(LogError::Exhausted(self.capacity()));
            }

            match high.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.region.persist(0);
                    return Ok(current as u32);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return an allocated but never published slot.
    pub(crate) fn unalloc(&self, index: u32) {
        self.free.lock().push(index);
    }

    /// Fill an allocated slot and make it live.
    ///
    /// `words[i]` is stored to word `i + 1`. The slot is written back before this returns.
    pub(crate) fn publish(&self, index: u32, tag: u8, words: [u64; SLOT_WORDS - 1]) -> Handle {
        let generation = (self.region.word(index, W_META).load(Ordering::Acquire) >> 32) as u32;

        for (i, &word) in words.iter().enumerate() {
            self.region.word(index, i + 1).store(word, Ordering::Relaxed);
        }

        let meta = u64::from(generation) << 32 | u64::from(tag) << 8 | LIVE;
        self.region.word(index, W_META).store(meta, Ordering::Release);
        self.region.persist(index);

        Handle { index, generation }
    }

    fn live_meta(&self, handle: Handle) -> Option<u64> {
        if handle.is_null() || handle.index >= self.capacity() {
            return None;
        }

        let meta = self.region.word(handle.index, W_META).load(Ordering::Acquire);
        if meta & 0xff == LIVE && (meta >> 32) as u32 == handle.generation {
            Some(meta)
        } else {
            None
        }
    }

    pub(crate) fn is_live(&self, handle: Handle) -> bool {
        self.live_meta(handle).is_some()
    }

    /// Copy out a live slot, returning its tag and words.
    pub(crate) fn read(&self, handle: Handle) -> Option<(u8, [u64; SLOT_WORDS])> {
        let meta = self.live_meta(handle)?;
        let mut words = [0; SLOT_WORDS];
        words[W_META] = meta;
        for (i, word) in words.iter_mut().enumerate().skip(1) {
            *word = self.region.word(handle.index, i).load(Ordering::Acquire);
        }

        fence(Ordering::Acquire);
        if self.region.word(handle.index, W_META).load(Ordering::Relaxed) != meta {
            return None;
        }

        Some(((meta >> 8) as u8, words))
    }

    pub(crate) fn next(&self, handle: Handle) -> Option<Handle> {
        self.live_meta(handle)?;
        let next = self.region.word(handle.index, W_NEXT).load(Ordering::Acquire);
        Handle::from_word(next).non_null()
    }

    /// Link a successor. The successor must already be published.
    pub(crate) fn set_next(&self, handle: Handle, next: Handle) {
        self.region
            .word(handle.index, W_NEXT)
            .store(next.to_word(), Ordering::Release);
        self.region.persist(handle.index);
    }

    #[cfg(test)]
    pub(crate) fn overwrite(&self, handle: Handle, word: usize, value: u64) {
        self.region.word(handle.index, word).store(value, Ordering::Release);
    }

    /// Free a live slot, bumping its generation.
    ///
    /// Returns `false` if the handle was already stale.
    pub(crate) fn free(&self, handle: Handle) -> bool {
        let Some(meta) = self.live_meta(handle) else {
            return false;
        };

        self.release_slot(handle.index, meta)
    }

    /// Free a live slot regardless of the generation, for slots that are unreachable.
    pub(crate) fn free_index(&self, index: u32) -> bool {
        let meta = self.region.word(index, W_META).load(Ordering::Acquire);
        if meta & 0xff != LIVE {
            return false;
        }

        self.release_slot(index, meta)
    }

    fn release_slot(&self, index: u32, meta: u64) -> bool {
        let generation = ((meta >> 32) as u32).wrapping_add(1);
        let dead = u64::from(generation) << 32;

        if self
            .region
            .word(index, W_META)
            .compare_exchange(meta, dead, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        for word in 1..SLOT_WORDS {
            self.region.word(index, word).store(0, Ordering::Relaxed);
        }

        self.region.persist(index);
        self.free.lock().push(index);
        true
    }
}

#[test]
fn generations_detect_reuse() {
    let arena = Arena::init(LogRegion::in_memory(4)).unwrap();
    let idx = arena.alloc().unwrap();
    let first = arena.publish(idx, 1, [0; 7]);
    assert!(arena.is_live(first));

    assert!(arena.free(first));
    assert!(!arena.free(first));
    assert!(!arena.is_live(first));

    let idx = arena.alloc().unwrap();
    assert_eq!(idx, first.index);
    let second = arena.publish(idx, 1, [0; 7]);
    assert_ne!(first, second);
    assert!(arena.read(first).is_none());
    assert!(arena.read(second).is_some());
}

#[test]
fn exhaustion_is_an_error() {
    let arena = Arena::init(LogRegion::in_memory(3)).unwrap();
    assert_eq!(arena.alloc().unwrap(), 1);
    assert_eq!(arena.alloc().unwrap(), 2);
    assert!(matches!(arena.alloc(), Err(LogError::Exhausted(3))));
}
