//! The durable log and the per-thread writers.
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{
    Arena, LogRegion, DATA_BYTES, DATA_WORDS, TAG_DATA, TAG_STRUCTURE, W_ADDR, W_NEXT, W_SIZE,
    W_TID, W_VALUE,
};
use crate::entry::{EntryKind, Handle, LogEntry, LogStructure, PersistentAddr};
use crate::error::LogError;
use crate::owner::{LockSet, OwnerTable};

/// Rounds a retired release is remembered after no scanned acquisition refers to it.
const RETIRED_ROUNDS: u64 = 16;

/// The append-only log of all threads.
///
/// Each thread appends to its own singly linked list of entries; the list of per-thread
/// [`LogStructure`]s is reachable from the shared header pointer. Threads only ever insert a new
/// structure at the front of that list; the consistency collector is the only party that replaces
/// the list as a whole.
pub struct DurableLog {
    arena: Arena,
    owners: OwnerTable,
    /// Releases freed by the collector, with the round that freed them.
    retired: Mutex<HashMap<Handle, u64>>,
    collecting: AtomicBool,
}

/// Occupancy of the log region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogStats {
    pub capacity: u32,
    pub high_water: u32,
    pub free: usize,
}

impl DurableLog {
    /// Initialize an empty log in the region.
    pub fn create(region: LogRegion) -> Result<Self, LogError> {
        let arena = Arena::init(region)?;
        Ok(Self::with_arena(arena))
    }

    /// Attach to the log previously created in the region.
    ///
    /// Slots that are live but no longer reachable from the header are freed. These are left
    /// behind by a crash between a header swing and the release of the entries it excised, or
    /// between allocating an entry and linking it.
    pub fn open(region: LogRegion) -> Result<Self, LogError> {
        let arena = Arena::attach(region)?;
        let log = Self::with_arena(arena);
        let swept = log.sweep_orphans();
        if swept > 0 {
            tracing::debug!(swept, "freed unreachable log slots");
        }

        Ok(log)
    }

    fn with_arena(arena: Arena) -> Self {
        DurableLog {
            arena,
            owners: OwnerTable::new(),
            retired: Mutex::new(HashMap::new()),
            collecting: AtomicBool::new(false),
        }
    }

    /// A writer for the thread `tid`.
    ///
    /// The thread's log structure is created with its first entry.
    pub fn thread(self: &Arc<Self>, tid: u32) -> ThreadLog {
        ThreadLog {
            log: self.clone(),
            tid,
            tail: Handle::NULL,
            depth: 0,
            held: LockSet::new(),
        }
    }

    /// The shared header pointer, the first log structure.
    pub fn header(&self) -> Handle {
        self.arena.header()
    }

    /// All log structures reachable from the header.
    pub fn structures(&self) -> Vec<LogStructure> {
        self.structures_from(self.header())
    }

    pub(crate) fn structures_from(&self, head: Handle) -> Vec<LogStructure> {
        let mut structures = Vec::new();
        let mut cursor = head;
        while let Some(structure) = self.structure(cursor) {
            cursor = structure.next;
            structures.push(structure);
        }

        structures
    }

    pub fn structure(&self, handle: Handle) -> Option<LogStructure> {
        let (tag, words) = self.arena.read(handle)?;
        if tag != TAG_STRUCTURE {
            return None;
        }

        Some(LogStructure {
            handle,
            first: Handle::from_word(words[W_ADDR]),
            next: Handle::from_word(words[W_NEXT]),
            tid: words[W_TID] as u32,
        })
    }

    /// Read a log entry, `None` if the handle is stale or not an entry.
    pub fn entry(&self, handle: Handle) -> Option<LogEntry> {
        let (tag, words) = self.arena.read(handle)?;
        let kind = EntryKind::from_tag(tag)?;

        Some(LogEntry {
            handle,
            kind,
            addr: words[W_ADDR],
            value: words[W_VALUE],
            size: words[W_SIZE],
            next: Handle::from_word(words[W_NEXT]),
            tid: words[W_TID] as u32,
        })
    }

    /// The successor of an entry, freshly loaded.
    pub fn next(&self, handle: Handle) -> Option<Handle> {
        self.arena.next(handle)
    }

    /// Iterate the entries of one thread starting at `first`.
    pub fn entries(&self, first: Handle) -> Entries<'_> {
        Entries {
            log: self,
            cursor: first,
        }
    }

    /// The bytes of a `memcpy` or `memmove` entry.
    pub fn data(&self, entry: &LogEntry) -> Option<Vec<u8>> {
        if !entry.kind.has_data() {
            return None;
        }

        let mut remaining = usize::try_from(entry.size).ok()?;
        let mut bytes = Vec::with_capacity(remaining);
        let mut cursor = entry.data().unwrap_or(Handle::NULL);

        while remaining > 0 {
            let (tag, words) = self.arena.read(cursor)?;
            if tag != TAG_DATA {
                return None;
            }

            for &idx in DATA_WORDS.iter() {
                let chunk = words[idx].to_le_bytes();
                let take = remaining.min(8);
                bytes.extend_from_slice(&chunk[..take]);
                remaining -= take;
                if remaining == 0 {
                    break;
                }
            }

            cursor = Handle::from_word(words[W_NEXT]);
        }

        Some(bytes)
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.arena.is_live(handle)
    }

    /// Whether `handle` is a release freed by the collector.
    pub fn is_retired(&self, handle: Handle) -> bool {
        self.retired.lock().contains_key(&handle)
    }

    pub fn owners(&self) -> &OwnerTable {
        &self.owners
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            capacity: self.arena.capacity(),
            high_water: self.arena.high_water(),
            free: self.arena.free_count(),
        }
    }

    /// Flush the whole region to the medium.
    pub fn sync(&self) -> Result<(), LogError> {
        self.arena.region().sync()?;
        Ok(())
    }

    pub(crate) fn cas_header(&self, old: Handle, new: Handle) -> bool {
        self.arena.cas_header(old, new)
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    pub(crate) fn try_begin_collect(&self) -> bool {
        self.collecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_collect(&self) {
        self.collecting.store(false, Ordering::Release);
    }

    pub(crate) fn publish_structure(
        &self,
        first: Handle,
        tid: u32,
        next: Handle,
    ) -> Result<Handle, LogError> {
        let idx = self.arena.alloc()?;
        let mut words = [0; 7];
        words[W_ADDR - 1] = first.to_word();
        words[W_NEXT - 1] = next.to_word();
        words[W_TID - 1] = u64::from(tid);
        Ok(self.arena.publish(idx, TAG_STRUCTURE, words))
    }

    /// Re-link a structure that is not yet reachable.
    pub(crate) fn relink_structure(&self, structure: Handle, next: Handle) {
        self.arena.set_next(structure, next);
    }

    pub(crate) fn free_slot(&self, handle: Handle) -> bool {
        self.arena.free(handle)
    }

    /// Free an entry together with its data chain.
    pub(crate) fn free_entry(&self, entry: &LogEntry) -> usize {
        let mut freed = 0;
        if let Some(mut chunk) = entry.data() {
            loop {
                let next = self.arena.next(chunk);
                if self.arena.free(chunk) {
                    freed += 1;
                }

                match next {
                    Some(next) => chunk = next,
                    None => break,
                }
            }
        }

        if self.arena.free(entry.handle) {
            freed += 1;
        }

        freed
    }

    pub(crate) fn retire(&self, release: Handle, round: u64) {
        self.retired.lock().insert(release, round);
    }

    /// Forget old retired releases unless an acquisition still refers to them.
    pub(crate) fn prune_retired(&self, round: u64, referenced: &HashSet<Handle>) {
        self.retired
            .lock()
            .retain(|handle, &mut at| at + RETIRED_ROUNDS > round || referenced.contains(handle));
    }

    #[cfg(test)]
    pub(crate) fn overwrite_value(&self, handle: Handle, value: u64) {
        self.arena.overwrite(handle, W_VALUE, value);
    }

    fn sweep_orphans(&self) -> usize {
        let high = self.arena.high_water() as usize;
        let mut reachable = vec![false; high];
        fn mark(handle: Handle, reachable: &mut [bool]) -> bool {
            let idx = handle.index as usize;
            if handle.is_null() || idx >= reachable.len() || reachable[idx] {
                return false;
            }

            reachable[idx] = true;
            true
        }

        let mut cursor = self.header();
        while let Some(structure) = self.structure(cursor) {
            if !mark(cursor, &mut reachable) {
                break;
            }

            let mut entry_cursor = structure.first;
            while let Some(entry) = self.entry(entry_cursor) {
                if !mark(entry_cursor, &mut reachable) {
                    break;
                }

                let mut chunk = entry.data().unwrap_or(Handle::NULL);
                while mark(chunk, &mut reachable) {
                    chunk = self.arena.next(chunk).unwrap_or(Handle::NULL);
                }

                entry_cursor = entry.next;
            }

            cursor = structure.next;
        }

        (1..high)
            .filter(|&idx| !reachable[idx])
            .filter(|&idx| self.arena.free_index(idx as u32))
            .count()
    }
}

/// Iterator over the entries of one thread.
pub struct Entries<'log> {
    log: &'log DurableLog,
    cursor: Handle,
}

impl Iterator for Entries<'_> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        let entry = self.log.entry(self.cursor)?;
        self.cursor = entry.next;
        Some(entry)
    }
}

/// The writing end of one thread's log.
///
/// Entries are fully written and flushed before they are linked to the previous tail, so a reader
/// never follows a link to a partially written entry.
pub struct ThreadLog {
    log: Arc<DurableLog>,
    tid: u32,
    tail: Handle,
    depth: u32,
    held: LockSet,
}

impl ThreadLog {
    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn log(&self) -> &Arc<DurableLog> {
        &self.log
    }

    /// The last entry appended by this writer.
    pub fn tail(&self) -> Handle {
        self.tail
    }

    /// Nesting depth of open sections.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn acquire(&mut self, lock: u64) -> Result<Handle, LogError> {
        self.acquire_kind(EntryKind::Acquire, lock)
    }

    pub fn rdlock(&mut self, lock: u64) -> Result<Handle, LogError> {
        self.acquire_kind(EntryKind::RdLock, lock)
    }

    pub fn wrlock(&mut self, lock: u64) -> Result<Handle, LogError> {
        self.acquire_kind(EntryKind::WrLock, lock)
    }

    pub fn release(&mut self, lock: u64) -> Result<Handle, LogError> {
        self.release_kind(EntryKind::Release, lock)
    }

    pub fn unlock(&mut self, lock: u64) -> Result<Handle, LogError> {
        self.release_kind(EntryKind::Unlock, lock)
    }

    pub fn begin_durable(&mut self) -> Result<Handle, LogError> {
        let handle = self.append(EntryKind::BeginDurable, 0, 0, 0)?;
        self.depth += 1;
        Ok(handle)
    }

    pub fn end_durable(&mut self) -> Result<Handle, LogError> {
        let handle = self.append(EntryKind::EndDurable, 0, 0, 0)?;
        self.depth = self.depth.saturating_sub(1);
        Ok(handle)
    }

    /// Log the after-image of a store of at most eight bytes.
    pub fn store(&mut self, addr: PersistentAddr, image: &[u8]) -> Result<Handle, LogError> {
        if image.len() > 8 {
            return Err(LogError::StoreTooWide(image.len()));
        }

        let mut word = [0; 8];
        word[..image.len()].copy_from_slice(image);
        self.append(
            EntryKind::Store,
            addr.0,
            u64::from_le_bytes(word),
            image.len() as u64,
        )
    }

    pub fn memset(&mut self, addr: PersistentAddr, byte: u8, len: u64) -> Result<Handle, LogError> {
        self.append(EntryKind::Memset, addr.0, u64::from(byte), len)
    }

    /// Log the bytes copied to `addr`.
    pub fn memcpy(&mut self, addr: PersistentAddr, bytes: &[u8]) -> Result<Handle, LogError> {
        self.data_entry(EntryKind::Memcpy, addr, bytes)
    }

    /// Log the bytes moved to `addr`, as they are after the move.
    pub fn memmove(&mut self, addr: PersistentAddr, bytes: &[u8]) -> Result<Handle, LogError> {
        self.data_entry(EntryKind::Memmove, addr, bytes)
    }

    fn acquire_kind(&mut self, kind: EntryKind, lock: u64) -> Result<Handle, LogError> {
        let target = self
            .log
            .owners
            .owner(lock)
            .filter(|&release| self.log.is_live(release))
            .unwrap_or(Handle::NULL);

        let handle = self.append(kind, lock, target.to_word(), 0)?;
        *self.held.entry(lock).or_insert(0) += 1;
        self.depth += 1;
        tracing::trace!(tid = self.tid, lock, ?target, "acquire");
        Ok(handle)
    }

    fn release_kind(&mut self, kind: EntryKind, lock: u64) -> Result<Handle, LogError> {
        if let Some(count) = self.held.get_mut(&lock) {
            *count -= 1;
            if *count == 0 {
                self.held.remove(&lock);
            }
        }

        self.depth = self.depth.saturating_sub(1);
        let handle = self.append(kind, lock, 0, 0)?;
        self.log.owners.set_owner(lock, handle, self.held.clone());
        tracing::trace!(tid = self.tid, lock, release = ?handle, "release");
        Ok(handle)
    }

    fn data_entry(
        &mut self,
        kind: EntryKind,
        addr: PersistentAddr,
        bytes: &[u8],
    ) -> Result<Handle, LogError> {
        let mut chunks = Vec::new();
        let mut next = Handle::NULL;

        for chunk in bytes.chunks(DATA_BYTES).rev() {
            let idx = match self.log.arena.alloc() {
                Ok(idx) => idx,
                Err(err) => {
                    for chunk in chunks {
                        self.log.arena.free(chunk);
                    }
                    return Err(err);
                }
            };

            let mut words = [0u64; 7];
            for (i, part) in chunk.chunks(8).enumerate() {
                let mut word = [0; 8];
                word[..part.len()].copy_from_slice(part);
                words[DATA_WORDS[i] - 1] = u64::from_le_bytes(word);
            }

            words[W_NEXT - 1] = next.to_word();
            next = self.log.arena.publish(idx, TAG_DATA, words);
            chunks.push(next);
        }

        match self.append(kind, addr.0, next.to_word(), bytes.len() as u64) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                for chunk in chunks {
                    self.log.arena.free(chunk);
                }
                Err(err)
            }
        }
    }

    /// Publish an entry and link it to the tail.
    pub(crate) fn append(
        &mut self,
        kind: EntryKind,
        addr: u64,
        value: u64,
        size: u64,
    ) -> Result<Handle, LogError> {
        let arena = &self.log.arena;
        let idx = arena.alloc()?;

        let mut words = [0; 7];
        words[W_ADDR - 1] = addr;
        words[W_VALUE - 1] = value;
        words[W_SIZE - 1] = size;
        words[W_TID - 1] = u64::from(self.tid);
        let handle = arena.publish(idx, kind.tag(), words);

        if self.tail.is_null() {
            self.insert_structure(handle)?;
        } else {
            arena.set_next(self.tail, handle);
        }

        self.tail = handle;
        Ok(handle)
    }

    fn insert_structure(&mut self, first: Handle) -> Result<(), LogError> {
        let mut head = self.log.header();
        let structure = match self.log.publish_structure(first, self.tid, head) {
            Ok(structure) => structure,
            Err(err) => {
                self.log.arena.free(first);
                return Err(err);
            }
        };

        while !self.log.cas_header(head, structure) {
            head = self.log.header();
            self.log.relink_structure(structure, head);
        }

        tracing::debug!(tid = self.tid, ?structure, "log structure inserted");
        Ok(())
    }
}
