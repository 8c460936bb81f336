//! Replaying durable logs in happens-before order.
//!
//! Every thread's log is walked backward from its last entry. A release that another thread
//! acquired makes the walk drain that thread, from its end down to the acquisition, before it
//! continues: everything the acquirer did afterwards happened after everything before the release.
//! The walk thus lists writes latest first. Applying the list reversed writes every address last
//! with its latest after-image, which also makes replaying a second time a no-op.
use std::collections::{BTreeMap, HashMap, HashSet};

use pmem_state::{DurableLog, EntryKind, Handle, LogEntry, PersistentAddr};

use crate::error::RecoverError;

/// Memory that logged writes are replayed into.
pub trait ReplayTarget {
    fn write(&mut self, addr: PersistentAddr, bytes: &[u8]) -> Result<(), RecoverError>;
    fn fill(&mut self, addr: PersistentAddr, byte: u8, len: u64) -> Result<(), RecoverError>;
}

/// A plain image, addressed by offset. The region of an address is ignored.
impl ReplayTarget for [u8] {
    fn write(&mut self, addr: PersistentAddr, bytes: &[u8]) -> Result<(), RecoverError> {
        let len = bytes.len() as u64;
        slice_at(self, addr, len)?.copy_from_slice(bytes);
        Ok(())
    }

    fn fill(&mut self, addr: PersistentAddr, byte: u8, len: u64) -> Result<(), RecoverError> {
        slice_at(self, addr, len)?.fill(byte);
        Ok(())
    }
}

impl ReplayTarget for Vec<u8> {
    fn write(&mut self, addr: PersistentAddr, bytes: &[u8]) -> Result<(), RecoverError> {
        ReplayTarget::write(self.as_mut_slice(), addr, bytes)
    }

    fn fill(&mut self, addr: PersistentAddr, byte: u8, len: u64) -> Result<(), RecoverError> {
        ReplayTarget::fill(self.as_mut_slice(), addr, byte, len)
    }
}

fn slice_at(image: &mut [u8], addr: PersistentAddr, len: u64) -> Result<&mut [u8], RecoverError> {
    let start = addr.offset() as usize;
    let end = start
        .checked_add(len as usize)
        .filter(|&end| end <= image.len())
        .ok_or(RecoverError::OutOfRange { addr, len })?;
    Ok(&mut image[start..end])
}

/// Counts of one replay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub threads: usize,
    /// Acquisitions matched to a release of another thread.
    pub edges: usize,
    pub writes: usize,
}

/// A pending backward walk of one thread.
struct Walk {
    tid: u32,
    down_to: usize,
    /// Acquirers of the release just walked over, not yet drained.
    acquirers: Vec<(Handle, u32)>,
}

pub struct Replayer<'log> {
    log: &'log DurableLog,
    threads: BTreeMap<u32, Vec<LogEntry>>,
    /// Where each entry sits, thread and index.
    position: HashMap<Handle, (u32, usize)>,
    rel_to_acq: HashMap<Handle, Vec<(Handle, u32)>>,
    /// Entries of each thread not yet walked, the walk continues below this index.
    cursor: HashMap<u32, usize>,
    replayed: HashSet<Handle>,
    /// Writes, latest first.
    schedule: Vec<LogEntry>,
    edges: usize,
}

impl<'log> Replayer<'log> {
    pub fn new(log: &'log DurableLog) -> Self {
        let mut threads: BTreeMap<u32, Vec<LogEntry>> = BTreeMap::new();
        // Structures are pushed at the front, a reused thread id continues in the newer one.
        for structure in log.structures().into_iter().rev() {
            threads
                .entry(structure.tid)
                .or_default()
                .extend(log.entries(structure.first));
        }

        let mut position = HashMap::new();
        for (&tid, entries) in &threads {
            for (idx, entry) in entries.iter().enumerate() {
                position.insert(entry.handle, (tid, idx));
            }
        }

        let cursor = threads.iter().map(|(&tid, entries)| (tid, entries.len())).collect();

        Replayer {
            log,
            threads,
            position,
            rel_to_acq: HashMap::new(),
            cursor,
            replayed: HashSet::new(),
            schedule: vec![],
            edges: 0,
        }
    }

    pub fn threads(&self) -> impl Iterator<Item = u32> + '_ {
        self.threads.keys().copied()
    }

    /// Map every release that was observed by an acquisition to its acquirers.
    pub fn create_rel_to_acq_mappings(&mut self) -> usize {
        self.rel_to_acq.clear();
        let mut mapped = 0;
        for (&tid, entries) in &self.threads {
            for entry in entries {
                if let Some(release) = entry.target() {
                    self.rel_to_acq
                        .entry(release)
                        .or_default()
                        .push((entry.handle, tid));
                    mapped += 1;
                }
            }
        }

        tracing::debug!(acquisitions = mapped, releases = self.rel_to_acq.len(), "release map built");
        mapped
    }

    /// Acquirers of `release`, with their thread.
    pub fn acquirers(&self, release: Handle) -> &[(Handle, u32)] {
        self.rel_to_acq.get(&release).map_or(&[], Vec::as_slice)
    }

    /// Replay all threads.
    pub fn recover_all<T: ReplayTarget + ?Sized>(
        &mut self,
        target: &mut T,
    ) -> Result<ReplayStats, RecoverError> {
        self.create_rel_to_acq_mappings();
        let tids: Vec<u32> = self.threads.keys().copied().collect();
        for &tid in &tids {
            self.drain(tid, 0);
        }

        let writes = self.apply(target)?;
        Ok(ReplayStats {
            threads: tids.len(),
            edges: self.edges,
            writes,
        })
    }

    /// Replay one thread and whatever happened after its releases in other threads.
    pub fn recover_thread<T: ReplayTarget + ?Sized>(
        &mut self,
        tid: u32,
        target: &mut T,
    ) -> Result<ReplayStats, RecoverError> {
        if self.rel_to_acq.is_empty() {
            self.create_rel_to_acq_mappings();
        }

        self.drain(tid, 0);
        let writes = self.apply(target)?;
        Ok(ReplayStats {
            threads: 1,
            edges: self.edges,
            writes,
        })
    }

    /// Walk `tid` backward down to and including entry `down_to`.
    ///
    /// Acquirers of a release are drained in turn before the walk of the releasing thread goes on.
    fn drain(&mut self, tid: u32, down_to: usize) {
        let mut stack = vec![Walk {
            tid,
            down_to,
            acquirers: vec![],
        }];

        while let Some(walk) = stack.last_mut() {
            if let Some((acquire, other)) = walk.acquirers.pop() {
                if other == walk.tid || !self.replayed.insert(acquire) {
                    continue;
                }

                if let Some(&(_, at)) = self.position.get(&acquire) {
                    self.edges += 1;
                    stack.push(Walk {
                        tid: other,
                        down_to: at,
                        acquirers: vec![],
                    });
                }
                continue;
            }

            let cursor = match self.cursor.get_mut(&walk.tid) {
                Some(cursor) if *cursor > walk.down_to => cursor,
                _ => {
                    stack.pop();
                    continue;
                }
            };

            *cursor -= 1;
            let entry = self.threads[&walk.tid][*cursor];

            if entry.kind.is_acquire() {
                self.replayed.insert(entry.handle);
            } else if entry.kind.is_store_like() {
                self.schedule.push(entry);
            } else if entry.kind.is_release() {
                let mut acquirers = self
                    .rel_to_acq
                    .get(&entry.handle)
                    .cloned()
                    .unwrap_or_default();
                // Popped from the back, the first acquirer is drained first.
                acquirers.reverse();
                walk.acquirers = acquirers;
            }
        }
    }

    /// Apply and clear the schedule, oldest write first.
    fn apply<T: ReplayTarget + ?Sized>(&mut self, target: &mut T) -> Result<usize, RecoverError> {
        let schedule = core::mem::take(&mut self.schedule);
        for entry in schedule.iter().rev() {
            let addr = entry.persistent_addr();
            match entry.kind {
                EntryKind::Store => {
                    if let Some((image, len)) = entry.store_image() {
                        target.write(addr, &image[..len])?;
                    }
                }
                EntryKind::Memset => target.fill(addr, entry.value as u8, entry.size)?,
                EntryKind::Memcpy | EntryKind::Memmove => {
                    let bytes = self
                        .log
                        .data(entry)
                        .ok_or(RecoverError::MissingData(entry.handle))?;
                    target.write(addr, &bytes)?;
                }
                _ => {}
            }

            tracing::trace!(entry = ?entry.handle, kind = ?entry.kind, ?addr, "replayed");
        }

        Ok(schedule.len())
    }
}
