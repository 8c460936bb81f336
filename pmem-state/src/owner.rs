//! The last release of every lock.
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::entry::Handle;

/// Number of hash buckets.
pub const TAB_SIZE: usize = 1024;

/// Locks held by a thread, with their recursion count.
pub type LockSet = BTreeMap<u64, u32>;

/// Maps lock addresses to the release entry that last released them.
///
/// Only the releasing thread writes the record of a lock (it holds the lock), everyone may read.
/// Buckets are only locked to find or insert the record of a lock. A release and the locks held
/// at it are replaced together, readers never see one without the other.
pub struct OwnerTable {
    buckets: Box<[Mutex<Vec<Arc<OwnerInfo>>>]>,
}

struct OwnerInfo {
    lock: u64,
    record: RwLock<Arc<Record>>,
}

#[derive(Default)]
struct Record {
    last_release: Handle,
    /// Locks the releasing thread still held after the release.
    held: LockSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerSnapshot {
    pub lock: u64,
    pub last_release: Handle,
    pub held: LockSet,
}

impl OwnerTable {
    pub fn new() -> Self {
        OwnerTable {
            buckets: (0..TAB_SIZE).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn bucket(lock: u64) -> usize {
        (lock.wrapping_add(128) >> 3) as usize & (TAB_SIZE - 1)
    }

    fn find(&self, lock: u64) -> Option<Arc<OwnerInfo>> {
        self.buckets[Self::bucket(lock)]
            .lock()
            .iter()
            .find(|info| info.lock == lock)
            .cloned()
    }

    fn find_or_insert(&self, lock: u64) -> Arc<OwnerInfo> {
        let mut bucket = self.buckets[Self::bucket(lock)].lock();
        if let Some(info) = bucket.iter().find(|info| info.lock == lock) {
            return info.clone();
        }

        let info = Arc::new(OwnerInfo {
            lock,
            record: RwLock::default(),
        });

        bucket.push(info.clone());
        info
    }

    /// The last release of `lock`, if one is recorded and was not retired.
    pub fn owner(&self, lock: u64) -> Option<Handle> {
        let info = self.find(lock)?;
        let release = info.record.read().last_release;
        release.non_null()
    }

    /// Record `release` as the last release of `lock`.
    pub fn set_owner(&self, lock: u64, release: Handle, held: LockSet) {
        let info = self.find_or_insert(lock);
        let record = Arc::new(Record {
            last_release: release,
            held,
        });
        *info.record.write() = record;
    }

    /// Forget `release` if it is still the last release of `lock`.
    ///
    /// Returns whether the record was cleared. A newer release is left untouched.
    pub fn retire_release(&self, lock: u64, release: Handle) -> bool {
        let Some(info) = self.find(lock) else {
            return false;
        };

        let mut record = info.record.write();
        if record.last_release != release {
            return false;
        }

        *record = Arc::new(Record {
            last_release: Handle::NULL,
            held: record.held.clone(),
        });
        true
    }

    /// Snapshots of all records in the hash chain of `lock`.
    ///
    /// Colliding locks share a chain, filter by [`OwnerSnapshot::lock`].
    pub fn chain(&self, lock: u64) -> Vec<OwnerSnapshot> {
        self.buckets[Self::bucket(lock)]
            .lock()
            .iter()
            .map(|info| {
                let record = info.record.read().clone();
                OwnerSnapshot {
                    lock: info.lock,
                    last_release: record.last_release,
                    held: record.held.clone(),
                }
            })
            .collect()
    }

    /// The locks held by the thread that last released `lock`, at the time of that release.
    pub fn locks_held_at(&self, lock: u64) -> Option<LockSet> {
        let info = self.find(lock)?;
        let record = info.record.read().clone();
        Some(record.held.clone())
    }
}

impl Default for OwnerTable {
    fn default() -> Self {
        OwnerTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colliding_locks_share_a_chain() {
        let table = OwnerTable::new();
        let a = 0x1000;
        let b = a + (TAB_SIZE as u64) * 8;
        assert_eq!(OwnerTable::bucket(a), OwnerTable::bucket(b));

        let ra = Handle { index: 3, generation: 0 };
        let rb = Handle { index: 4, generation: 1 };
        table.set_owner(a, ra, LockSet::new());
        table.set_owner(b, rb, [(a, 1)].into_iter().collect());

        assert_eq!(table.owner(a), Some(ra));
        assert_eq!(table.owner(b), Some(rb));
        assert_eq!(table.chain(a).len(), 2);
        assert_eq!(table.locks_held_at(b).unwrap().get(&a), Some(&1));
    }

    #[test]
    fn retire_only_clears_matching_release() {
        let table = OwnerTable::new();
        let old = Handle { index: 5, generation: 0 };
        let new = Handle { index: 6, generation: 0 };

        table.set_owner(8, old, LockSet::new());
        table.set_owner(8, new, LockSet::new());
        assert!(!table.retire_release(8, old));
        assert_eq!(table.owner(8), Some(new));

        assert!(table.retire_release(8, new));
        assert_eq!(table.owner(8), None);
        assert!(!table.retire_release(9, new));
    }

    #[test]
    fn snapshots_pair_release_and_held_locks() {
        const LOCK: u64 = 0x80;
        const ROUNDS: u32 = 5_000;
        let table = Arc::new(OwnerTable::new());

        let writer = {
            let table = table.clone();
            std::thread::spawn(move || {
                for index in 1..=ROUNDS {
                    let held = [(u64::from(index), 1)].into_iter().collect();
                    table.set_owner(LOCK, Handle { index, generation: 0 }, held);
                }
            })
        };

        let mut seen = 0;
        while seen < ROUNDS {
            for snapshot in table.chain(LOCK).into_iter().filter(|s| s.lock == LOCK) {
                seen = snapshot.last_release.index;
                if seen != 0 {
                    assert_eq!(
                        snapshot.held.keys().copied().collect::<Vec<_>>(),
                        vec![u64::from(seen)]
                    );
                }
            }
        }

        writer.join().unwrap();
    }
}
