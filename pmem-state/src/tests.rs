use std::collections::HashSet;
use std::sync::Arc;

use crate::arena::TAG_DATA;
use crate::{
    create_ocs_marker, Collector, DurableLog, EntryKind, Handle, LogRegion, PersistentAddr,
};

const L1: u64 = 0x1000;
const L2: u64 = 0x2000;

fn with_setup(method: impl FnOnce(Arc<DurableLog>)) {
    let log = DurableLog::create(LogRegion::in_memory(1 << 10)).expect("to create a log");
    method(Arc::new(log))
}

fn addr(offset: u64) -> PersistentAddr {
    PersistentAddr::new(1, offset)
}

/// All slots reachable from the header.
fn reachable(log: &DurableLog) -> HashSet<Handle> {
    let mut seen = HashSet::new();
    for structure in log.structures() {
        seen.insert(structure.handle);
        for entry in log.entries(structure.first) {
            seen.insert(entry.handle);
            let mut chunk = entry.data();
            while let Some(handle) = chunk {
                seen.insert(handle);
                chunk = log.next(handle);
            }
        }
    }

    seen
}

#[test]
fn markers_need_a_following_entry() {
    with_setup(|log| {
        let mut thread = log.thread(1);
        let first = thread.acquire(L1).unwrap();
        thread.store(addr(0), &7u64.to_le_bytes()).unwrap();
        let release = thread.release(L1).unwrap();

        assert_eq!(create_ocs_marker(&log, first), None);

        thread.begin_durable().unwrap();
        let marker = create_ocs_marker(&log, first).unwrap();
        assert_eq!(marker.first, first);
        assert_eq!(marker.last, release);
        assert!(!marker.deleted);
    });
}

#[test]
fn nested_sections_close_at_depth_zero() {
    with_setup(|log| {
        let mut thread = log.thread(1);
        let first = thread.acquire(L1).unwrap();
        thread.acquire(L2).unwrap();
        thread.release(L2).unwrap();
        assert_eq!(thread.depth(), 1);
        let outer = thread.release(L1).unwrap();
        thread.store(addr(8), &[1]).unwrap();

        let marker = create_ocs_marker(&log, first).unwrap();
        assert_eq!(marker.last, outer);
    });
}

#[test]
fn collect_frees_closed_sections() {
    with_setup(|log| {
        let mut thread = log.thread(1);
        let first = thread.acquire(L1).unwrap();
        thread.memcpy(addr(0), &[0xab; 60]).unwrap();
        thread.release(L1).unwrap();
        thread.acquire(L1).unwrap();
        thread.store(addr(64), &[1, 2]).unwrap();
        let release = thread.release(L1).unwrap();
        let trailing = thread.begin_durable().unwrap();

        let before: HashSet<_> = reachable(&log);
        let mut collector = Collector::new(log.clone());
        let round = collector.collect().unwrap();

        assert!(round.swung);
        assert_eq!(round.ocses, 2);
        assert_eq!(round.unstable, 0);
        // Six entries, two data chunks, the old structure.
        assert_eq!(round.freed, 9);

        let structures = log.structures();
        assert_eq!(structures.len(), 1);
        assert_eq!(structures[0].first, trailing);
        assert!(!log.is_live(first));
        assert!(log.is_retired(release));
        assert_eq!(log.owners().owner(L1), None);

        let after = reachable(&log);
        for handle in before.difference(&after) {
            assert!(!log.is_live(*handle), "{handle:?} freed but still live");
        }

        let again = collector.collect().unwrap();
        assert!(!again.swung);
        assert_eq!(again.freed, 0);
    });
}

#[test]
fn unresolved_acquire_excludes_dependents() {
    with_setup(|log| {
        let mut a = log.thread(1);
        let mut b = log.thread(2);

        a.acquire(L1).unwrap();
        a.release(L1).unwrap();

        // Depends on the open section of `a`.
        b.acquire(L1).unwrap();
        b.release(L1).unwrap();
        // Depends on the above through program order.
        b.acquire(L2).unwrap();
        b.release(L2).unwrap();
        b.begin_durable().unwrap();

        let mut collector = Collector::new(log.clone());
        let round = collector.collect().unwrap();
        assert_eq!(round.ocses, 2);
        assert_eq!(round.unstable, 2);
        assert!(!round.swung);

        a.end_durable().unwrap();
        let round = collector.collect().unwrap();
        assert_eq!(round.ocses, 3);
        assert_eq!(round.unstable, 0);
        assert!(round.swung);
    });
}

#[test]
fn retired_release_resolves() {
    with_setup(|log| {
        let mut a = log.thread(1);
        a.acquire(L1).unwrap();
        let release = a.release(L1).unwrap();
        a.begin_durable().unwrap();

        let mut collector = Collector::new(log.clone());
        assert!(collector.collect().unwrap().swung);
        assert!(!log.is_live(release));
        assert!(log.is_retired(release));

        // An acquisition which read the release just before it was freed.
        let mut b = log.thread(2);
        b.append(EntryKind::Acquire, L1, release.to_word(), 0).unwrap();
        b.release(L1).unwrap();
        b.begin_durable().unwrap();

        let round = collector.collect().unwrap();
        assert_eq!(round.unstable, 0);
        assert!(round.swung);
    });
}

#[test]
fn cycles_are_flagged_not_collected() {
    with_setup(|log| {
        let mut a = log.thread(1);
        let mut b = log.thread(2);
        let mut c = log.thread(3);

        let a_acquire = a.acquire(L1).unwrap();
        a.release(L2).unwrap();
        a.begin_durable().unwrap();

        b.acquire(L2).unwrap();
        let b_release = b.release(L1).unwrap();
        b.begin_durable().unwrap();

        // Depends on `a` through the release of `L2`.
        c.acquire(L2).unwrap();
        c.release(L2).unwrap();
        c.begin_durable().unwrap();

        log.overwrite_value(a_acquire, b_release.to_word());

        let mut collector = Collector::new(log.clone());
        let round = collector.collect().unwrap();
        assert_eq!(round.ocses, 3);
        assert_eq!(round.cyclic, 2);
        assert_eq!(round.unstable, 3);
        assert!(!round.swung);
        assert!(log.is_live(a_acquire));
    });
}

#[test]
fn releases_record_held_locks() {
    with_setup(|log| {
        let mut thread = log.thread(1);
        thread.acquire(L1).unwrap();
        thread.acquire(L2).unwrap();
        let inner = thread.release(L2).unwrap();

        assert_eq!(log.owners().owner(L2), Some(inner));
        let held = log.owners().locks_held_at(L2).unwrap();
        assert_eq!(held.get(&L1), Some(&1));
        assert_eq!(held.get(&L2), None);

        let outer = thread.release(L1).unwrap();
        assert_eq!(log.owners().owner(L1), Some(outer));
        assert!(log.owners().locks_held_at(L1).unwrap().is_empty());

        let mut other = log.thread(2);
        let acquire = other.acquire(L1).unwrap();
        assert_eq!(log.entry(acquire).unwrap().target(), Some(outer));
    });
}

#[test]
fn data_entries_keep_their_bytes() {
    with_setup(|log| {
        let mut thread = log.thread(1);
        let bytes: Vec<u8> = (0..=200).collect();
        let handle = thread.memmove(addr(16), &bytes).unwrap();

        let entry = log.entry(handle).unwrap();
        assert_eq!(entry.kind, EntryKind::Memmove);
        assert_eq!(entry.persistent_addr(), addr(16));
        assert_eq!(log.data(&entry).unwrap(), bytes);

        let empty = thread.memcpy(addr(0), &[]).unwrap();
        assert_eq!(log.data(&log.entry(empty).unwrap()).unwrap(), Vec::<u8>::new());

        assert!(matches!(
            thread.store(addr(0), &[0; 9]),
            Err(crate::LogError::StoreTooWide(9))
        ));
    });
}

#[test]
fn reopen_sweeps_orphans() {
    let backing = pmem_fd::BackingFd::anonymous("pmem-state-reopen").unwrap();
    backing.file().set_len(256 * crate::SLOT_BYTES as u64).unwrap();
    let file = backing.file().try_clone().unwrap();

    let (structure, entries) = {
        let log = Arc::new(DurableLog::create(LogRegion::from_file(&file).unwrap()).unwrap());
        let mut thread = log.thread(4);
        thread.acquire(L1).unwrap();
        thread.store(addr(0), &[9]).unwrap();
        thread.release(L1).unwrap();

        // Allocated and written, never linked.
        let idx = log.arena().alloc().unwrap();
        log.arena().publish(idx, TAG_DATA, [0; 7]);

        let structure = log.structures()[0];
        let entries: Vec<_> = log.entries(structure.first).collect();
        log.sync().unwrap();
        (structure, entries)
    };

    let log = DurableLog::open(LogRegion::from_file(&file).unwrap()).unwrap();
    assert_eq!(log.structures(), vec![structure]);
    assert_eq!(log.entries(structure.first).collect::<Vec<_>>(), entries);

    let stats = log.stats();
    assert_eq!(stats.high_water, 6);
    assert_eq!(stats.free, 1);
}

#[test]
fn reopened_log_still_collects() {
    let backing = pmem_fd::BackingFd::anonymous("pmem-state-collect").unwrap();
    backing.file().set_len(256 * crate::SLOT_BYTES as u64).unwrap();
    let file = backing.file().try_clone().unwrap();

    let observed = {
        let log = Arc::new(DurableLog::create(LogRegion::from_file(&file).unwrap()).unwrap());
        let mut a = log.thread(1);
        let mut b = log.thread(2);

        a.acquire(L1).unwrap();
        let release = a.release(L1).unwrap();
        a.begin_durable().unwrap();

        // Still open when the section of `a` is collected.
        b.acquire(L1).unwrap();

        let round = Collector::new(log.clone()).collect().unwrap();
        assert!(round.swung);
        assert!(!log.is_live(release));

        b.release(L1).unwrap();
        b.begin_durable().unwrap();
        log.sync().unwrap();
        release
    };

    let log = Arc::new(DurableLog::open(LogRegion::from_file(&file).unwrap()).unwrap());
    // A new run has no memory of what earlier collectors retired.
    assert!(!log.is_retired(observed));

    let mut collector = Collector::new(log.clone());
    let round = collector.collect().unwrap();
    assert_eq!(round.ocses, 1);
    assert_eq!(round.unstable, 0);
    assert!(round.swung);
    assert!(round.freed > 0);

    let again = collector.collect().unwrap();
    assert!(!again.swung);
}

#[test]
fn open_rejects_foreign_regions() {
    let region = LogRegion::in_memory(4);
    assert!(matches!(
        DurableLog::open(region),
        Err(crate::LogError::BadMagic)
    ));
}

mod soundness {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Copy, Debug)]
    enum Op {
        Section { thread: usize, lock: u64, stores: u8 },
        Durable { thread: usize },
        Collect,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..3usize, prop::sample::select(vec![L1, L2]), 0..3u8)
                .prop_map(|(thread, lock, stores)| Op::Section { thread, lock, stores }),
            1 => (0..3usize).prop_map(|thread| Op::Durable { thread }),
            1 => Just(Op::Collect),
        ]
    }

    proptest! {
        #[test]
        fn freed_slots_are_unreachable(ops in prop::collection::vec(op(), 1..60)) {
            let log = Arc::new(DurableLog::create(LogRegion::in_memory(1 << 12)).unwrap());
            let mut threads: Vec<_> = (0..3).map(|tid| log.thread(tid)).collect();
            let mut collector = Collector::new(log.clone());

            for op in ops {
                match op {
                    Op::Section { thread, lock, stores } => {
                        let thread = &mut threads[thread];
                        thread.acquire(lock).unwrap();
                        for i in 0..stores {
                            thread.store(addr(u64::from(i) * 8), &[i]).unwrap();
                        }
                        thread.release(lock).unwrap();
                    }
                    Op::Durable { thread } => {
                        let thread = &mut threads[thread];
                        thread.begin_durable().unwrap();
                        thread.end_durable().unwrap();
                    }
                    Op::Collect => {
                        let before = reachable(&log);
                        let round = collector.collect().unwrap();
                        let after = reachable(&log);

                        for handle in before.difference(&after) {
                            prop_assert!(!log.is_live(*handle));
                        }

                        prop_assert!(round.unstable <= round.ocses);
                        for thread in &threads {
                            if !thread.tail().is_null() {
                                prop_assert!(after.contains(&thread.tail()));
                            }
                        }
                    }
                }
            }
        }
    }
}
