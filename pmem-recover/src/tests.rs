use std::path::Path;
use std::sync::Arc;

use proptest::prelude::*;

use pmem_state::{DurableLog, LogRegion, PersistentAddr};

use crate::{region_name, CrashFlags, CrashRegistry, RecoverError, RegionMap, Replayer};

const L: u64 = 0x40;

fn with_setup(method: impl FnOnce(Arc<DurableLog>)) {
    let log = DurableLog::create(LogRegion::in_memory(1 << 12)).expect("to create a log");
    method(Arc::new(log))
}

fn with_dir(method: impl FnOnce(&Path)) {
    let dir = tempfile::tempdir().expect("to create a directory");
    method(dir.path())
}

fn addr(offset: u64) -> PersistentAddr {
    PersistentAddr::new(1, offset)
}

fn word(image: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(image[offset..offset + 8].try_into().unwrap())
}

#[test]
fn acquirer_writes_last() {
    with_setup(|log| {
        let mut first = log.thread(1);
        let mut second = log.thread(2);

        first.acquire(L).unwrap();
        first.store(addr(0), &1u64.to_le_bytes()).unwrap();
        first.release(L).unwrap();

        second.acquire(L).unwrap();
        second.store(addr(0), &2u64.to_le_bytes()).unwrap();
        second.release(L).unwrap();

        let mut image = vec![0; 64];
        let stats = Replayer::new(&log).recover_all(&mut image).unwrap();
        assert_eq!(word(&image, 0), 2);
        assert_eq!(stats.threads, 2);
        assert_eq!(stats.edges, 1);
        assert_eq!(stats.writes, 2);
    });
}

#[test]
fn acquirer_walked_first_still_writes_last() {
    with_setup(|log| {
        // The lower thread id is walked first, here it is the acquirer.
        let mut early = log.thread(2);
        let mut late = log.thread(1);

        early.acquire(L).unwrap();
        early.store(addr(8), &1u64.to_le_bytes()).unwrap();
        early.release(L).unwrap();

        late.acquire(L).unwrap();
        late.store(addr(8), &2u64.to_le_bytes()).unwrap();
        late.release(L).unwrap();

        early.acquire(L).unwrap();
        early.store(addr(8), &3u64.to_le_bytes()).unwrap();
        early.release(L).unwrap();

        let mut image = vec![0; 64];
        let stats = Replayer::new(&log).recover_all(&mut image).unwrap();
        assert_eq!(word(&image, 8), 3);
        assert_eq!(stats.writes, 3);
    });
}

#[test]
fn reused_thread_id_keeps_program_order() {
    with_setup(|log| {
        let mut before = log.thread(1);
        before.store(addr(0), &1u64.to_le_bytes()).unwrap();

        // The same thread id starts logging again, say after a cancelled workspace.
        let mut after = log.thread(1);
        after.store(addr(0), &2u64.to_le_bytes()).unwrap();
        after.memset(addr(8), 7, 8).unwrap();

        assert_eq!(log.structures().len(), 2);

        let mut image = vec![0; 64];
        let stats = Replayer::new(&log).recover_all(&mut image).unwrap();
        assert_eq!(word(&image, 0), 2);
        assert_eq!(&image[8..16], &[7; 8]);
        assert_eq!(stats.threads, 1);
        assert_eq!(stats.writes, 3);
    });
}

#[test]
fn handoff_chain_across_many_threads() {
    const THREADS: u32 = 1000;
    let log = Arc::new(DurableLog::create(LogRegion::in_memory(1 << 14)).unwrap());

    for tid in 1..=THREADS {
        let mut thread = log.thread(tid);
        thread.acquire(L).unwrap();
        thread.store(addr(0), &u64::from(tid).to_le_bytes()).unwrap();
        thread.release(L).unwrap();
    }

    let mut image = vec![0; 8];
    let stats = Replayer::new(&log).recover_all(&mut image).unwrap();
    assert_eq!(word(&image, 0), u64::from(THREADS));
    assert_eq!(stats.edges, THREADS as usize - 1);
    assert_eq!(stats.writes, THREADS as usize);
}

#[test]
fn releases_map_to_their_acquirers() {
    with_setup(|log| {
        let mut a = log.thread(1);
        let mut b = log.thread(2);
        let mut c = log.thread(3);

        a.acquire(L).unwrap();
        let release = a.release(L).unwrap();
        let first = b.rdlock(L).unwrap();
        let second = c.rdlock(L).unwrap();

        let mut replayer = Replayer::new(&log);
        assert_eq!(replayer.threads().collect::<Vec<_>>(), vec![1, 2, 3]);
        // The first acquisition of `a` observed nothing.
        assert_eq!(replayer.create_rel_to_acq_mappings(), 2);

        let mut acquirers = replayer.acquirers(release).to_vec();
        acquirers.sort_by_key(|&(_, tid)| tid);
        assert_eq!(acquirers, vec![(first, 2), (second, 3)]);
    });
}

#[test]
fn one_thread_brings_its_successors() {
    with_setup(|log| {
        let mut a = log.thread(1);
        let mut b = log.thread(2);
        let mut c = log.thread(3);

        a.acquire(L).unwrap();
        a.store(addr(0), &[1]).unwrap();
        a.release(L).unwrap();

        b.acquire(L).unwrap();
        b.store(addr(1), &[2]).unwrap();
        b.release(L).unwrap();

        // Unrelated to `a`.
        c.memset(addr(2), 3, 4).unwrap();

        let mut image = vec![0; 8];
        let stats = Replayer::new(&log).recover_thread(1, &mut image).unwrap();
        assert_eq!(&image[..6], &[1, 2, 0, 0, 0, 0]);
        assert_eq!(stats.edges, 1);
        assert_eq!(stats.writes, 2);
    });
}

#[test]
fn data_entries_are_replayed() {
    with_setup(|log| {
        let mut thread = log.thread(1);
        let text: Vec<u8> = (0..100).collect();
        thread.memcpy(addr(10), &text).unwrap();
        thread.memset(addr(50), 0xff, 10).unwrap();
        thread.memmove(addr(0), &text[..4]).unwrap();

        let mut image = vec![0; 128];
        Replayer::new(&log).recover_all(&mut image).unwrap();

        let mut expected = vec![0; 128];
        expected[10..110].copy_from_slice(&text);
        expected[50..60].fill(0xff);
        expected[..4].copy_from_slice(&text[..4]);
        assert_eq!(image, expected);
    });
}

#[test]
fn writes_outside_the_image_fail() {
    with_setup(|log| {
        let mut thread = log.thread(1);
        thread.store(addr(60), &0u64.to_le_bytes()).unwrap();

        let mut image = vec![0; 64];
        let err = Replayer::new(&log).recover_all(&mut image).unwrap_err();
        assert!(matches!(err, RecoverError::OutOfRange { len: 8, .. }), "{err:?}");
    });
}

#[test]
fn regions_are_mapped_on_demand() {
    with_setup(|log| with_dir(|dir| {
        std::fs::write(dir.join(region_name(1)), vec![0u8; 4096]).unwrap();

        let mut thread = log.thread(1);
        thread.store(addr(16), &0x1122u64.to_le_bytes()).unwrap();
        thread.memset(addr(100), 9, 3).unwrap();

        let mut regions = RegionMap::new(dir);
        assert_eq!(regions.mapped(), 0);
        Replayer::new(&log).recover_all(&mut regions).unwrap();
        assert_eq!(regions.mapped(), 1);
        regions.flush().unwrap();
        drop(regions);

        let file = std::fs::read(dir.join(region_name(1))).unwrap();
        assert_eq!(word(&file, 16), 0x1122);
        assert_eq!(&file[99..104], &[0, 9, 9, 9, 0]);

        // No file for region 2.
        thread.store(PersistentAddr::new(2, 0), &[1]).unwrap();
        let err = Replayer::new(&log)
            .recover_all(&mut RegionMap::new(dir))
            .unwrap_err();
        assert!(matches!(err, RecoverError::Io(_)), "{err:?}");
    }));
}

#[test]
fn crash_flags_survive_until_finalized() {
    with_dir(|dir| {
        let dir = dir.join("logs");
        assert!(!CrashFlags::is_flagged(&dir));

        let flags = CrashFlags::initialize(&dir).unwrap();
        assert!(!flags.is_crashed());
        assert!(CrashFlags::is_flagged(&dir));
        // The run ends without finalizing.
        drop(flags);

        let flags = CrashFlags::initialize(&dir).unwrap();
        assert!(flags.is_crashed());
        flags.finalize().unwrap();
        assert!(!CrashFlags::is_flagged(&dir));

        let flags = CrashFlags::initialize(&dir).unwrap();
        assert!(!flags.is_crashed());
        flags.finalize().unwrap();
    });
}

#[test]
fn crash_registry_keeps_crashed_ids() {
    with_dir(|dir| {
        let path = dir.join("registry");
        let server = dir.join("server");
        let worker = dir.join("worker");

        let mut registry = CrashRegistry::open(&path).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.register(&server).unwrap(), 1);
        assert_eq!(registry.register(&worker).unwrap(), 2);
        assert_eq!(registry.register(&server).unwrap(), 1);

        let mut registry = CrashRegistry::open(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.was_running(&server), Some(1));
        assert!(registry.unregister(&server).unwrap());
        assert!(!registry.unregister(&server).unwrap());

        let mut registry = CrashRegistry::open(&path).unwrap();
        assert_eq!(registry.was_running(&server), None);
        assert_eq!(registry.was_running(&worker), Some(2));
        assert_eq!(registry.register(&server).unwrap(), 3);
    });
}

#[test]
fn crash_registry_skips_malformed_lines() {
    with_dir(|dir| {
        let path = dir.join("registry");
        std::fs::write(&path, "7 /bin/a\ngarbage\n8\n").unwrap();

        let registry = CrashRegistry::open(&path).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.was_running(Path::new("/bin/a")), Some(7));
    });
}

#[derive(Clone, Debug)]
enum Op {
    Store(u64, u64),
    Memset(u64, u8, u64),
    Memcpy(u64, Vec<u8>),
}

const IMAGE: u64 = 256;

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..IMAGE - 8, any::<u64>()).prop_map(|(at, value)| Op::Store(at, value)),
        (0..IMAGE, any::<u8>(), 0..32u64)
            .prop_map(|(at, byte, len)| Op::Memset(at.min(IMAGE - len), byte, len)),
        (0..IMAGE, prop::collection::vec(any::<u8>(), 1..64)).prop_map(|(at, bytes)| {
            let at = at.min(IMAGE - bytes.len() as u64);
            Op::Memcpy(at, bytes)
        }),
    ]
}

proptest! {
    #[test]
    fn replay_is_idempotent(ops in prop::collection::vec(op(), 1..24)) {
        let log = Arc::new(DurableLog::create(LogRegion::in_memory(1 << 12)).unwrap());
        let mut thread = log.thread(1);
        let mut expected = vec![0u8; IMAGE as usize];

        for op in &ops {
            match op {
                Op::Store(at, value) => {
                    thread.store(addr(*at), &value.to_le_bytes()).unwrap();
                    expected[*at as usize..][..8].copy_from_slice(&value.to_le_bytes());
                }
                Op::Memset(at, byte, len) => {
                    thread.memset(addr(*at), *byte, *len).unwrap();
                    expected[*at as usize..][..*len as usize].fill(*byte);
                }
                Op::Memcpy(at, bytes) => {
                    thread.memcpy(addr(*at), bytes).unwrap();
                    expected[*at as usize..][..bytes.len()].copy_from_slice(bytes);
                }
            }
        }

        let mut image = vec![0u8; IMAGE as usize];
        Replayer::new(&log).recover_all(&mut image).unwrap();
        prop_assert_eq!(&image, &expected);

        Replayer::new(&log).recover_all(&mut image).unwrap();
        prop_assert_eq!(&image, &expected);
    }
}
