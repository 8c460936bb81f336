use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use pmem_state::{Collector, DurableLog, Handle, LogRegion, PersistentAddr};

const THREADS: u32 = 4;
const ROUNDS: u64 = 2_000;
const LOCK: u64 = 0x4000;

fn reachable(log: &DurableLog) -> HashSet<Handle> {
    let mut seen = HashSet::new();
    for structure in log.structures() {
        seen.insert(structure.handle);
        for entry in log.entries(structure.first) {
            seen.insert(entry.handle);
        }
    }

    seen
}

#[test]
fn collector_runs_alongside_writers() {
    let log = Arc::new(DurableLog::create(LogRegion::in_memory(1 << 16)).unwrap());
    let gc = Collector::spawn(log.clone(), Duration::from_millis(1)).unwrap();

    let counter = Arc::new(Mutex::new(0u64));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let writers: Vec<_> = (0..THREADS)
        .map(|tid| {
            let log = log.clone();
            let counter = counter.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let mut thread = log.thread(tid);
                barrier.wait();

                for _ in 0..ROUNDS {
                    let mut value = counter.lock().unwrap();
                    thread.acquire(LOCK).unwrap();
                    *value += 1;
                    thread
                        .store(PersistentAddr::new(0, 0), &value.to_le_bytes())
                        .unwrap();
                    thread.release(LOCK).unwrap();
                }

                thread.begin_durable().unwrap();
                thread.tail()
            })
        })
        .collect();

    let tails: Vec<Handle> = writers
        .into_iter()
        .map(|writer| writer.join().unwrap())
        .collect();

    let rounds = gc.stop();
    assert!(rounds > 0);
    assert_eq!(*counter.lock().unwrap(), u64::from(THREADS) * ROUNDS);

    let mut collector = Collector::new(log.clone());
    collector.collect().unwrap();

    let live = reachable(&log);
    for tail in &tails {
        assert!(live.contains(tail), "tail {tail:?} was collected");
    }

    for handle in &live {
        assert!(log.is_live(*handle));
    }

    // Every slot below the high water mark is either reachable or free.
    let stats = log.stats();
    assert_eq!(live.len() + stats.free, stats.high_water as usize - 1);

    // Only the trailing sections are left.
    assert_eq!(log.structures().len(), THREADS as usize);
    assert!(live.len() < (THREADS as usize) * 4);
}
