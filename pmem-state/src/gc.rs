//! The consistency collector.
//!
//! A pass groups every thread's log into outermost critical sections, connects them by the
//! releases their acquisitions observed, and proves which sections no longer need to be replayed.
//! The prefix of each thread's log made up of such sections is cut off by installing a new list of
//! log structures with a single compare-and-swap of the header pointer, after which the excised
//! entries are freed.
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::entry::{Handle, LogEntry, LogStructure};
use crate::error::GcError;
use crate::graph::{DependencyGraph, NodeId};
use crate::log::DurableLog;

/// Bounds one outermost critical section of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OcsMarker {
    pub first: Handle,
    /// The end-of-section entry that brought the nesting back to zero.
    pub last: Handle,
    pub deleted: bool,
}

/// Find the section starting at `first`.
///
/// Entries before the first section start are part of the section. `None` if the section is not
/// closed yet, or if its closing entry is still the last entry of the thread.
pub fn create_ocs_marker(log: &DurableLog, first: Handle) -> Option<OcsMarker> {
    let mut depth = 0u32;
    let mut cursor = first;

    loop {
        let entry = log.entry(cursor)?;
        let next = log.next(cursor)?;

        if entry.kind.is_start_section() {
            depth += 1;
        }

        if entry.kind.is_end_section() {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(OcsMarker {
                    first,
                    last: cursor,
                    deleted: false,
                });
            }
        }

        cursor = next;
    }
}

/// Summary of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcRound {
    pub round: u64,
    /// Closed sections found.
    pub ocses: usize,
    /// Sections excluded from collection, including those on cycles.
    pub unstable: usize,
    /// Sections found on dependency cycles.
    pub cyclic: usize,
    /// Slots freed.
    pub freed: usize,
    /// Failed swings of the header pointer.
    pub retries: u32,
    /// Whether a new version was installed.
    pub swung: bool,
}

struct ThreadScan {
    structure: LogStructure,
    markers: Vec<OcsMarker>,
    nodes: Vec<NodeId>,
}

struct OcsNode {
    stable: bool,
}

pub struct Collector {
    log: Arc<DurableLog>,
    round: u64,
}

impl Collector {
    pub fn new(log: Arc<DurableLog>) -> Self {
        Collector { log, round: 0 }
    }

    /// Number of passes run.
    pub fn rounds(&self) -> u64 {
        self.round
    }

    /// Run the collector on a background thread every `interval`.
    pub fn spawn(log: Arc<DurableLog>, interval: Duration) -> std::io::Result<GcHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let mut collector = Collector::new(log);

        let thread = std::thread::Builder::new()
            .name("pmem-gc".into())
            .spawn(move || {
                loop {
                    let stopping = flag.load(Ordering::Acquire);
                    match collector.collect() {
                        Ok(round) => tracing::trace!(?round, "collection"),
                        Err(err) => tracing::warn!(%err, "collection failed"),
                    }

                    if stopping {
                        break;
                    }

                    std::thread::park_timeout(interval);
                }

                collector.rounds()
            })?;

        Ok(GcHandle {
            stop,
            thread: Some(thread),
        })
    }

    /// One full pass.
    pub fn collect(&mut self) -> Result<GcRound, GcError> {
        if !self.log.try_begin_collect() {
            return Err(GcError::Busy);
        }

        self.round += 1;
        let result = self.pass(self.round);
        self.log.end_collect();

        if let Ok(round) = &result {
            if round.swung {
                tracing::debug!(
                    round = round.round,
                    ocses = round.ocses,
                    unstable = round.unstable,
                    freed = round.freed,
                    retries = round.retries,
                    "log version installed"
                );
            }
        }

        result
    }

    fn pass(&self, round: u64) -> Result<GcRound, GcError> {
        let log = &*self.log;
        let mut stats = GcRound {
            round,
            ..GcRound::default()
        };

        let old_header = log.header();
        let mut referenced = HashSet::new();
        let mut threads = Vec::new();

        for structure in log.structures_from(old_header) {
            let mut markers = Vec::new();
            let mut cursor = structure.first;

            while let Some(marker) = create_ocs_marker(log, cursor) {
                let Some(next) = log.next(marker.last) else {
                    break;
                };

                markers.push(marker);
                cursor = next;
            }

            // Sections still being written may observe releases this pass retires.
            for entry in log.entries(cursor) {
                if let Some(target) = entry.target() {
                    referenced.insert(target);
                }
            }

            threads.push(ThreadScan {
                structure,
                markers,
                nodes: Vec::new(),
            });
        }

        let mut graph = DependencyGraph::new();
        let mut releases: HashMap<Handle, NodeId> = HashMap::new();
        let mut pending: Vec<(NodeId, Handle)> = Vec::new();

        for thread in &mut threads {
            let mut previous = None;
            for marker in &thread.markers {
                let node = graph.add_node(OcsNode { stable: true });
                // Program order: a later section is only as stable as the earlier ones.
                if let Some(previous) = previous {
                    graph.add_edge(node, previous);
                }

                previous = Some(node);
                thread.nodes.push(node);

                for_each_entry(log, marker, |entry| {
                    if entry.kind.is_release() {
                        releases.insert(entry.handle, node);
                    }

                    if let Some(target) = entry.target() {
                        pending.push((node, target));
                    }
                });
            }
        }

        stats.ocses = graph.len();

        for &(node, target) in &pending {
            referenced.insert(target);
            match releases.get(&target) {
                Some(&source) => {
                    if source != node {
                        graph.add_edge(node, source);
                    }
                }
                // A published release only stops being live when a collector freed it, possibly
                // in an earlier run of the program whose retired set is gone.
                None if log.is_retired(target) || !log.is_live(target) => {}
                None => {
                    if let Some(data) = graph.get_mut(node) {
                        data.stable = false;
                    }
                }
            }
        }

        for cycle in graph.cycles() {
            tracing::warn!(sections = cycle.len(), "dependency cycle between critical sections");
            stats.cyclic += cycle.len();
            for node in cycle {
                if let Some(data) = graph.get_mut(node) {
                    data.stable = false;
                }
            }
        }

        let mut work: Vec<NodeId> = graph
            .ids()
            .filter(|&id| graph.get(id).map_or(false, |data| !data.stable))
            .collect();
        let mut unstable: HashSet<NodeId> = work.iter().copied().collect();

        while let Some(node) = work.pop() {
            for &dependent in graph.dependents(node) {
                if unstable.insert(dependent) {
                    work.push(dependent);
                }
            }
        }

        stats.unstable = unstable.len();
        for &node in &unstable {
            graph.remove_node(node);
        }

        for thread in &mut threads {
            for (marker, node) in thread.markers.iter_mut().zip(&thread.nodes) {
                marker.deleted = graph.contains(*node);
            }
        }

        let mut versions = Vec::with_capacity(threads.len());
        let mut doomed = Vec::new();

        for thread in &threads {
            let first = thread.structure.first;
            let new_first = match thread.markers.iter().find(|marker| !marker.deleted) {
                Some(marker) => marker.first,
                None => match thread.markers.last() {
                    Some(last) => log.next(last.last).unwrap_or(first),
                    None => first,
                },
            };

            let mut cursor = first;
            while cursor != new_first {
                doomed.push(cursor);
                match log.next(cursor) {
                    Some(next) => cursor = next,
                    None => break,
                }
            }

            versions.push((thread.structure.tid, new_first));
        }

        if doomed.is_empty() {
            log.prune_retired(round, &referenced);
            return Ok(stats);
        }

        let mut fresh = Vec::with_capacity(versions.len());
        let mut new_head = Handle::NULL;
        for &(tid, first) in versions.iter().rev() {
            match log.publish_structure(first, tid, new_head) {
                Ok(structure) => {
                    fresh.push(structure);
                    new_head = structure;
                }
                Err(err) => {
                    for structure in fresh {
                        log.free_slot(structure);
                    }
                    return Err(err.into());
                }
            }
        }

        let front = loop {
            let current = log.header();

            // Structures of threads that started logging since the snapshot.
            let mut front = Vec::new();
            let mut cursor = current;
            while cursor != old_header {
                let Some(structure) = log.structure(cursor) else {
                    break;
                };

                front.push(structure);
                cursor = structure.next;
            }

            let mut head = new_head;
            let mut copies = Vec::with_capacity(front.len());
            for structure in front.iter().rev() {
                match log.publish_structure(structure.first, structure.tid, head) {
                    Ok(copy) => {
                        copies.push(copy);
                        head = copy;
                    }
                    Err(err) => {
                        for structure in copies.into_iter().chain(fresh) {
                            log.free_slot(structure);
                        }
                        return Err(err.into());
                    }
                }
            }

            if log.cas_header(current, head) {
                break front;
            }

            for copy in copies {
                log.free_slot(copy);
            }

            stats.retries += 1;
        };

        stats.swung = true;

        for structure in threads.iter().map(|thread| &thread.structure).chain(&front) {
            if log.free_slot(structure.handle) {
                stats.freed += 1;
            }
        }

        for handle in doomed {
            let Some(entry) = log.entry(handle) else {
                continue;
            };

            // Recorded before the slot is freed, so a racing acquisition that still read the
            // handle finds it retired rather than unknown.
            if entry.kind.is_release() {
                log.retire(handle, round);
                log.owners().retire_release(entry.addr, handle);
            }

            stats.freed += log.free_entry(&entry);
        }

        log.prune_retired(round, &referenced);
        Ok(stats)
    }
}

fn for_each_entry(log: &DurableLog, marker: &OcsMarker, mut f: impl FnMut(&LogEntry)) {
    for entry in log.entries(marker.first) {
        f(&entry);
        if entry.handle == marker.last {
            break;
        }
    }
}

/// The background collector thread.
///
/// Dropping the handle stops the thread as well.
pub struct GcHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<u64>>,
}

impl GcHandle {
    /// Run a final pass, then join the thread. Returns the number of passes run.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        let Some(thread) = self.thread.take() else {
            return 0;
        };

        self.stop.store(true, Ordering::Release);
        thread.thread().unpark();
        match thread.join() {
            Ok(rounds) => rounds,
            Err(_) => {
                tracing::error!("collector thread panicked");
                0
            }
        }
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
