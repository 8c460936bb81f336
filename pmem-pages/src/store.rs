//! Shared page state and the commit protocol.
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use memmap2::{MmapMut, MmapOptions, MmapRaw};
use parking_lot::{Mutex, MutexGuard};
use pmem_fd::{BackingFd, Os, Protection, PAGE_SIZE};
use pmem_state::DurableLog;

use crate::config::Config;
use crate::error::{fatal, PageError};
use crate::lookup::{LookupInfo, LookupTable};
use crate::memlog::{last_xact, MemoryLogger};
use crate::twin::{diff_apply, PageBuf, Sharing, TwinPool};
use crate::varmap::{VarEntry, VarMap};
use crate::workspace::Workspace;

const UNOWNED: u32 = 0;
const SHARED: u32 = u32::MAX;

/// Who may keep a page dirty across commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOwner {
    Unowned,
    Shared,
    Thread(u32),
}

impl PageOwner {
    fn from_word(word: u32) -> Self {
        match word {
            UNOWNED => PageOwner::Unowned,
            SHARED => PageOwner::Shared,
            tid => PageOwner::Thread(tid - 1),
        }
    }
}

fn owner_word(tid: u32) -> u32 {
    tid + 1
}

pub(crate) struct PageState {
    pub(crate) sharing: Sharing,
    pub(crate) twin: Option<PageBuf>,
}

/// Access of a thread to a page of its transient copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Not yet touched, any access must go through the store first.
    None,
    Read,
    Write,
}

/// The private copy of one thread.
pub(crate) struct Transient {
    pub(crate) tid: u32,
    pub(crate) map: MmapMut,
    pub(crate) access: Vec<Access>,
    /// Dirty pages with the shared version at the time they were first written.
    pub(crate) dirty: BTreeMap<usize, u64>,
    /// Pages kept dirty across commits, exclusively owned by this thread.
    pub(crate) owned: BTreeMap<usize, u64>,
    pub(crate) logger: MemoryLogger,
}

impl Transient {
    pub(crate) fn page(&self, page: usize) -> &[u8] {
        &self.map[page * PAGE_SIZE..][..PAGE_SIZE]
    }

    fn page_ptr(&mut self, page: usize) -> *mut u8 {
        // Safety: callers pass pages within the store.
        unsafe { self.map.as_mut_ptr().add(page * PAGE_SIZE) }
    }
}

/// Which pages a commit writes and how it merges them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Merge {
    /// Bring stale pages up to date, keeping the bytes of other writers.
    Update,
    /// Copy when the shared version did not move, diff against the twin otherwise.
    Commit,
}

/// Summary of one commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub xact: Option<u64>,
    pub pages: usize,
    /// Pages kept dirty under exclusive ownership.
    pub kept: usize,
    /// Whether another thread logged one of the pages since the last buffer flush.
    pub foreign: bool,
}

/// The persistent image of a store, shared by all threads.
pub struct PageStore {
    config: Config,
    os: Os,
    backing: BackingFd,
    persistent: MmapRaw,
    versions: Box<[AtomicU64]>,
    owners: Box<[AtomicU32]>,
    pages: Box<[Mutex<PageState>]>,
    twins: TwinPool,
    lookup: LookupTable,
    varmap: Mutex<VarMap>,
    varmap_path: PathBuf,
    xact: AtomicU64,
    participants: Mutex<HashMap<u32, Weak<Mutex<Transient>>>>,
    log: Option<Arc<DurableLog>>,
    log_dir: PathBuf,
}

impl PageStore {
    pub fn open(config: Config) -> io::Result<Arc<Self>> {
        Self::open_inner(config, None)
    }

    /// Open a store whose workspaces also append to `log`.
    pub fn with_log(config: Config, log: Arc<DurableLog>) -> io::Result<Arc<Self>> {
        Self::open_inner(config, Some(log))
    }

    fn open_inner(config: Config, log: Option<Arc<DurableLog>>) -> io::Result<Arc<Self>> {
        config.validate()?;
        let log_dir = config.log_dir();
        std::fs::create_dir_all(&log_dir)?;

        let os = Os::new();
        let backing = BackingFd::open(&config.backing_file)?;
        if let Err(err) = backing.truncate(&os, config.image_len() as u64) {
            fatal("cannot size the backing file", &err);
        }

        let persistent = MmapRaw::map_raw(backing.file())?;
        let lookup = LookupTable::create(&log_dir, config.kind, config.pages)?;
        let xact = last_xact(&log_dir)? + 1;

        let suffix = config.kind.suffix();
        let varmap_path = log_dir.join(format!("varmap_{suffix}"));

        tracing::debug!(
            backing = ?config.backing_file,
            pages = config.pages,
            xact,
            "page store opened"
        );

        Ok(Arc::new(PageStore {
            versions: (0..config.pages).map(|_| AtomicU64::new(0)).collect(),
            owners: (0..config.pages).map(|_| AtomicU32::new(UNOWNED)).collect(),
            pages: (0..config.pages)
                .map(|_| {
                    Mutex::new(PageState {
                        sharing: Sharing::Unshared,
                        twin: None,
                    })
                })
                .collect(),
            twins: TwinPool::new(),
            lookup,
            varmap: Mutex::new(VarMap::new()),
            varmap_path,
            xact: AtomicU64::new(xact),
            participants: Mutex::new(HashMap::new()),
            log,
            log_dir,
            config,
            os,
            backing,
            persistent,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log(&self) -> Option<&Arc<DurableLog>> {
        self.log.as_ref()
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn lookup(&self) -> &LookupTable {
        &self.lookup
    }

    pub fn pages(&self) -> usize {
        self.config.pages
    }

    pub fn len(&self) -> usize {
        self.config.image_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self, page: usize) -> u64 {
        self.versions[page].load(Ordering::Acquire)
    }

    pub fn owner(&self, page: usize) -> PageOwner {
        PageOwner::from_word(self.owners[page].load(Ordering::Acquire))
    }

    pub fn users(&self, page: usize) -> u32 {
        self.pages[page].lock().sharing.users()
    }

    /// Allocate the next transaction id, unique in this log directory.
    pub fn next_xact(&self) -> u64 {
        self.xact.fetch_add(1, Ordering::Relaxed)
    }

    /// A private copy of the image for thread `tid`.
    pub fn workspace(self: &Arc<Self>, tid: u32) -> io::Result<Workspace> {
        let len = self.len();
        // Safety: the mapping is private, changes of the file show through until a page is
        // written and the private copy is discarded on commit.
        let mut map = unsafe { MmapOptions::new().len(len).map_copy(self.backing.file())? };
        // Safety: the mapping is ours and no reference into it exists yet.
        unsafe { self.os.protect(map.as_mut_ptr(), len, Protection::None) }?;

        let transient = Arc::new(Mutex::new(Transient {
            tid,
            map,
            access: vec![Access::None; self.config.pages],
            dirty: BTreeMap::new(),
            owned: BTreeMap::new(),
            logger: MemoryLogger::new(&self.log_dir, tid),
        }));

        {
            let mut participants = self.participants.lock();
            let live = participants
                .get(&tid)
                .map_or(false, |other| other.strong_count() > 0);
            if live {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("thread {tid} already has a workspace"),
                ));
            }

            participants.insert(tid, Arc::downgrade(&transient));
        }

        let thread = self.log.as_ref().map(|log| log.thread(tid));
        Ok(Workspace::new(self.clone(), tid, transient, thread))
    }

    pub(crate) fn deregister(&self, tid: u32) {
        self.participants.lock().remove(&tid);
    }

    /// Record `name` as the variable of `size` bytes at `offset`.
    pub fn register_variable(&self, name: &str, offset: usize, size: usize) -> Result<(), PageError> {
        self.check_range(offset, size)?;
        let mut varmap = self.varmap.lock();
        varmap.insert(name, VarEntry::at(offset, size));
        varmap.write_to(&self.varmap_path)?;
        Ok(())
    }

    pub fn variables(&self) -> VarMap {
        self.varmap.lock().clone()
    }

    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<(), PageError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(PageError::OutOfBounds { offset, len }),
        }
    }

    /// Copy committed bytes of the image.
    pub fn read_persistent(&self, offset: usize, buf: &mut [u8]) -> Result<(), PageError> {
        self.check_range(offset, buf.len())?;

        let mut at = 0;
        while at < buf.len() {
            let pos = offset + at;
            let page = pos / PAGE_SIZE;
            let chunk = (PAGE_SIZE - pos % PAGE_SIZE).min(buf.len() - at);

            let _guard = self.pages[page].lock();
            // Safety: in bounds, writers of the shared mapping hold the page lock.
            let src = unsafe { core::slice::from_raw_parts(self.persistent.as_ptr().add(pos), chunk) };
            buf[at..at + chunk].copy_from_slice(src);
            at += chunk;
        }

        Ok(())
    }

    fn persistent_page(&self, page: usize) -> *mut u8 {
        // Safety: callers pass pages within the store.
        unsafe { self.persistent.as_mut_ptr().add(page * PAGE_SIZE) }
    }

    /// A thread started writing `page`.
    pub(crate) fn join(&self, page: usize) -> u64 {
        let mut state = self.pages[page].lock();
        state.sharing = state.sharing.join();
        if state.sharing.users() > 1 && state.twin.is_none() {
            // Safety: page lock held.
            let persistent = unsafe { core::slice::from_raw_parts(self.persistent_page(page), PAGE_SIZE) };
            state.twin = Some(self.twins.snapshot(persistent));
            tracing::trace!(page, "twin created");
        }

        self.versions[page].load(Ordering::Acquire)
    }

    /// Try to make `tid` the exclusive owner of `page`.
    pub(crate) fn claim(&self, page: usize, tid: u32) -> bool {
        let word = &self.owners[page];
        let mine = owner_word(tid);
        let current = word.load(Ordering::Acquire);
        if current == mine {
            return true;
        }

        if current != UNOWNED && current != SHARED {
            return false;
        }

        word.compare_exchange(current, mine, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Revoke the ownership of `page` by another thread, committing its pending changes.
    ///
    /// A page the owner is still writing is only marked shared, its next commit diffs against
    /// the twin created when other writers join.
    pub fn notify_owner_to_commit(&self, page: usize) -> Result<(), PageError> {
        let word = self.owners[page].load(Ordering::Acquire);
        let PageOwner::Thread(tid) = PageOwner::from_word(word) else {
            return Ok(());
        };

        let transient = self.participants.lock().get(&tid).and_then(Weak::upgrade);
        if let Some(transient) = transient {
            let mut transient = transient.lock();
            if transient.owned.contains_key(&page) {
                self.commit_owned_page(&mut transient, page, true)?;
            }
        }

        match self.owners[page].compare_exchange(word, SHARED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => tracing::trace!(page, owner = tid, "ownership revoked"),
            // Committing the owned page marked it shared already, or the owner gave it up.
            Err(now) => {
                let now = PageOwner::from_word(now);
                tracing::trace!(page, owner = tid, ?now, "ownership moved on");
            }
        }

        Ok(())
    }

    /// Commit every page that thread `tid` kept under ownership, for a thread that is killed.
    pub fn force_commit_owned(&self, tid: u32) -> Result<usize, PageError> {
        let transient = self.participants.lock().get(&tid).and_then(Weak::upgrade);
        let Some(transient) = transient else {
            return Ok(0);
        };

        let mut transient = transient.lock();
        self.commit_all_owned(&mut transient)
    }

    pub(crate) fn commit_all_owned(&self, transient: &mut Transient) -> Result<usize, PageError> {
        let owned: Vec<usize> = transient.owned.keys().copied().collect();
        for &page in &owned {
            self.commit_owned_page(transient, page, true)?;
        }

        Ok(owned.len())
    }

    /// Commit a page kept under ownership. With `set_shared` the page loses its owner.
    pub(crate) fn commit_owned_page(
        &self,
        transient: &mut Transient,
        page: usize,
        set_shared: bool,
    ) -> Result<(), PageError> {
        let Some(version) = transient.owned.remove(&page) else {
            return Ok(());
        };

        self.write_pages(transient, &[(page, version)], Merge::Commit)?;
        if set_shared {
            self.owners[page].store(SHARED, Ordering::Release);
        }

        Ok(())
    }

    /// Commit the dirty pages of a transient copy.
    ///
    /// With `update` only pages whose shared version moved since they were first written are
    /// committed, the others stay dirty.
    pub(crate) fn commit_transient(
        &self,
        transient: &mut Transient,
        update: bool,
    ) -> Result<CommitStats, PageError> {
        let mut selected = vec![];
        let mut kept = vec![];
        let mine = owner_word(transient.tid);

        for (&page, &version) in &transient.dirty {
            if update {
                if self.version(page) != version {
                    selected.push((page, version));
                }
                continue;
            }

            let exclusive = self.owners[page].load(Ordering::Acquire) == mine
                && self.pages[page].lock().sharing.users() == 1;
            if exclusive {
                kept.push((page, version));
            } else {
                selected.push((page, version));
            }
        }

        for &(page, version) in &kept {
            transient.dirty.remove(&page);
            transient.owned.insert(page, version);
            let ptr = transient.page_ptr(page);
            // Safety: our own mapping, no references into it are held across this call.
            if let Err(err) = unsafe { self.os.protect(ptr, PAGE_SIZE, Protection::Read) } {
                fatal("cannot protect an owned page", &err);
            }
            transient.access[page] = Access::Read;
        }

        let merge = if update { Merge::Update } else { Merge::Commit };
        let (xact, foreign) = self.write_pages(transient, &selected, merge)?;

        let stats = CommitStats {
            xact,
            pages: selected.len(),
            kept: kept.len(),
            foreign,
        };

        if stats.pages > 0 {
            tracing::debug!(
                tid = transient.tid,
                xact = stats.xact,
                pages = stats.pages,
                kept = stats.kept,
                update,
                "commit"
            );
        }

        Ok(stats)
    }

    /// Log, then apply, then refresh a set of pages. Returns the transaction and whether
    /// another thread logged one of the pages before.
    fn write_pages(
        &self,
        transient: &mut Transient,
        pages: &[(usize, u64)],
        merge: Merge,
    ) -> Result<(Option<u64>, bool), PageError> {
        if pages.is_empty() {
            return Ok((None, false));
        }

        // Pages are sorted, locking in ascending order.
        let mut states: Vec<MutexGuard<'_, PageState>> =
            pages.iter().map(|&(page, _)| self.pages[page].lock()).collect();

        let xact = self.next_xact();
        let tid = transient.tid;
        if let Err(err) = transient.logger.open(xact) {
            fatal("cannot open a memory log", &err);
        }

        let mut images = Vec::with_capacity(pages.len());
        let mut foreign = false;
        for (&(page, version), state) in pages.iter().zip(&mut states) {
            // Safety: page lock held.
            let persistent = unsafe { core::slice::from_raw_parts(self.persistent_page(page), PAGE_SIZE) };
            let mut image = self.twins.snapshot(persistent);
            let local = transient.page(page);

            let current = self.versions[page].load(Ordering::Acquire);
            match (&state.twin, merge) {
                (None, _) => image.copy_from_slice(local),
                (Some(_), Merge::Commit) if current == version => image.copy_from_slice(local),
                (Some(twin), _) => diff_apply(local, &twin[..], &mut image[..]),
            }

            let offset = match transient.logger.append(page as u64, &image[..]) {
                Ok(offset) => offset,
                Err(err) => fatal("cannot write a memory log", &err),
            };

            self.lookup.record_lookup(
                page,
                LookupInfo {
                    xact,
                    thread: tid,
                    offset,
                    dirtied: true,
                },
            );
            foreign |= self.lookup.record_dependence(page, tid);
            images.push(image);
        }

        if let Err(err) = transient.logger.close() {
            fatal("cannot close a memory log", &err);
        }

        for ((&(page, _), state), image) in pages.iter().zip(&mut states).zip(images) {
            let dest = self.persistent_page(page);
            // Safety: page lock held, the image is a whole page.
            unsafe { core::ptr::copy_nonoverlapping(image.as_ptr(), dest, PAGE_SIZE) };
            self.twins.release(image);

            if let Err(err) = self
                .config
                .durability
                .persist(&self.os, self.backing.as_raw_fd(), dest, PAGE_SIZE)
            {
                fatal("cannot persist a page", &err);
            }

            self.versions[page].fetch_add(1, Ordering::AcqRel);
            state.sharing = state.sharing.leave();
            if state.sharing.users() == 0 {
                if let Some(twin) = state.twin.take() {
                    self.twins.release(twin);
                }
            }

            tracing::trace!(page, xact, "page committed");
        }

        drop(states);

        for &(page, _) in pages {
            let ptr = transient.page_ptr(page);
            // Safety: our own mapping and the caller holds no reference into it. The private
            // copy is dropped, the page now shows the shared mapping.
            let refreshed = unsafe {
                self.os
                    .discard(ptr, PAGE_SIZE)
                    .and_then(|()| self.os.protect(ptr, PAGE_SIZE, Protection::Read))
            };

            if let Err(err) = refreshed {
                fatal("cannot refresh a committed page", &err);
            }

            transient.access[page] = Access::Read;
            transient.dirty.remove(&page);
        }

        Ok((Some(xact), foreign))
    }

    /// Drop the uncommitted pages of a transient copy.
    pub(crate) fn abandon(&self, transient: &mut Transient) -> usize {
        let dirty = core::mem::take(&mut transient.dirty);
        let mine = owner_word(transient.tid);
        for &page in dirty.keys() {
            // Pages another thread claimed since keep their owner.
            if self.owners[page]
                .compare_exchange(mine, UNOWNED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::trace!(page, tid = transient.tid, "ownership dropped");
            }
            {
                let mut state = self.pages[page].lock();
                state.sharing = state.sharing.leave();
                if state.sharing.users() == 0 {
                    if let Some(twin) = state.twin.take() {
                        self.twins.release(twin);
                    }
                }
            }

            let ptr = transient.page_ptr(page);
            // Safety: our own mapping, no references into it are held across this call.
            if let Err(err) = unsafe { self.os.discard(ptr, PAGE_SIZE) } {
                fatal("cannot discard a page", &err);
            }
            self.protect(transient, page, Access::Read);
        }

        if !dirty.is_empty() {
            tracing::debug!(tid = transient.tid, pages = dirty.len(), "uncommitted pages dropped");
        }

        dirty.len()
    }

    /// Set the protection of one page of a transient copy.
    pub(crate) fn protect(&self, transient: &mut Transient, page: usize, access: Access) {
        let prot = match access {
            Access::None => Protection::None,
            Access::Read => Protection::Read,
            Access::Write => Protection::ReadWrite,
        };

        let ptr = transient.page_ptr(page);
        // Safety: our own mapping, no references into it are held across this call.
        if let Err(err) = unsafe { self.os.protect(ptr, PAGE_SIZE, prot) } {
            fatal("cannot change page protection", &err);
        }

        transient.access[page] = access;
    }

    /// Flush buffered lookup records of finished sections.
    pub fn commit_lookup_buffer(&self) -> Result<usize, PageError> {
        Ok(self.lookup.commit_buffer()?)
    }
}
