use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pmem_fd::PAGE_SIZE;
use pmem_state::{PersistentAddr, ThreadLog};

use crate::error::PageError;
use crate::store::{Access, CommitStats, PageOwner, PageStore, Transient};

/// A lock guarding a critical section of the persistent image.
///
/// Waiting threads do not block: every failed attempt commits their dirty pages instead.
#[derive(Debug)]
pub struct SectionLock {
    id: u64,
    locked: AtomicBool,
}

impl SectionLock {
    /// A lock identified by `id` in the durable log.
    pub const fn new(id: u64) -> Self {
        SectionLock {
            id,
            locked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// The view of one thread on a [`PageStore`].
///
/// Writes go to a private copy of the image and become visible to other threads, and durable,
/// only through a commit. Dropping a workspace without [`Workspace::final_commit`] behaves like
/// a killed thread: pages it owns are committed, other uncommitted writes are lost.
pub struct Workspace {
    store: Arc<PageStore>,
    tid: u32,
    transient: Arc<Mutex<Transient>>,
    thread: Option<ThreadLog>,
    nesting: u32,
    finished: bool,
}

impl Workspace {
    pub(crate) fn new(
        store: Arc<PageStore>,
        tid: u32,
        transient: Arc<Mutex<Transient>>,
        thread: Option<ThreadLog>,
    ) -> Self {
        Workspace {
            store,
            tid,
            transient,
            thread,
            nesting: 0,
            finished: false,
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    /// The durable log of this thread, if the store has one.
    pub fn thread_log(&self) -> Option<&ThreadLog> {
        self.thread.as_ref()
    }

    /// Depth of nested sections and durable sections.
    pub fn nesting(&self) -> u32 {
        self.nesting
    }

    pub fn access(&self, page: usize) -> Access {
        self.transient.lock().access[page]
    }

    pub fn dirty_pages(&self) -> Vec<usize> {
        self.transient.lock().dirty.keys().copied().collect()
    }

    pub fn owned_pages(&self) -> Vec<usize> {
        self.transient.lock().owned.keys().copied().collect()
    }

    fn check_page(&self, page: usize) -> Result<(), PageError> {
        if page < self.store.pages() {
            Ok(())
        } else {
            Err(PageError::OutOfBounds {
                offset: page * PAGE_SIZE,
                len: PAGE_SIZE,
            })
        }
    }

    /// Make another thread give up `page`. Must not be called with our transient copy locked.
    fn revoke_foreign(&self, page: usize) -> Result<(), PageError> {
        match self.store.owner(page) {
            PageOwner::Thread(owner) if owner != self.tid => self.store.notify_owner_to_commit(page),
            _ => Ok(()),
        }
    }

    pub fn touch_read(&mut self, page: usize) -> Result<(), PageError> {
        self.check_page(page)?;
        self.revoke_foreign(page)?;

        let mut transient = self.transient.lock();
        if transient.access[page] == Access::None {
            self.store.protect(&mut transient, page, Access::Read);
        }

        Ok(())
    }

    /// Prepare `page` for writing.
    ///
    /// A page kept dirty under ownership since the last commit has that state committed first.
    pub fn touch_write(&mut self, page: usize) -> Result<(), PageError> {
        self.check_page(page)?;
        self.revoke_foreign(page)?;

        let mut transient = self.transient.lock();
        if transient.owned.contains_key(&page) {
            self.store.commit_owned_page(&mut transient, page, false)?;
        } else if transient.access[page] == Access::Write {
            return Ok(());
        }

        if self.store.config().lazy_commit {
            self.store.claim(page, self.tid);
        }

        self.store.protect(&mut transient, page, Access::Write);
        let version = self.store.join(page);
        transient.dirty.insert(page, version);
        tracing::trace!(tid = self.tid, page, version, "page dirtied");
        Ok(())
    }

    fn pages_of(offset: usize, len: usize) -> Range<usize> {
        if len == 0 {
            return 0..0;
        }

        offset / PAGE_SIZE..(offset + len - 1) / PAGE_SIZE + 1
    }

    fn addr(&self, offset: usize) -> PersistentAddr {
        PersistentAddr::new(self.store.config().region, offset as u64)
    }

    /// The durable log, when stores are to be recorded in it.
    fn entry_log(&mut self) -> Option<&mut ThreadLog> {
        if self.store.config().entry_logging {
            self.thread.as_mut()
        } else {
            None
        }
    }

    pub fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), PageError> {
        self.store.check_range(offset, buf.len())?;
        for page in Self::pages_of(offset, buf.len()) {
            self.touch_read(page)?;
        }

        let transient = self.transient.lock();
        buf.copy_from_slice(&transient.map[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), PageError> {
        self.store.check_range(offset, bytes.len())?;
        for page in Self::pages_of(offset, bytes.len()) {
            self.touch_write(page)?;
        }

        self.transient.lock().map[offset..offset + bytes.len()].copy_from_slice(bytes);

        let addr = self.addr(offset);
        if let Some(log) = self.entry_log() {
            if bytes.len() <= 8 {
                log.store(addr, bytes)?;
            } else {
                log.memcpy(addr, bytes)?;
            }
        }

        Ok(())
    }

    pub fn fill(&mut self, offset: usize, byte: u8, len: usize) -> Result<(), PageError> {
        self.store.check_range(offset, len)?;
        for page in Self::pages_of(offset, len) {
            self.touch_write(page)?;
        }

        self.transient.lock().map[offset..offset + len].fill(byte);

        let addr = self.addr(offset);
        if let Some(log) = self.entry_log() {
            log.memset(addr, byte, len as u64)?;
        }

        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst`, the ranges may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> Result<(), PageError> {
        self.store.check_range(src, len)?;
        self.store.check_range(dst, len)?;
        for page in Self::pages_of(src, len) {
            self.touch_read(page)?;
        }
        for page in Self::pages_of(dst, len) {
            self.touch_write(page)?;
        }

        let moved = {
            let mut transient = self.transient.lock();
            transient.map.copy_within(src..src + len, dst);
            transient.map[dst..dst + len].to_vec()
        };

        let addr = self.addr(dst);
        if let Some(log) = self.entry_log() {
            log.memmove(addr, &moved)?;
        }

        Ok(())
    }

    pub fn read_u64(&mut self, offset: usize) -> Result<u64, PageError> {
        let mut word = [0; 8];
        self.read(offset, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<(), PageError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Commit all dirty pages.
    pub fn commit(&mut self) -> Result<CommitStats, PageError> {
        self.commit_with(false)
    }

    /// Commit dirty pages, with `update` only those another thread committed over since.
    pub fn commit_with(&mut self, update: bool) -> Result<CommitStats, PageError> {
        let stats = {
            let mut transient = self.transient.lock();
            self.store.commit_transient(&mut transient, update)?
        };

        if self.nesting == 0 && !stats.foreign && stats.pages > 0 {
            self.store.commit_lookup_buffer()?;
        }

        Ok(stats)
    }

    /// Claim exclusive ownership of a range of pages. Owned pages stay dirty across commits
    /// until another thread touches them. Returns the number of pages now owned.
    pub fn own(&mut self, pages: Range<usize>) -> Result<usize, PageError> {
        let mut owned = 0;
        for page in pages {
            self.check_page(page)?;
            self.revoke_foreign(page)?;
            if self.store.claim(page, self.tid) {
                owned += 1;
            }
        }

        Ok(owned)
    }

    /// Enter the section of `lock`, committing on every failed attempt.
    pub fn lock(&mut self, lock: &SectionLock) -> Result<(), PageError> {
        let mut spins = 0;
        while !lock.try_lock() {
            self.commit()?;
            spins += 1;
            if spins >= self.store.config().trylock_spins {
                std::thread::yield_now();
                spins = 0;
            }
        }

        let entered = self.enter(lock.id());
        if entered.is_err() {
            lock.unlock();
        }

        entered
    }

    fn enter(&mut self, id: u64) -> Result<(), PageError> {
        if let Some(thread) = self.thread.as_mut() {
            thread.acquire(id)?;
        }

        self.nesting += 1;
        self.commit_with(true)?;
        Ok(())
    }

    /// Leave the section of `lock`. Its changes are committed before the release is logged.
    pub fn unlock(&mut self, lock: &SectionLock) -> Result<(), PageError> {
        if self.nesting == 0 {
            return Err(PageError::NotInSection);
        }

        let left = self.leave(lock.id());
        lock.unlock();
        left
    }

    fn leave(&mut self, id: u64) -> Result<(), PageError> {
        self.commit()?;
        if let Some(thread) = self.thread.as_mut() {
            thread.release(id)?;
        }

        self.nesting -= 1;
        if self.nesting == 0 {
            self.leave_outermost()?;
        }

        Ok(())
    }

    fn leave_outermost(&mut self) -> Result<(), PageError> {
        self.store.commit_lookup_buffer()?;
        if let Some(thread) = &self.thread {
            thread.log().sync()?;
        }

        Ok(())
    }

    pub fn begin_durable(&mut self) -> Result<(), PageError> {
        if let Some(thread) = self.thread.as_mut() {
            thread.begin_durable()?;
        }

        self.nesting += 1;
        Ok(())
    }

    /// End a durable section, committing everything written inside.
    pub fn end_durable(&mut self) -> Result<(), PageError> {
        if self.nesting == 0 {
            return Err(PageError::NotInSection);
        }

        self.commit()?;
        if let Some(thread) = self.thread.as_mut() {
            thread.end_durable()?;
        }

        self.nesting -= 1;
        if self.nesting == 0 {
            self.leave_outermost()?;
        }

        Ok(())
    }

    /// Commit everything on thread exit, including owned pages.
    pub fn final_commit(mut self) -> Result<(), PageError> {
        self.commit()?;
        {
            let mut transient = self.transient.lock();
            self.store.commit_all_owned(&mut transient)?;
        }

        self.leave_outermost()?;
        self.store.deregister(self.tid);
        self.finished = true;
        tracing::debug!(tid = self.tid, "workspace finished");
        Ok(())
    }

    /// Stop a thread without a final commit. Owned pages are still committed.
    pub fn cancel(mut self) -> Result<usize, PageError> {
        self.finished = true;
        self.cancel_inner()
    }

    fn cancel_inner(&mut self) -> Result<usize, PageError> {
        let committed = {
            let mut transient = self.transient.lock();
            let committed = self.store.commit_all_owned(&mut transient)?;
            self.store.abandon(&mut transient);
            committed
        };

        self.store.deregister(self.tid);
        tracing::debug!(tid = self.tid, owned = committed, "workspace cancelled");
        Ok(committed)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        if let Err(err) = self.cancel_inner() {
            tracing::warn!(tid = self.tid, %err, "dropping workspace");
        }
    }
}
