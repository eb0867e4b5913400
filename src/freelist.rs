//! Page freelist: the pool every posted, reassembled and segmented buffer is
//! drawn from and returned to.

use std::sync::Arc;

use crate::buffer::{BufId, BufferArena, BufferCensus, GrantRef, GrantTable, Owner, Page};

/// Stack of free buffers plus the low-water bookkeeping used by [`BufferPool::trim`].
pub(crate) struct Freelist {
    free: Vec<BufId>,
    /// Smallest free count seen since the last trim.
    lowest: usize,
    target: usize,
    trim_cap: usize,
}

impl Freelist {
    fn new(target: usize, trim_cap: usize) -> Freelist {
        Freelist {
            free: Vec::with_capacity(target * 2),
            lowest: 0,
            target,
            trim_cap,
        }
    }

    fn pop(&mut self) -> Option<BufId> {
        let id = self.free.pop()?;
        if self.free.len() < self.lowest {
            self.lowest = self.free.len();
        }
        Some(id)
    }
}

/// Buffer arena, freelist and the grant service, updated together under the rx lock.
pub(crate) struct BufferPool {
    pub(crate) arena: BufferArena,
    freelist: Freelist,
    grants: Arc<dyn GrantTable>,
    /// Bumped on every resume; grants from older epochs are no longer valid.
    epoch: u32,
}

impl BufferPool {
    pub(crate) fn new(
        page_size: usize,
        target: usize,
        trim_cap: usize,
        grants: Arc<dyn GrantTable>,
    ) -> BufferPool {
        BufferPool {
            arena: BufferArena::new(page_size),
            freelist: Freelist::new(target, trim_cap),
            grants,
            epoch: 0,
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.arena.page_size()
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.freelist.free.len()
    }

    #[cfg(test)]
    pub(crate) fn low_water(&self) -> usize {
        self.freelist.lowest
    }

    /// Hands out a buffer to `owner`, growing the pool when the freelist is empty.
    ///
    /// Returns `None` only when a new page could not be granted.
    pub(crate) fn allocate(&mut self, owner: Owner) -> Option<BufId> {
        let id = match self.freelist.pop() {
            Some(id) => id,
            None => {
                let page = Page::new(self.arena.page_size());
                let gref = self.grants.grant_access(&page, false)?;
                self.arena.insert(page, gref, self.epoch)
            }
        };
        self.arena.transition(id, Owner::Free, owner);
        Some(id)
    }

    /// Takes a buffer back from `from`, restoring its full-page window.
    pub(crate) fn release(&mut self, id: BufId, from: Owner) {
        if !self.arena.transition(id, from, Owner::Free) {
            return;
        }
        let page_size = self.arena.page_size();
        let desc = &mut self.arena[id];
        desc.offset = 0;
        desc.len = page_size;
        if self.arena[id].epoch != self.epoch && !self.regrant(id) {
            return;
        }
        self.freelist.free.push(id);
    }

    /// Gives `id` a grant valid in the current epoch, dropping the page if none is available.
    fn regrant(&mut self, id: BufId) -> bool {
        let desc = &self.arena[id];
        match self.grants.grant_access(&desc.page, false) {
            Some(gref) => {
                let desc = &mut self.arena[id];
                desc.gref = gref;
                desc.epoch = self.epoch;
                true
            }
            None => {
                log::warn!("no grant for {id:?} after resume, dropping page");
                self.arena.remove(id);
                false
            }
        }
    }

    fn destroy(&mut self, id: BufId) {
        if let Some(desc) = self.arena.remove(id) {
            if desc.epoch == self.epoch && desc.gref.is_valid() {
                self.grants.end_access(desc.gref);
            }
        }
    }

    /// Periodic trim: gives back pages the freelist has not needed since the last call.
    ///
    /// Returns the number of pages freed.
    pub(crate) fn trim(&mut self) -> usize {
        let mut freed = 0;
        if self.freelist.lowest > self.freelist.target {
            let excess = (self.freelist.lowest - self.freelist.target).min(self.freelist.trim_cap);
            for _ in 0..excess {
                let Some(id) = self.freelist.pop() else {
                    break;
                };
                self.destroy(id);
                freed += 1;
            }
            log::debug!("freelist trim freed {freed} pages");
        }
        self.freelist.lowest = self.freelist.free.len();
        freed
    }

    /// Revokes and frees every page on the freelist.
    pub(crate) fn dispose(&mut self) {
        while let Some(id) = self.freelist.free.pop() {
            self.destroy(id);
        }
        self.freelist.lowest = 0;
    }

    /// The backend connection was re-established: every grant handed out so
    /// far is void. Free pages are re-granted now, in-flight ones on release.
    pub(crate) fn resume(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        let free = std::mem::take(&mut self.freelist.free);
        for id in free {
            if self.regrant(id) {
                self.freelist.free.push(id);
            }
        }
        self.freelist.lowest = self.freelist.free.len();
    }

    pub(crate) fn gref(&self, id: BufId) -> GrantRef {
        self.arena[id].gref
    }

    pub(crate) fn census(&self) -> BufferCensus {
        self.arena.census()
    }

    /// Checks that the freelist stack and the owner tags agree.
    pub(crate) fn check_freelist(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for &id in &self.freelist.free {
            if !seen.insert(id) {
                return Err(format!("{id:?} is on the freelist twice"));
            }
            if self.arena.owner(id) != Some(Owner::Free) {
                return Err(format!(
                    "{id:?} is on the freelist but owned by {:?}",
                    self.arena.owner(id)
                ));
            }
        }
        let census = self.arena.census();
        if census.free != self.freelist.free.len() {
            return Err(format!(
                "{} buffers tagged free, {} on the freelist",
                census.free,
                self.freelist.free.len()
            ));
        }
        Ok(())
    }
}
