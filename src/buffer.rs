/*!
# Page Buffers

Every receive buffer is one page of guest memory, made reachable to the
backend through a grant reference. Descriptors live in an arena and are
addressed by small integer ids ([`BufId`]); each one carries an [`Owner`] tag:

```text
        allocate()            response consumed
  Free ───────────> Posted ───────────────────> InFlight
   ▲                  │                            │
   └────suspend()─────┘                            │
   └──────────── release() / return_packet() ──────┘
```

The tag is only ever changed through [`BufferArena::transition`], which is
called from the freelist, the ring engine and the packet pool.
*/

use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;

/// Grant reference handed to the backend for one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GrantRef(pub u32);

impl GrantRef {
    pub const INVALID: GrantRef = GrantRef(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != GrantRef::INVALID
    }
}

/// The grant (capability) service of the hypervisor.
pub trait GrantTable: Send + Sync {
    /// Lets the backend access `page`. `None` when no grant entry is available.
    fn grant_access(&self, page: &Page, readonly: bool) -> Option<GrantRef>;
    /// Revokes a grant obtained from [`GrantTable::grant_access`].
    fn end_access(&self, gref: GrantRef);
}

/// One page of memory shared with the backend.
///
/// The backend writes into the page while it is posted; the frontend reads it
/// once the matching response was consumed. The page is never touched by
/// both sides at the same time, the mutex only makes that hand-over sound.
#[derive(Clone)]
pub struct Page(Arc<Mutex<BytesMut>>);

impl Page {
    pub fn new(size: usize) -> Page {
        Page(Arc::new(Mutex::new(BytesMut::zeroed(size))))
    }

    pub fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles refer to the same memory.
    pub fn same_page(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("addr", &Arc::as_ptr(&self.0))
            .finish()
    }
}

/// Index of a descriptor in the [`BufferArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufId(pub(crate) u32);

impl BufId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Who currently holds a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Free,
    Posted,
    InFlight,
}

#[derive(Debug)]
pub(crate) struct BufferDesc {
    pub(crate) page: Page,
    pub(crate) gref: GrantRef,
    /// Start of valid data within the page.
    pub(crate) offset: usize,
    /// Bytes of valid data starting at `offset`.
    pub(crate) len: usize,
    pub(crate) owner: Owner,
    /// Freelist epoch the grant was obtained in.
    pub(crate) epoch: u32,
}

impl BufferDesc {
    pub(crate) fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Counts of buffers per owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCensus {
    pub free: usize,
    pub posted: usize,
    pub in_flight: usize,
}

impl BufferCensus {
    pub fn total(&self) -> usize {
        self.free + self.posted + self.in_flight
    }
}

pub(crate) struct BufferArena {
    slots: Vec<Option<BufferDesc>>,
    vacant: Vec<BufId>,
    page_size: usize,
}

impl BufferArena {
    pub(crate) fn new(page_size: usize) -> BufferArena {
        BufferArena {
            slots: Vec::new(),
            vacant: Vec::new(),
            page_size,
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Adds a freshly granted page; it starts out `Free`.
    pub(crate) fn insert(&mut self, page: Page, gref: GrantRef, epoch: u32) -> BufId {
        let desc = BufferDesc {
            page,
            gref,
            offset: 0,
            len: self.page_size,
            owner: Owner::Free,
            epoch,
        };
        match self.vacant.pop() {
            Some(id) => {
                self.slots[id.index()] = Some(desc);
                id
            }
            None => {
                self.slots.push(Some(desc));
                BufId(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Takes a `Free` buffer out of the arena for good.
    pub(crate) fn remove(&mut self, id: BufId) -> Option<BufferDesc> {
        match self.slots.get(id.index()) {
            Some(Some(desc)) if desc.owner == Owner::Free => {}
            _ => return None,
        }
        self.vacant.push(id);
        self.slots[id.index()].take()
    }

    pub(crate) fn owner(&self, id: BufId) -> Option<Owner> {
        self.slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .map(|d| d.owner)
    }

    /// Moves a buffer from `from` to `to`.
    ///
    /// Returns `false` and leaves the tag alone when the buffer is not held by
    /// `from`, which means two parties believed they owned it.
    pub(crate) fn transition(&mut self, id: BufId, from: Owner, to: Owner) -> bool {
        match self.slots.get_mut(id.index()).and_then(|s| s.as_mut()) {
            Some(desc) if desc.owner == from => {
                desc.owner = to;
                true
            }
            Some(desc) => {
                crate::error::defect(format_args!(
                    "buffer {id:?} owned by {:?}, expected {from:?} (moving to {to:?})",
                    desc.owner
                ));
                false
            }
            None => {
                crate::error::defect(format_args!("buffer {id:?} does not exist"));
                false
            }
        }
    }

    pub(crate) fn census(&self) -> BufferCensus {
        let mut census = BufferCensus::default();
        for desc in self.slots.iter().flatten() {
            match desc.owner {
                Owner::Free => census.free += 1,
                Owner::Posted => census.posted += 1,
                Owner::InFlight => census.in_flight += 1,
            }
        }
        census
    }
}

impl Index<BufId> for BufferArena {
    type Output = BufferDesc;

    fn index(&self, id: BufId) -> &BufferDesc {
        match self.slots.get(id.index()) {
            Some(Some(desc)) => desc,
            _ => panic!("stale buffer id {id:?}"),
        }
    }
}

impl IndexMut<BufId> for BufferArena {
    fn index_mut(&mut self, id: BufId) -> &mut BufferDesc {
        match self.slots.get_mut(id.index()) {
            Some(Some(desc)) => desc,
            _ => panic!("stale buffer id {id:?}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Grant table handing out sequential references, optionally limited.
    #[derive(Default)]
    pub(crate) struct CountingGrants {
        next: AtomicU32,
        pub(crate) limit: Option<u32>,
        pub(crate) live: Mutex<HashMap<GrantRef, Page>>,
    }

    impl CountingGrants {
        pub(crate) fn limited(limit: u32) -> Self {
            CountingGrants {
                limit: Some(limit),
                ..Default::default()
            }
        }

        pub(crate) fn live(&self) -> usize {
            self.live.lock().unwrap().len()
        }
    }

    impl GrantTable for CountingGrants {
        fn grant_access(&self, page: &Page, _readonly: bool) -> Option<GrantRef> {
            let mut live = self.live.lock().unwrap();
            if let Some(limit) = self.limit {
                if live.len() as u32 >= limit {
                    return None;
                }
            }
            let gref = GrantRef(self.next.fetch_add(1, Ordering::Relaxed));
            live.insert(gref, page.clone());
            Some(gref)
        }

        fn end_access(&self, gref: GrantRef) {
            self.live.lock().unwrap().remove(&gref);
        }
    }
}
