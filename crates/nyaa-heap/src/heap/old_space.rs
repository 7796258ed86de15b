//! The old generation: pages with segregated free lists.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use sys_alloc::{PageAllocator, Protection};

use super::page::{Page, SpaceKind, PAGE_MASK, PAGE_SIZE};
use super::page_table::PageTable;
use super::ring::{PageArena, PageId, PageRing};
use crate::error::{AllocError, AllocationResult};
use crate::object::round_allocation;

const LIVE_RING: u8 = 0;
const FREE_RING: u8 = 1;
const EVACUATING_RING: u8 = 2;

/// Sizing and policy knobs of an [`OldSpace`].
#[derive(Debug, Clone, Copy)]
pub struct OldSpaceOptions {
    /// Most pages the space may own.
    pub max_pages: usize,
    /// Empty pages kept in the free ring.
    pub max_freed_pages: usize,
    /// Attempts made to map a page.
    pub allocate_retries: usize,
    /// Protect pages while they sit in the free ring.
    pub protect_free_pages: bool,
}

struct OldSpaceInner {
    arena: PageArena<Page>,
    live: PageRing,
    free: PageRing,
    evacuating: PageRing,
    by_base: HashMap<usize, PageId>,
    used_size: usize,
}

/// Free-list allocator over 1 MiB pages.
///
/// Every page is in exactly one ring: *live* pages hold objects (the front
/// page is the working page), *free* pages are empty and kept for reuse, and
/// *evacuating* pages are being emptied by a compaction.
pub struct OldSpace {
    inner: Mutex<OldSpaceInner>,
    allocator: Arc<dyn PageAllocator>,
    page_table: Arc<PageTable>,
    options: OldSpaceOptions,
}

impl OldSpace {
    /// Empty space drawing pages from `allocator`.
    pub fn new(
        allocator: Arc<dyn PageAllocator>,
        page_table: Arc<PageTable>,
        options: OldSpaceOptions,
    ) -> Self {
        Self {
            inner: Mutex::new(OldSpaceInner {
                arena: PageArena::new(),
                live: PageRing::new(LIVE_RING),
                free: PageRing::new(FREE_RING),
                evacuating: PageRing::new(EVACUATING_RING),
                by_base: HashMap::new(),
                used_size: 0,
            }),
            allocator,
            page_table,
            options,
        }
    }

    /// Allocate `size` bytes.
    ///
    /// # Errors
    ///
    /// [`AllocError::BadRequest`] for sizes no page can hold, and
    /// [`AllocError::OutOfMemory`] when the page limit is reached or the OS
    /// refuses a page after every retry.
    pub fn allocate(&self, size: usize) -> AllocationResult<NonNull<u8>> {
        let size = round_allocation(size);
        if size > Page::CAPACITY {
            return Err(AllocError::BadRequest { size, align: 0 });
        }
        let mut inner = self.inner.lock();

        if let Some(id) = inner.live.front(&inner.arena) {
            if let Some(ptr) = inner.allocate_in(id, size) {
                return Ok(ptr);
            }
        }

        let candidates = inner.live.ids(&inner.arena);
        for id in candidates.into_iter().skip(1) {
            let fits = inner
                .arena
                .get(id)
                .is_some_and(|page| page.available() >= size);
            if fits {
                if let Some(ptr) = inner.allocate_in(id, size) {
                    let OldSpaceInner { live, arena, .. } = &mut *inner;
                    live.move_to_front(arena, id);
                    return Ok(ptr);
                }
            }
        }

        let id = self.get_or_new_free_page(&mut inner, size)?;
        inner.allocate_in(id, size).ok_or(AllocError::OutOfMemory {
            space: SpaceKind::Old,
            requested: size,
        })
    }

    /// Make a fresh working page at the front of the live ring.
    fn get_or_new_free_page(
        &self,
        inner: &mut OldSpaceInner,
        requested: usize,
    ) -> AllocationResult<PageId> {
        let OldSpaceInner {
            arena,
            live,
            free,
            by_base,
            ..
        } = &mut *inner;

        if let Some(id) = free.pop_front(arena) {
            if let Some(page) = arena.get_mut(id) {
                if self.options.protect_free_pages {
                    let _ = self
                        .allocator
                        .set_access(page.memory(), 0, PAGE_SIZE, Protection::ReadWrite);
                }
                page.reset();
            }
            live.push_front(arena, id);
            return Ok(id);
        }

        let oom = AllocError::OutOfMemory {
            space: SpaceKind::Old,
            requested,
        };
        if arena.len() >= self.options.max_pages {
            return Err(oom);
        }
        let mut attempt = 0;
        let memory = loop {
            match self.allocator.allocate(PAGE_SIZE, PAGE_SIZE) {
                Ok(memory) => break memory,
                Err(_) if attempt + 1 < self.options.allocate_retries.max(1) => attempt += 1,
                Err(_) => return Err(oom),
            }
        };

        let id = arena.next_id();
        let page = Page::new(memory, id);
        let base = page.base();
        let inserted = arena.insert(page);
        debug_assert_eq!(inserted, id);
        by_base.insert(base, id);
        self.page_table.insert(base, SpaceKind::Old);
        live.push_front(arena, id);
        Ok(id)
    }

    /// Free the allocation at `addr`, coalescing with the following free
    /// chunk when `merge` is set. Returns the freed size.
    ///
    /// Must only run while no allocator can observe the page, i.e. during a
    /// collection.
    pub fn free(&self, addr: usize, merge: bool) -> usize {
        let mut inner = self.inner.lock();
        let Some(&id) = inner.by_base.get(&(addr & !PAGE_MASK)) else {
            panic!("freeing {addr:#x} outside old space");
        };
        let Some(page) = inner.arena.get_mut(id) else {
            panic!("stale page for {addr:#x}");
        };
        let size = page.free(addr, merge);
        inner.used_size -= size;
        size
    }

    /// Move every empty live page to the free ring, returning excess pages
    /// to the OS. Returns the number of pages released.
    pub fn purge_if_needed(&self) -> usize {
        let mut inner = self.inner.lock();
        let empty: Vec<_> = inner
            .live
            .ids(&inner.arena)
            .into_iter()
            .filter(|&id| inner.arena.get(id).is_some_and(Page::is_empty))
            .collect();
        let count = empty.len();
        for id in empty {
            let OldSpaceInner { arena, live, .. } = &mut *inner;
            live.unlink(arena, id);
            self.free_page(&mut inner, id);
        }
        count
    }

    /// Park an unlinked page in the free ring, or unmap it when the ring is
    /// full.
    fn free_page(&self, inner: &mut OldSpaceInner, id: PageId) {
        if inner.free.len() < self.options.max_freed_pages {
            if let Some(page) = inner.arena.get_mut(id) {
                page.reset();
                if self.options.protect_free_pages {
                    let gran = sys_alloc::page_size();
                    let _ = self.allocator.set_access(
                        page.memory(),
                        gran,
                        PAGE_SIZE - gran,
                        Protection::NoAccess,
                    );
                }
            }
            let OldSpaceInner { arena, free, .. } = &mut *inner;
            free.push_front(arena, id);
        } else {
            self.release_page(inner, id);
        }
    }

    fn release_page(&self, inner: &mut OldSpaceInner, id: PageId) {
        if let Some(page) = inner.arena.remove(id) {
            let base = page.base();
            inner.by_base.remove(&base);
            self.page_table.remove(base);
            self.allocator.free(page.into_memory());
        }
    }

    /// Return every page of the free ring to the OS.
    pub fn reclaim_free_pages(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut count = 0;
        loop {
            let OldSpaceInner { arena, free, .. } = &mut *inner;
            let Some(id) = free.pop_front(arena) else {
                break;
            };
            self.release_page(&mut inner, id);
            count += 1;
        }
        count
    }

    // ------------------------------------------------------------------
    // Compaction support
    // ------------------------------------------------------------------

    /// Move every live page to the evacuating ring. New allocations then go
    /// to fresh pages only. Returns the number of pages detached.
    pub fn detach_live_pages(&self) -> usize {
        let mut inner = self.inner.lock();
        let OldSpaceInner {
            arena,
            live,
            evacuating,
            ..
        } = &mut *inner;
        let mut count = 0;
        while let Some(id) = live.pop_front(arena) {
            evacuating.push_back(arena, id);
            count += 1;
        }
        count
    }

    /// Move every evacuating page back to the end of the live ring, for a
    /// compaction that gave up. Returns the number of pages moved.
    pub fn reattach_evacuating(&self) -> usize {
        let mut inner = self.inner.lock();
        let OldSpaceInner {
            arena,
            live,
            evacuating,
            ..
        } = &mut *inner;
        let mut count = 0;
        while let Some(id) = evacuating.pop_front(arena) {
            live.push_back(arena, id);
            count += 1;
        }
        count
    }

    /// `(address, size)` of every object on an evacuating page.
    #[must_use]
    pub fn evacuating_objects(&self) -> Vec<(usize, usize)> {
        let inner = self.inner.lock();
        inner
            .evacuating
            .ids(&inner.arena)
            .into_iter()
            .filter_map(|id| inner.arena.get(id))
            .flat_map(Page::objects)
            .collect()
    }

    /// Returns `true` if `addr` is on an evacuating page.
    #[must_use]
    pub fn is_evacuating(&self, addr: usize) -> bool {
        let inner = self.inner.lock();
        inner
            .by_base
            .get(&(addr & !PAGE_MASK))
            .is_some_and(|&id| inner.arena.ring_of(id) == Some(EVACUATING_RING))
    }

    /// Empty every evacuating page into the free ring (or the OS).
    /// Returns the number of pages released.
    pub fn release_evacuated(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut count = 0;
        loop {
            let OldSpaceInner {
                arena, evacuating, ..
            } = &mut *inner;
            let Some(id) = evacuating.pop_front(arena) else {
                break;
            };
            let used = arena.get(id).map_or(0, Page::used);
            inner.used_size -= used;
            self.free_page(&mut inner, id);
            count += 1;
        }
        count
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Returns `true` if an object starts at `addr` in a live or
    /// evacuating page.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let inner = self.inner.lock();
        inner.page_for(addr).is_some_and(|page| page.is_allocated(addr))
    }

    /// Size recorded for the object at `addr`.
    ///
    /// # Panics
    ///
    /// Panics when `addr` is not in old space.
    #[must_use]
    pub fn allocated_size(&self, addr: usize) -> usize {
        let inner = self.inner.lock();
        let Some(page) = inner.page_for(addr) else {
            panic!("{addr:#x} is not in old space");
        };
        page.allocated_size(addr)
    }

    /// `(address, size)` of every object on a live page.
    #[must_use]
    pub fn live_objects(&self) -> Vec<(usize, usize)> {
        let inner = self.inner.lock();
        inner
            .live
            .ids(&inner.arena)
            .into_iter()
            .filter_map(|id| inner.arena.get(id))
            .flat_map(Page::objects)
            .collect()
    }

    /// Call `f` with every object on a live page, in address order per page.
    pub fn for_each_object(&self, mut f: impl FnMut(usize, usize)) {
        for (addr, size) in self.live_objects() {
            f(addr, size);
        }
    }

    /// Bytes allocated.
    #[must_use]
    pub fn used_size(&self) -> usize {
        self.inner.lock().used_size
    }

    /// Pages owned (live, free and evacuating).
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.inner.lock().arena.len()
    }

    /// Pages in the free ring.
    #[must_use]
    pub fn freed_pages(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Pages in the live ring.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Largest number of bytes the space may map.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.options.max_pages * PAGE_SIZE
    }

    /// Check that the byte accounting of every page adds up.
    ///
    /// # Panics
    ///
    /// Panics on the first inconsistency.
    pub fn verify(&self) {
        let inner = self.inner.lock();
        let mut used = 0;
        for ring in [&inner.live, &inner.free, &inner.evacuating] {
            for id in ring.ids(&inner.arena) {
                let Some(page) = inner.arena.get(id) else {
                    panic!("ring holds stale page {id:?}");
                };
                assert_eq!(page.used() + page.free_bytes(), Page::CAPACITY);
                assert_eq!(page.available(), Page::CAPACITY - page.used());
                used += page.used();
            }
        }
        assert_eq!(used, inner.used_size);
        assert_eq!(
            inner.live.len() + inner.free.len() + inner.evacuating.len(),
            inner.arena.len()
        );
    }
}

impl OldSpaceInner {
    fn allocate_in(&mut self, id: PageId, size: usize) -> Option<NonNull<u8>> {
        let page = self.arena.get_mut(id)?;
        let (ptr, allocated) = page.allocate(size)?;
        self.used_size += allocated;
        Some(ptr)
    }

    fn page_for(&self, addr: usize) -> Option<&Page> {
        let id = self.by_base.get(&(addr & !PAGE_MASK))?;
        if self.arena.ring_of(*id) == Some(FREE_RING) {
            return None;
        }
        self.arena.get(*id)
    }
}

impl std::fmt::Debug for OldSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OldSpace")
            .field("used_size", &inner.used_size)
            .field("live_pages", &inner.live.len())
            .field("free_pages", &inner.free.len())
            .finish_non_exhaustive()
    }
}
