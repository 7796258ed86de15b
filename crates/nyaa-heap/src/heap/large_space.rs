//! Large-object space: one object per page run.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use sys_alloc::PageAllocator;

use super::page::{LargePage, SpaceKind, PAGE_MASK, PAGE_SIZE};
use super::page_table::PageTable;
use super::ring::{PageArena, PageId, PageRing};
use crate::error::{AllocError, AllocationResult};
use crate::object::round_allocation;

struct LargeSpaceInner {
    arena: PageArena<LargePage>,
    ring: PageRing,
    by_base: HashMap<usize, PageId>,
    rss_size: usize,
    used_size: usize,
}

/// Objects above the large-object threshold each get their own mapping.
/// Freeing one returns the whole mapping to the OS.
pub struct LargeSpace {
    inner: Mutex<LargeSpaceInner>,
    allocator: Arc<dyn PageAllocator>,
    page_table: Arc<PageTable>,
}

impl LargeSpace {
    /// Empty space.
    pub fn new(allocator: Arc<dyn PageAllocator>, page_table: Arc<PageTable>) -> Self {
        Self {
            inner: Mutex::new(LargeSpaceInner {
                arena: PageArena::new(),
                ring: PageRing::new(0),
                by_base: HashMap::new(),
                rss_size: 0,
                used_size: 0,
            }),
            allocator,
            page_table,
        }
    }

    /// Map a page run for one object of `size` bytes.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when the OS refuses the mapping.
    pub fn allocate(&self, size: usize) -> AllocationResult<NonNull<u8>> {
        let size = round_allocation(size);
        let mapping = LargePage::mapping_size(size);
        let memory = self
            .allocator
            .allocate(mapping, PAGE_SIZE)
            .map_err(|_| AllocError::OutOfMemory {
                space: SpaceKind::Large,
                requested: size,
            })?;

        let mut inner = self.inner.lock();
        let LargeSpaceInner {
            arena,
            ring,
            by_base,
            rss_size,
            used_size,
        } = &mut *inner;
        let id = arena.next_id();
        let page = LargePage::new(memory, id, size);
        let base = page.base();
        let object = page.object();
        *rss_size += page.mapped_size();
        *used_size += size;
        arena.insert(page);
        ring.push_front(arena, id);
        by_base.insert(base, id);
        self.page_table.insert(base, SpaceKind::Large);
        NonNull::new(object as *mut u8).ok_or(AllocError::OutOfMemory {
            space: SpaceKind::Large,
            requested: size,
        })
    }

    /// Unmap the object at `addr`. Returns its size.
    pub fn free(&self, addr: usize) -> usize {
        let mut inner = self.inner.lock();
        let Some(id) = inner.lookup(addr) else {
            panic!("freeing {addr:#x} outside large space");
        };
        let LargeSpaceInner {
            arena,
            ring,
            by_base,
            rss_size,
            used_size,
        } = &mut *inner;
        ring.unlink(arena, id);
        let Some(page) = arena.remove(id) else {
            return 0;
        };
        let size = page.object_size();
        *rss_size -= page.mapped_size();
        *used_size -= size;
        by_base.remove(&page.base());
        self.page_table.remove(page.base());
        self.allocator.free(page.into_memory());
        size
    }

    /// Returns `true` if a large object starts at `addr`.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.inner.lock().lookup(addr).is_some()
    }

    /// Size of the object at `addr`.
    #[must_use]
    pub fn object_size(&self, addr: usize) -> Option<usize> {
        let inner = self.inner.lock();
        let id = inner.lookup(addr)?;
        inner.arena.get(id).map(LargePage::object_size)
    }

    /// `(address, size)` of every large object.
    #[must_use]
    pub fn objects(&self) -> Vec<(usize, usize)> {
        let inner = self.inner.lock();
        inner
            .ring
            .ids(&inner.arena)
            .into_iter()
            .filter_map(|id| inner.arena.get(id))
            .map(|page| (page.object(), page.object_size()))
            .collect()
    }

    /// Bytes of object payload.
    #[must_use]
    pub fn used_size(&self) -> usize {
        self.inner.lock().used_size
    }

    /// Bytes mapped from the OS.
    #[must_use]
    pub fn rss_size(&self) -> usize {
        self.inner.lock().rss_size
    }

    /// Number of large objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    /// Returns `true` if the space holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LargeSpaceInner {
    fn lookup(&self, addr: usize) -> Option<PageId> {
        let id = *self.by_base.get(&(addr & !PAGE_MASK))?;
        let page = self.arena.get(id)?;
        (page.object() == addr).then_some(id)
    }
}

impl std::fmt::Debug for LargeSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LargeSpace")
            .field("objects", &inner.ring.len())
            .field("used_size", &inner.used_size)
            .field("rss_size", &inner.rss_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sys_alloc::OsAllocator;

    #[test]
    fn test_allocate_and_free() {
        let table = Arc::new(PageTable::new());
        let space = LargeSpace::new(Arc::new(OsAllocator), Arc::clone(&table));

        let size = 3 * PAGE_SIZE / 2;
        let addr = space.allocate(size).expect("alloc").as_ptr() as usize;
        assert!(space.contains(addr));
        assert!(!space.contains(addr + 8));
        assert_eq!(space.object_size(addr), Some(size));
        assert_eq!(table.lookup(addr), Some(SpaceKind::Large));
        assert_eq!(space.rss_size(), 2 * PAGE_SIZE);

        unsafe { std::ptr::write_bytes(addr as *mut u8, 0xab, size) };

        assert_eq!(space.free(addr), size);
        assert!(space.is_empty());
        assert_eq!(space.used_size(), 0);
        assert_eq!(space.rss_size(), 0);
        assert_eq!(table.lookup(addr), None);
    }

    #[test]
    fn test_objects_lists_everything() {
        let space = LargeSpace::new(Arc::new(OsAllocator), Arc::new(PageTable::new()));
        let a = space.allocate(300 * 1024).expect("alloc").as_ptr() as usize;
        let b = space.allocate(500 * 1024).expect("alloc").as_ptr() as usize;
        let mut objects = space.objects();
        objects.sort_unstable();
        let mut expected = vec![(a, 300 * 1024), (b, 500 * 1024)];
        expected.sort_unstable();
        assert_eq!(objects, expected);
    }
}
