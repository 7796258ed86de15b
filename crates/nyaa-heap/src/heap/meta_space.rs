//! Permanent metadata space.

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use sys_alloc::PageAllocator;

use super::page::{LinearPage, SpaceKind, PAGE_HEADER_SIZE, PAGE_MASK, PAGE_SIZE};
use super::page_table::PageTable;
use super::ring::PageArena;
use crate::error::{AllocError, AllocationResult};
use crate::object::round_allocation;

/// Bump-only pages for embedder metadata. Never collected, never scanned,
/// unmapped when the heap is dropped.
pub struct MetaSpace {
    pages: Mutex<PageArena<LinearPage>>,
    current: Mutex<Option<super::ring::PageId>>,
    allocator: Arc<dyn PageAllocator>,
    page_table: Arc<PageTable>,
}

impl MetaSpace {
    /// Empty space.
    pub fn new(allocator: Arc<dyn PageAllocator>, page_table: Arc<PageTable>) -> Self {
        Self {
            pages: Mutex::new(PageArena::new()),
            current: Mutex::new(None),
            allocator,
            page_table,
        }
    }

    /// Bump `size` bytes.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when no page can be mapped.
    pub fn allocate(&self, size: usize) -> AllocationResult<NonNull<u8>> {
        let size = round_allocation(size);
        let mut pages = self.pages.lock();
        let mut current = self.current.lock();

        if let Some(ptr) = (*current)
            .and_then(|id| pages.get_mut(id))
            .and_then(|page| page.advance(size))
        {
            return Ok(ptr);
        }

        let mapping = (PAGE_HEADER_SIZE + size + PAGE_MASK) & !PAGE_MASK;
        let memory = self
            .allocator
            .allocate(mapping.max(PAGE_SIZE), PAGE_SIZE)
            .map_err(|_| AllocError::OutOfMemory {
                space: SpaceKind::Metadata,
                requested: size,
            })?;
        let id = pages.next_id();
        let mut page = LinearPage::new(memory, id);
        let ptr = page.advance(size);
        self.page_table.insert(page.base(), SpaceKind::Metadata);
        pages.insert(page);
        *current = Some(id);
        ptr.ok_or(AllocError::OutOfMemory {
            space: SpaceKind::Metadata,
            requested: size,
        })
    }

    /// Number of pages mapped.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl std::fmt::Debug for MetaSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaSpace")
            .field("pages", &self.page_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sys_alloc::OsAllocator;

    #[test]
    fn test_bump_and_grow() {
        let table = Arc::new(PageTable::new());
        let space = MetaSpace::new(Arc::new(OsAllocator), Arc::clone(&table));

        let a = space.allocate(100).expect("alloc").as_ptr() as usize;
        let b = space.allocate(100).expect("alloc").as_ptr() as usize;
        assert_eq!(b - a, round_allocation(100));
        assert_eq!(table.lookup(a), Some(SpaceKind::Metadata));

        let big = space.allocate(PAGE_SIZE).expect("alloc").as_ptr() as usize;
        assert_ne!(big & !PAGE_MASK, a & !PAGE_MASK);
        assert_eq!(space.page_count(), 2);
    }
}
