//! Address to space lookup for paged memory.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::page::{SpaceKind, PAGE_MASK};

/// Maps the base address of every mapped page to the space owning it.
///
/// Shared by the old, large and metadata spaces; the new generation is a
/// pair of contiguous areas and answers range checks itself.
#[derive(Debug, Default)]
pub struct PageTable {
    pages: RwLock<HashMap<usize, SpaceKind>>,
}

impl PageTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, base: usize, space: SpaceKind) {
        debug_assert_eq!(base & PAGE_MASK, 0);
        let prev = self.pages.write().insert(base, space);
        debug_assert!(prev.is_none(), "page {base:#x} registered twice");
    }

    pub(crate) fn remove(&self, base: usize) {
        self.pages.write().remove(&base);
    }

    /// Space of the page containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<SpaceKind> {
        self.pages.read().get(&(addr & !PAGE_MASK)).copied()
    }

    /// Number of registered pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    /// Returns `true` when no page is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page::PAGE_SIZE;

    #[test]
    fn test_lookup_masks_address() {
        let table = PageTable::new();
        table.insert(4 * PAGE_SIZE, SpaceKind::Old);
        assert_eq!(table.lookup(4 * PAGE_SIZE + 123), Some(SpaceKind::Old));
        assert_eq!(table.lookup(5 * PAGE_SIZE), None);
        table.remove(4 * PAGE_SIZE);
        assert!(table.is_empty());
    }
}
