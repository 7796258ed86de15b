//! The young generation: two semi-spaces with lock-free bump allocation.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use sys_alloc::{Mmap, PageAllocator};

use super::bitmap::AllocationBitmap;
use super::page::{SpaceKind, PAGE_SIZE};
use crate::error::{AllocError, AllocationResult};
use crate::object::{MIN_ALLOCATION, WORD};

/// One contiguous bump-allocated area.
///
/// Allocation reserves a disjoint byte range with a single `fetch_add` on the
/// cursor, so any number of mutator threads may allocate concurrently.
pub struct SemiSpace {
    memory: Mmap,
    chunk: usize,
    limit: usize,
    free: CachePadded<AtomicUsize>,
    bitmap: AllocationBitmap,
}

impl SemiSpace {
    /// Map an area of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the area cannot be mapped.
    pub fn new(allocator: &dyn PageAllocator, size: usize) -> std::io::Result<Self> {
        let memory = allocator.allocate(size, PAGE_SIZE)?;
        let chunk = memory.ptr() as usize;
        Ok(Self {
            chunk,
            limit: chunk + size,
            free: CachePadded::new(AtomicUsize::new(chunk)),
            bitmap: AllocationBitmap::new(size),
            memory,
        })
    }

    /// Reserve `size` bytes (already rounded). Returns `None` once the area
    /// cannot hold the request.
    pub fn acquire_space(&self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size >= MIN_ALLOCATION && size % WORD == 0);
        let start = self.free.fetch_add(size, Ordering::AcqRel);
        let end = start.checked_add(size)?;
        if end > self.limit {
            // Give the range back when nobody bumped past us meanwhile.
            let _ = self
                .free
                .compare_exchange(end, start, Ordering::AcqRel, Ordering::Relaxed);
            return None;
        }
        self.bitmap.mark_allocated(start - self.chunk, size);
        NonNull::new(start as *mut u8)
    }

    /// [`acquire_space`](Self::acquire_space) reporting failure as an error.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when the area is exhausted.
    pub fn allocate(&self, size: usize) -> AllocationResult<NonNull<u8>> {
        self.acquire_space(size).ok_or(AllocError::OutOfMemory {
            space: SpaceKind::New,
            requested: size,
        })
    }

    /// Start of the area.
    #[must_use]
    pub const fn chunk(&self) -> usize {
        self.chunk
    }

    /// End of the area.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Current bump cursor, never past the limit.
    #[must_use]
    pub fn top(&self) -> usize {
        self.free.load(Ordering::Acquire).min(self.limit)
    }

    /// Capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.limit - self.chunk
    }

    /// Bytes handed out.
    #[must_use]
    pub fn used(&self) -> usize {
        self.top() - self.chunk
    }

    /// Bytes left.
    #[must_use]
    pub fn available(&self) -> usize {
        self.limit - self.top()
    }

    /// Returns `true` if `addr` lies in the allocated part of the area.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.chunk && addr < self.top()
    }

    /// Returns `true` if `addr` lies anywhere in the area.
    #[must_use]
    pub const fn in_range(&self, addr: usize) -> bool {
        addr >= self.chunk && addr < self.limit
    }

    /// Size recorded for the allocation at `addr`.
    #[must_use]
    pub fn allocated_size(&self, addr: usize) -> usize {
        self.bitmap.allocated_size(addr - self.chunk)
    }

    /// Returns `true` if an allocation starts at `addr`.
    #[must_use]
    pub fn is_allocated(&self, addr: usize) -> bool {
        self.contains(addr) && self.bitmap.has_allocated(addr - self.chunk)
    }

    /// Reset the cursor and forget every allocation.
    ///
    /// The memory itself is left as is, so stale headers keep their
    /// forwarding addresses until the area is reused.
    pub fn purge(&self) {
        self.free.store(self.chunk, Ordering::Release);
        self.bitmap.clear_all();
    }

    /// `(address, size)` of every allocation in address order.
    #[must_use]
    pub fn iter(&self) -> SemiSpaceIter<'_> {
        SemiSpaceIter {
            chunk: self.chunk,
            inner: self.bitmap.iter_until(self.top() - self.chunk),
        }
    }

    pub(crate) const fn memory(&self) -> &Mmap {
        &self.memory
    }
}

impl std::fmt::Debug for SemiSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemiSpace")
            .field("chunk", &format_args!("{:#x}", self.chunk))
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Iterator over the allocations of a [`SemiSpace`].
pub struct SemiSpaceIter<'a> {
    chunk: usize,
    inner: super::bitmap::BitmapIter<'a>,
}

impl Iterator for SemiSpaceIter<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(offset, size)| (self.chunk + offset, size))
    }
}

/// The two semi-spaces of the young generation.
///
/// Mutators allocate in the *original* area; a minor collection copies the
/// survivors into the *survive* area and then flips the roles.
pub struct NewSpace {
    areas: [SemiSpace; 2],
    original: AtomicUsize,
}

impl NewSpace {
    /// Map two areas of `semi_space_size` bytes each.
    ///
    /// # Errors
    ///
    /// Returns the OS error when either area cannot be mapped.
    pub fn new(allocator: &dyn PageAllocator, semi_space_size: usize) -> std::io::Result<Self> {
        Ok(Self {
            areas: [
                SemiSpace::new(allocator, semi_space_size)?,
                SemiSpace::new(allocator, semi_space_size)?,
            ],
            original: AtomicUsize::new(0),
        })
    }

    /// The allocation area.
    #[must_use]
    pub fn original(&self) -> &SemiSpace {
        &self.areas[self.original.load(Ordering::Acquire)]
    }

    /// The copy target of the next minor collection.
    #[must_use]
    pub fn survive(&self) -> &SemiSpace {
        &self.areas[self.original.load(Ordering::Acquire) ^ 1]
    }

    /// Bump-allocate in the original area.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when the original area is exhausted.
    pub fn allocate(&self, size: usize) -> AllocationResult<NonNull<u8>> {
        self.original().allocate(size)
    }

    /// Returns `true` if `addr` is an allocated address of the original area.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.original().contains(addr)
    }

    /// Swap the two areas. With `reinit`, the area just vacated (the new
    /// survive area) is purged for the next cycle's copies.
    pub fn flip(&self, reinit: bool) {
        self.original.fetch_xor(1, Ordering::AcqRel);
        if reinit {
            self.survive().purge();
        }
    }

    /// Capacity of one semi-space.
    #[must_use]
    pub fn semi_space_size(&self) -> usize {
        self.areas[0].capacity()
    }
}

impl std::fmt::Debug for NewSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewSpace")
            .field("original", self.original())
            .field("survive", self.survive())
            .finish()
    }
}
