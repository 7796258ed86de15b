//! Heap pages.
//!
//! Old, large and metadata memory is carved out of 1 MiB aligned pages. Every
//! page starts with a [`PageHeader`], so the header of any object is one mask
//! away from the object's address.
//!
//! Old-space pages manage their free memory with five size-class free lists
//! ("regions") of chunks. A free chunk stores its successor and its size in
//! its first two words; allocated memory is described by the page's
//! [`AllocationBitmap`]. The chunk area is always fully partitioned into
//! allocations and free chunks.

use std::fmt;
use std::ptr::NonNull;

use sys_alloc::Mmap;

use super::bitmap::AllocationBitmap;
use super::ring::PageId;
use crate::object::{MIN_ALLOCATION, WORD};

/// Size and alignment of a heap page.
pub const PAGE_SIZE: usize = 1 << 20;
/// Mask selecting the offset inside a page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bytes reserved at the start of every page for its header.
pub const PAGE_HEADER_SIZE: usize = 64;
/// Magic number identifying a heap page ("NYPG").
pub const PAGE_MAGIC: u32 = 0x4E59_5047;

const _: () = assert!(std::mem::size_of::<PageHeader>() <= PAGE_HEADER_SIZE);

/// Which space a page or address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpaceKind {
    /// The young generation.
    New = 1,
    /// The old generation.
    Old = 2,
    /// The large-object space.
    Large = 3,
    /// Permanent metadata.
    Metadata = 4,
}

impl fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Old => "old",
            Self::Large => "large",
            Self::Metadata => "metadata",
        })
    }
}

/// In-memory prefix of every page.
#[repr(C)]
#[derive(Debug)]
pub struct PageHeader {
    magic: u32,
    space: SpaceKind,
    _reserved: [u8; 3],
    id_index: u32,
    id_generation: u32,
    available: usize,
}

impl PageHeader {
    /// Write a fresh header at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the start of a writable page owned by the caller.
    unsafe fn init(base: usize, space: SpaceKind, id: PageId, available: usize) {
        let header = Self {
            magic: PAGE_MAGIC,
            space,
            _reserved: [0; 3],
            id_index: id.index(),
            id_generation: id.generation(),
            available,
        };
        unsafe { (base as *mut Self).write(header) };
    }

    /// Header of the page containing `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must lie in the first megabyte of a mapped heap page.
    ///
    /// # Panics
    ///
    /// Panics when the magic number does not match: the address is not in a
    /// heap page, or the page header was overwritten.
    #[must_use]
    pub unsafe fn from_address<'a>(addr: usize) -> &'a Self {
        let header = unsafe { &*((addr & !PAGE_MASK) as *const Self) };
        assert!(
            header.magic == PAGE_MAGIC,
            "bad page magic at {:#x}",
            addr & !PAGE_MASK
        );
        header
    }

    /// Space the page belongs to.
    #[must_use]
    pub const fn space(&self) -> SpaceKind {
        self.space
    }

    /// Bytes not currently allocated.
    #[must_use]
    pub const fn available(&self) -> usize {
        self.available
    }

    /// Arena id of the page.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.id_index
    }
}

fn header_mut(base: usize) -> *mut PageHeader {
    base as *mut PageHeader
}

// ============================================================================
// Regions
// ============================================================================

/// Size class of a free chunk or a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegionClass {
    /// Up to 64 bytes.
    Tiny = 0,
    /// Up to 512 bytes.
    Small = 1,
    /// Up to 4 KiB.
    Medium = 2,
    /// Up to 32 KiB.
    Normal = 3,
    /// Everything larger.
    Big = 4,
}

/// Number of region classes.
pub const REGION_CLASSES: usize = 5;

impl RegionClass {
    /// Class of a chunk or request of `size` bytes.
    #[must_use]
    pub const fn of(size: usize) -> Self {
        if size <= 64 {
            Self::Tiny
        } else if size <= 512 {
            Self::Small
        } else if size <= 4096 {
            Self::Medium
        } else if size <= 32 * 1024 {
            Self::Normal
        } else {
            Self::Big
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Region {
    /// Address of the first free chunk, 0 when empty.
    head: usize,
    chunks: usize,
}

// Free chunk layout: word 0 = next chunk (0 = none), word 1 = chunk size.

unsafe fn chunk_next(chunk: usize) -> usize {
    unsafe { (chunk as *const usize).read() }
}

unsafe fn chunk_size(chunk: usize) -> usize {
    unsafe { (chunk as *const usize).add(1).read() }
}

unsafe fn write_chunk(chunk: usize, next: usize, size: usize) {
    unsafe {
        (chunk as *mut usize).write(next);
        (chunk as *mut usize).add(1).write(size);
    }
}

unsafe fn set_chunk_next(chunk: usize, next: usize) {
    unsafe { (chunk as *mut usize).write(next) };
}

// ============================================================================
// Old-space page
// ============================================================================

/// A 1 MiB old-space page with segregated free lists.
pub struct Page {
    memory: Mmap,
    bitmap: AllocationBitmap,
    regions: [Region; REGION_CLASSES],
    used: usize,
}

impl Page {
    /// Usable bytes of a page.
    pub const CAPACITY: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

    /// Take ownership of a freshly mapped page and format it.
    pub(crate) fn new(memory: Mmap, id: PageId) -> Self {
        debug_assert!(memory.len() >= PAGE_SIZE);
        debug_assert_eq!(memory.ptr() as usize & PAGE_MASK, 0);
        // SAFETY: the mapping is ours and at least one page long.
        unsafe { PageHeader::init(memory.ptr() as usize, SpaceKind::Old, id, 0) };
        let mut page = Self {
            memory,
            bitmap: AllocationBitmap::new(PAGE_SIZE),
            regions: [Region::default(); REGION_CLASSES],
            used: 0,
        };
        page.reset();
        page
    }

    /// Base address.
    #[must_use]
    pub fn base(&self) -> usize {
        self.memory.ptr() as usize
    }

    fn chunk_start(&self) -> usize {
        self.base() + PAGE_HEADER_SIZE
    }

    fn end(&self) -> usize {
        self.base() + PAGE_SIZE
    }

    pub(crate) const fn memory(&self) -> &Mmap {
        &self.memory
    }

    pub(crate) fn into_memory(self) -> Mmap {
        self.memory
    }

    /// Bytes currently allocated.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Bytes not allocated, as recorded in the page header.
    #[must_use]
    pub fn available(&self) -> usize {
        // SAFETY: the header was written at construction.
        unsafe { (*header_mut(self.base())).available }
    }

    fn set_available(&mut self, available: usize) {
        // SAFETY: we own the page.
        unsafe { (*header_mut(self.base())).available = available };
    }

    /// Returns `true` when nothing is allocated.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Returns `true` if `addr` falls inside the chunk area.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.chunk_start() && addr < self.end()
    }

    /// Forget every allocation and turn the chunk area into one free chunk.
    pub fn reset(&mut self) {
        self.bitmap.clear_all();
        self.regions = [Region::default(); REGION_CLASSES];
        self.used = 0;
        let start = self.chunk_start();
        self.insert_chunk(start, Self::CAPACITY);
        self.set_available(Self::CAPACITY);
    }

    fn insert_chunk(&mut self, chunk: usize, size: usize) {
        debug_assert!(size >= MIN_ALLOCATION);
        let region = &mut self.regions[RegionClass::of(size) as usize];
        // SAFETY: chunk lies in our chunk area and is not allocated.
        unsafe { write_chunk(chunk, region.head, size) };
        region.head = chunk;
        region.chunks += 1;
    }

    fn unlink_chunk(&mut self, class: usize, prev: usize, chunk: usize) {
        // SAFETY: `chunk` (and `prev` when non-zero) are members of the list.
        unsafe {
            let next = chunk_next(chunk);
            if prev == 0 {
                self.regions[class].head = next;
            } else {
                set_chunk_next(prev, next);
            }
        }
        self.regions[class].chunks -= 1;
    }

    /// Remove the free chunk starting at `chunk` from its list.
    fn take_chunk(&mut self, chunk: usize) -> Option<usize> {
        // SAFETY: the caller established that `chunk` is a free chunk start.
        let size = unsafe { chunk_size(chunk) };
        let class = RegionClass::of(size) as usize;
        let mut prev = 0;
        let mut cur = self.regions[class].head;
        while cur != 0 {
            if cur == chunk {
                self.unlink_chunk(class, prev, cur);
                return Some(size);
            }
            prev = cur;
            // SAFETY: list members are free chunks.
            cur = unsafe { chunk_next(cur) };
        }
        debug_assert!(false, "free chunk {chunk:#x} missing from its region");
        None
    }

    /// Best fit in the request's own class, else the first chunk of the
    /// next larger non-empty class. Returns the unlinked chunk and its size.
    fn find_fit_region(&mut self, size: usize) -> Option<(usize, usize)> {
        let class = RegionClass::of(size) as usize;

        let mut best: Option<(usize, usize, usize)> = None;
        let mut prev = 0;
        let mut cur = self.regions[class].head;
        while cur != 0 {
            // SAFETY: list members are free chunks.
            let (next, csize) = unsafe { (chunk_next(cur), chunk_size(cur)) };
            if csize >= size && best.is_none_or(|(_, _, b)| csize < b) {
                best = Some((prev, cur, csize));
                if csize == size {
                    break;
                }
            }
            prev = cur;
            cur = next;
        }
        if let Some((prev, chunk, csize)) = best {
            self.unlink_chunk(class, prev, chunk);
            return Some((chunk, csize));
        }

        for larger in class + 1..REGION_CLASSES {
            let chunk = self.regions[larger].head;
            if chunk != 0 {
                self.unlink_chunk(larger, 0, chunk);
                // SAFETY: list member.
                return Some((chunk, unsafe { chunk_size(chunk) }));
            }
        }
        None
    }

    /// Allocate `size` bytes (already rounded). Returns the address and the
    /// size recorded in the bitmap, which may include an absorbed surplus.
    pub fn allocate(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
        debug_assert!(size >= MIN_ALLOCATION && size % WORD == 0);
        if size > self.available() {
            return None;
        }
        let (chunk, csize) = self.find_fit_region(size)?;
        let surplus = csize - size;
        let allocated = if surplus >= MIN_ALLOCATION {
            self.insert_chunk(chunk + size, surplus);
            size
        } else {
            csize
        };
        self.bitmap.mark_allocated(chunk - self.base(), allocated);
        self.used += allocated;
        let available = self.available() - allocated;
        self.set_available(available);
        // SAFETY: chunk is inside our mapping, so non-null.
        Some((unsafe { NonNull::new_unchecked(chunk as *mut u8) }, allocated))
    }

    /// Free the allocation at `addr`, optionally coalescing with the chunk
    /// that follows it. Returns the size that was allocated.
    pub fn free(&mut self, addr: usize, merge: bool) -> usize {
        debug_assert!(self.contains(addr));
        let base = self.base();
        assert!(
            self.bitmap.has_allocated(addr - base),
            "double free of {addr:#x}"
        );
        let size = self.bitmap.clear_allocated(addr - base);
        self.used -= size;
        let available = self.available() + size;
        self.set_available(available);

        let mut chunk = size;
        let next = addr + size;
        if merge && next < self.end() && !self.bitmap.has_allocated(next - base) {
            if let Some(next_size) = self.take_chunk(next) {
                chunk += next_size;
            }
        }
        self.insert_chunk(addr, chunk);
        size
    }

    /// Size recorded for the allocation at `addr`.
    #[must_use]
    pub fn allocated_size(&self, addr: usize) -> usize {
        self.bitmap.allocated_size(addr - self.base())
    }

    /// Returns `true` if an allocation starts at `addr`.
    #[must_use]
    pub fn is_allocated(&self, addr: usize) -> bool {
        self.contains(addr) && self.bitmap.has_allocated(addr - self.base())
    }

    /// `(address, size)` of every allocation in address order.
    pub fn objects(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let base = self.base();
        self.bitmap.iter().map(move |(offset, size)| (base + offset, size))
    }

    /// Total bytes held in free chunks.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        for region in &self.regions {
            let mut cur = region.head;
            while cur != 0 {
                // SAFETY: list members are free chunks.
                unsafe {
                    total += chunk_size(cur);
                    cur = chunk_next(cur);
                }
            }
        }
        total
    }

    /// Number of free chunks per region class.
    #[must_use]
    pub fn region_counts(&self) -> [usize; REGION_CLASSES] {
        self.regions.map(|r| r.chunks)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("used", &self.used)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Large and linear pages
// ============================================================================

/// A page run holding exactly one large object.
pub struct LargePage {
    memory: Mmap,
    object_size: usize,
}

impl LargePage {
    /// Bytes to map for an object of `size` bytes.
    #[must_use]
    pub const fn mapping_size(size: usize) -> usize {
        (PAGE_HEADER_SIZE + size + PAGE_MASK) & !PAGE_MASK
    }

    pub(crate) fn new(memory: Mmap, id: PageId, object_size: usize) -> Self {
        debug_assert!(memory.len() >= PAGE_HEADER_SIZE + object_size);
        // SAFETY: fresh mapping owned by us.
        unsafe { PageHeader::init(memory.ptr() as usize, SpaceKind::Large, id, 0) };
        Self {
            memory,
            object_size,
        }
    }

    /// Base address.
    #[must_use]
    pub fn base(&self) -> usize {
        self.memory.ptr() as usize
    }

    /// Address of the object.
    #[must_use]
    pub fn object(&self) -> usize {
        self.base() + PAGE_HEADER_SIZE
    }

    /// Size of the object.
    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    /// Bytes reserved from the OS.
    #[must_use]
    pub const fn mapped_size(&self) -> usize {
        self.memory.len()
    }

    pub(crate) fn into_memory(self) -> Mmap {
        self.memory
    }
}

/// A bump-only page for permanent metadata.
pub struct LinearPage {
    memory: Mmap,
    top: usize,
}

impl LinearPage {
    pub(crate) fn new(memory: Mmap, id: PageId) -> Self {
        let base = memory.ptr() as usize;
        let available = memory.len() - PAGE_HEADER_SIZE;
        // SAFETY: fresh mapping owned by us.
        unsafe { PageHeader::init(base, SpaceKind::Metadata, id, available) };
        Self {
            memory,
            top: base + PAGE_HEADER_SIZE,
        }
    }

    /// Base address.
    #[must_use]
    pub fn base(&self) -> usize {
        self.memory.ptr() as usize
    }

    /// Bump `size` bytes off the page.
    pub fn advance(&mut self, size: usize) -> Option<NonNull<u8>> {
        let limit = self.base() + self.memory.len();
        if size > limit - self.top {
            return None;
        }
        let addr = self.top;
        self.top += size;
        // SAFETY: we own the page.
        unsafe { (*header_mut(self.base())).available = limit - self.top };
        NonNull::new(addr as *mut u8)
    }

    /// Bytes handed out.
    #[must_use]
    pub fn used(&self) -> usize {
        self.top - self.base() - PAGE_HEADER_SIZE
    }
}
