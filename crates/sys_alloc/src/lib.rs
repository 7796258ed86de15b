//! OS page provider.
//!
//! Everything the heap needs from the operating system goes through this
//! crate: anonymous mappings (optionally aligned to a power of two larger than
//! the OS granularity), protection changes and the allocation granularity.
//! The [`PageAllocator`] trait is the seam the heap is written against, so an
//! embedder can plug in an instrumented provider.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Every request made through this crate is rounded up to this granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Round `size` up to the allocation granularity.
#[must_use]
pub fn round_to_granularity(size: usize) -> usize {
    let gran = allocation_granularity();
    size.div_ceil(gran) * gran
}

/// Access protection applied to a mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults.
    NoAccess,
    /// Reads are allowed, writes fault.
    ReadOnly,
    /// Normal heap memory.
    ReadWrite,
}

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped. When the
/// mapping was requested with an alignment, `ptr()` is the aligned start and
/// `len()` the usable length; the padding around it stays reserved until drop.
pub struct Mmap {
    inner: os::MmapInner,
    offset: usize,
    len: usize,
}

impl Mmap {
    /// Returns a pointer to the (aligned) start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        // SAFETY: offset + len never exceeds the reserved length.
        unsafe { self.inner.ptr().add(self.offset) }
    }

    /// Returns the usable length of the memory mapping in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapping is empty. Mappings are never empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of bytes actually reserved from the OS.
    pub fn reserved_len(&self) -> usize {
        self.inner.len()
    }

    /// Changes the protection of `[offset, offset + len)` inside the usable range.
    ///
    /// # Errors
    ///
    /// Returns the OS error, or `InvalidInput` when the range is out of bounds
    /// or not aligned to the page size.
    pub fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        let page = page_size();
        if offset % page != 0 || len % page != 0 || offset + len > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "protect range must be page aligned and inside the mapping",
            ));
        }
        // SAFETY: the range was checked to lie inside our own mapping.
        unsafe { os::protect(self.ptr().add(offset), len, protection) }
    }
}

// SAFETY: the mapping is plain memory owned by this handle.
unsafe impl Send for Mmap {}
// SAFETY: see above; synchronising access to the bytes is the caller's job.
unsafe impl Sync for Mmap {}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len)
            .field("reserved", &self.reserved_len())
            .finish()
    }
}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            align: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requests the start of the mapping to be aligned to `align` bytes.
    ///
    /// `align` must be a power of two. Alignments at or below the allocation
    /// granularity are free; larger ones over-reserve by `align` bytes.
    #[must_use]
    pub const fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to reserve swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous memory map.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidInput` for a zero length or a non power of two
    /// alignment, and with the OS error when the mapping cannot be created.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let len = round_to_granularity(self.len);
        let padding = if self.align > allocation_granularity() {
            self.align
        } else {
            0
        };

        // SAFETY: a fresh anonymous mapping does not alias anything.
        let inner = unsafe { os::MmapInner::map_anon(len + padding, self.populate, self.no_reserve)? };

        let offset = if padding == 0 {
            0
        } else {
            let base = inner.ptr() as usize;
            let aligned = (base + self.align - 1) & !(self.align - 1);
            aligned - base
        };

        Ok(Mmap { inner, offset, len })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// The heap's view of the operating system.
///
/// `allocate` hands out an owned block; giving the block back to `free` (or
/// simply dropping it) returns the memory to the OS.
pub trait PageAllocator: Send + Sync {
    /// Reserve and commit `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when no memory could be obtained.
    fn allocate(&self, size: usize, align: usize) -> io::Result<Mmap>;

    /// Return a block to the OS.
    fn free(&self, block: Mmap) {
        drop(block);
    }

    /// Change the protection of a sub-range of `block`.
    ///
    /// # Errors
    ///
    /// Returns the OS error or `InvalidInput` for a bad range.
    fn set_access(
        &self,
        block: &Mmap,
        offset: usize,
        len: usize,
        protection: Protection,
    ) -> io::Result<()> {
        block.protect(offset, len, protection)
    }

    /// The unit every request is rounded to.
    fn granularity(&self) -> usize {
        allocation_granularity()
    }
}

/// [`PageAllocator`] backed directly by `mmap`/`VirtualAlloc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsAllocator;

impl PageAllocator for OsAllocator {
    fn allocate(&self, size: usize, align: usize) -> io::Result<Mmap> {
        MmapOptions::new().len(size).align(align).map_anon()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_round_to_granularity() {
        let ag = allocation_granularity();
        assert_eq!(round_to_granularity(1), ag);
        assert_eq!(round_to_granularity(ag), ag);
        assert_eq!(round_to_granularity(ag + 1), 2 * ag);
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = MmapOptions::new().len(len).map_anon().expect("failed to map");

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_aligned_map() {
        let align = 1 << 20;
        let mmap = MmapOptions::new()
            .len(align)
            .align(align)
            .map_anon()
            .expect("failed to map");

        assert_eq!(mmap.ptr() as usize % align, 0);
        assert_eq!(mmap.len(), align);
        assert!(mmap.reserved_len() >= 2 * align);

        unsafe {
            ptr::write_volatile(mmap.ptr().add(align - 1), 7);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(align - 1)), 7);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = MmapOptions::new().map_anon().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_bad_alignment_rejected() {
        let err = MmapOptions::new().len(4096).align(3000).map_anon().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_protect_round_trip() {
        let len = page_size() * 2;
        let alloc = OsAllocator;
        let block = alloc.allocate(len, 0).expect("failed to map");

        alloc
            .set_access(&block, 0, page_size(), Protection::ReadOnly)
            .expect("protect read-only");
        alloc
            .set_access(&block, 0, page_size(), Protection::ReadWrite)
            .expect("protect read-write");

        unsafe {
            ptr::write_volatile(block.ptr(), 1);
            assert_eq!(ptr::read_volatile(block.ptr()), 1);
        }
        alloc.free(block);
    }

    #[test]
    fn test_protect_rejects_unaligned_range() {
        let block = OsAllocator.allocate(page_size(), 0).expect("failed to map");
        assert!(block.protect(1, page_size(), Protection::NoAccess).is_err());
    }
}
