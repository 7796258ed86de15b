//! Allocation bitmap: object extents without a size field.
//!
//! Every allocation sets exactly two bits, one for its first word and one for
//! its last word. The size of an allocation is recovered from its start offset
//! by scanning for the next set bit. Allocations are at least two words, so
//! the start and end bits of one allocation are always distinct and bits come
//! in matched pairs.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::object::{MIN_ALLOCATION, WORD};

/// A bitmap covering a contiguous range of word-aligned byte offsets.
///
/// Bits are atomic so the semi-space can record concurrent bump allocations;
/// old-space pages only touch theirs under the space mutex.
///
/// # Example
///
/// ```
/// use nyaa_heap::heap::AllocationBitmap;
///
/// let bitmap = AllocationBitmap::new(4096);
/// bitmap.mark_allocated(64, 48);
/// assert_eq!(bitmap.allocated_size(64), 48);
/// assert!(bitmap.has_allocated(64));
///
/// assert_eq!(bitmap.clear_allocated(64), 48);
/// assert!(!bitmap.has_allocated(64));
/// ```
#[derive(Debug)]
pub struct AllocationBitmap {
    bits: Vec<AtomicU64>,
    /// Number of words covered.
    capacity: usize,
}

impl AllocationBitmap {
    /// Create a bitmap covering `covered_bytes` bytes.
    #[must_use]
    pub fn new(covered_bytes: usize) -> Self {
        let capacity = covered_bytes / WORD;
        let mut bits = Vec::with_capacity(capacity.div_ceil(64));
        for _ in 0..capacity.div_ceil(64) {
            bits.push(AtomicU64::new(0));
        }
        Self { bits, capacity }
    }

    /// Number of bytes covered.
    #[must_use]
    pub const fn covered_bytes(&self) -> usize {
        self.capacity * WORD
    }

    #[inline]
    fn bit_of(&self, offset: usize) -> usize {
        debug_assert!(offset % WORD == 0, "unaligned bitmap offset {offset:#x}");
        let bit = offset / WORD;
        assert!(bit < self.capacity, "bitmap offset {offset:#x} out of range");
        bit
    }

    #[inline]
    fn set(&self, bit: usize) {
        let prev = self.bits[bit / 64].fetch_or(1 << (bit % 64), Ordering::Release);
        debug_assert!(prev & (1 << (bit % 64)) == 0, "bitmap bit {bit} set twice");
    }

    #[inline]
    fn clear(&self, bit: usize) {
        self.bits[bit / 64].fetch_and(!(1 << (bit % 64)), Ordering::Release);
    }

    #[inline]
    fn test(&self, bit: usize) -> bool {
        (self.bits[bit / 64].load(Ordering::Acquire) >> (bit % 64)) & 1 != 0
    }

    /// Index of the first set bit at or after `from`.
    fn find_next_one(&self, from: usize) -> Option<usize> {
        if from >= self.capacity {
            return None;
        }
        let mut word = from / 64;
        let mut bits = self.bits[word].load(Ordering::Acquire) & (u64::MAX << (from % 64));
        loop {
            if bits != 0 {
                let bit = word * 64 + bits.trailing_zeros() as usize;
                return (bit < self.capacity).then_some(bit);
            }
            word += 1;
            if word >= self.bits.len() {
                return None;
            }
            bits = self.bits[word].load(Ordering::Acquire);
        }
    }

    /// Record an allocation of `size` bytes starting at `offset`.
    pub fn mark_allocated(&self, offset: usize, size: usize) {
        debug_assert!(size >= MIN_ALLOCATION && size % WORD == 0, "bad size {size}");
        let start = self.bit_of(offset);
        let end = self.bit_of(offset + size - WORD);
        self.set(start);
        self.set(end);
    }

    /// Returns `true` if an allocation starts at `offset`.
    #[must_use]
    pub fn has_allocated(&self, offset: usize) -> bool {
        self.test(self.bit_of(offset))
    }

    /// Size of the allocation starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics when no matching end bit exists; that means the bitmap is
    /// corrupt.
    #[must_use]
    pub fn allocated_size(&self, offset: usize) -> usize {
        let start = self.bit_of(offset);
        debug_assert!(self.test(start), "no allocation at offset {offset:#x}");
        let Some(end) = self.find_next_one(start + 1) else {
            panic!("unpaired allocation bit at offset {offset:#x}");
        };
        (end - start + 1) * WORD
    }

    /// Forget the allocation starting at `offset` and return its size.
    pub fn clear_allocated(&self, offset: usize) -> usize {
        let size = self.allocated_size(offset);
        let start = offset / WORD;
        self.clear(start);
        self.clear(start + size / WORD - 1);
        size
    }

    /// Forget every allocation.
    pub fn clear_all(&self) {
        for word in &self.bits {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Iterate `(offset, size)` of every allocation in address order.
    #[must_use]
    pub const fn iter(&self) -> BitmapIter<'_> {
        self.iter_until(usize::MAX)
    }

    /// Iterate allocations that start below `limit`.
    #[must_use]
    pub const fn iter_until(&self, limit: usize) -> BitmapIter<'_> {
        BitmapIter {
            bitmap: self,
            next_bit: 0,
            limit,
        }
    }
}

/// Iterator over the allocations recorded in an [`AllocationBitmap`].
pub struct BitmapIter<'a> {
    bitmap: &'a AllocationBitmap,
    next_bit: usize,
    limit: usize,
}

impl Iterator for BitmapIter<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.bitmap.find_next_one(self.next_bit)?;
        if start * WORD >= self.limit {
            self.next_bit = self.bitmap.capacity;
            return None;
        }
        let Some(end) = self.bitmap.find_next_one(start + 1) else {
            panic!("unpaired allocation bit {start}");
        };
        self.next_bit = end + 1;
        Some((start * WORD, (end - start + 1) * WORD))
    }
}
