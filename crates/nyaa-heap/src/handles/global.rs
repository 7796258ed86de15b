//! Heap-wide handle pool behind [`Persistent`].

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{HandleScope, Local};
use crate::heap::Heap;
use crate::kinds::{AnyValue, HeapType};
use crate::object::Value;

pub const GLOBAL_BLOCK_SIZE: usize = 256;

struct GlobalBlock {
    slots: [AtomicUsize; GLOBAL_BLOCK_SIZE],
}

struct GlobalPool {
    blocks: Vec<Box<GlobalBlock>>,
    free: Vec<NonNull<AtomicUsize>>,
    live: usize,
}

// SAFETY: the free list only points into blocks owned by the pool.
unsafe impl Send for GlobalPool {}

/// Pool of stable root slots shared by every thread of a heap.
///
/// Slots are never moved or unmapped while the pool lives; deleted slots go
/// on a free list and are handed out again.
pub struct GlobalHandles {
    pool: Mutex<GlobalPool>,
}

impl GlobalHandles {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(GlobalPool {
                blocks: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub(crate) fn new_handle(&self, value: Value) -> NonNull<AtomicUsize> {
        let mut pool = self.pool.lock();
        if pool.free.is_empty() {
            let block = Box::new(GlobalBlock {
                slots: std::array::from_fn(|_| AtomicUsize::new(0)),
            });
            // Push in reverse so slots are handed out in address order.
            for slot in block.slots.iter().rev() {
                pool.free.push(NonNull::from(slot));
            }
            pool.blocks.push(block);
        }
        let Some(slot) = pool.free.pop() else {
            unreachable!("free list refilled above");
        };
        pool.live += 1;
        // SAFETY: slots live as long as the pool.
        unsafe { slot.as_ref() }.store(value.raw(), Ordering::Release);
        slot
    }

    pub(crate) fn delete_handle(&self, slot: NonNull<AtomicUsize>) {
        // SAFETY: slots live as long as the pool.
        unsafe { slot.as_ref() }.store(0, Ordering::Release);
        let mut pool = self.pool.lock();
        pool.live -= 1;
        pool.free.push(slot);
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.pool.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots ever created.
    pub fn capacity(&self) -> usize {
        self.pool.lock().blocks.len() * GLOBAL_BLOCK_SIZE
    }

    /// Visit every live handle. The visitor may rewrite the value.
    pub(crate) fn iterate(&self, visitor: &mut dyn FnMut(&mut Value)) {
        let pool = self.pool.lock();
        for block in &pool.blocks {
            for slot in &block.slots {
                let raw = slot.load(Ordering::Acquire);
                if raw == 0 {
                    continue;
                }
                // SAFETY: only valid values are stored in live slots.
                let mut value = unsafe { Value::from_raw(raw) };
                visitor(&mut value);
                if value.raw() != raw {
                    slot.store(value.raw(), Ordering::Release);
                }
            }
        }
    }
}

impl Default for GlobalHandles {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GlobalHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalHandles")
            .field("live", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A root that outlives every scope.
///
/// Dropping the handle deletes its slot; [`Persistent::dispose`] does the
/// same explicitly.
pub struct Persistent<T: HeapType = AnyValue> {
    pool: Arc<GlobalHandles>,
    slot: NonNull<AtomicUsize>,
    _marker: PhantomData<fn() -> T>,
}

// SAFETY: the slot is atomic and owned by the pool behind the Arc.
unsafe impl<T: HeapType> Send for Persistent<T> {}
// SAFETY: see above.
unsafe impl<T: HeapType> Sync for Persistent<T> {}

impl<T: HeapType> Persistent<T> {
    pub fn new(heap: &Heap, local: &Local<'_, T>) -> Self {
        let pool = Arc::clone(heap.global_handles());
        let slot = pool.new_handle(local.value());
        Self {
            pool,
            slot,
            _marker: PhantomData,
        }
    }

    /// Current value. Reread after every collection.
    pub fn value(&self) -> Value {
        // SAFETY: the slot lives as long as the pool we hold.
        let raw = unsafe { self.slot.as_ref() }.load(Ordering::Acquire);
        // SAFETY: the collector keeps the slot pointing at a live object.
        unsafe { Value::from_raw(raw) }
    }

    /// Root the value in `scope` as well.
    pub fn to_local<'scope>(&self, scope: &'scope HandleScope<'_>) -> Local<'scope, T> {
        // SAFETY: the slot only ever holds values matching T.
        unsafe { scope.local_unchecked(self.value()) }
    }

    /// Point the handle at another value.
    pub fn set(&self, local: &Local<'_, T>) {
        // SAFETY: the slot lives as long as the pool we hold.
        unsafe { self.slot.as_ref() }.store(local.value().raw(), Ordering::Release);
    }

    /// Release the slot now.
    pub fn dispose(self) {}
}

impl<T: HeapType> Drop for Persistent<T> {
    fn drop(&mut self) {
        self.pool.delete_handle(self.slot);
    }
}

impl<T: HeapType> fmt::Debug for Persistent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Persistent").field(&self.value()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_reused() {
        let pool = GlobalHandles::new();
        let a = pool.new_handle(Value::from_int(1));
        let b = pool.new_handle(Value::from_int(2));
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);

        pool.delete_handle(a);
        assert_eq!(pool.len(), 1);
        let c = pool.new_handle(Value::from_int(3));
        assert_eq!(a, c);
        assert_eq!(pool.capacity(), GLOBAL_BLOCK_SIZE);
    }

    #[test]
    fn test_iterate_skips_deleted() {
        let pool = GlobalHandles::new();
        let a = pool.new_handle(Value::from_int(1));
        let _b = pool.new_handle(Value::from_int(2));
        pool.delete_handle(a);

        let mut seen = Vec::new();
        pool.iterate(&mut |v| seen.push(*v));
        assert_eq!(seen, vec![Value::from_int(2)]);
    }

    #[test]
    fn test_iterate_rewrites() {
        let pool = GlobalHandles::new();
        let a = pool.new_handle(Value::from_int(1));
        pool.iterate(&mut |v| *v = Value::from_int(9));
        let raw = unsafe { a.as_ref() }.load(Ordering::Acquire);
        assert_eq!(raw, Value::from_int(9).raw());
    }

    #[test]
    fn test_grows_past_one_block() {
        let pool = GlobalHandles::new();
        let slots: Vec<_> = (0..GLOBAL_BLOCK_SIZE + 1)
            .map(|i| pool.new_handle(Value::from_int(i as isize)))
            .collect();
        assert_eq!(pool.len(), GLOBAL_BLOCK_SIZE + 1);
        assert_eq!(pool.capacity(), 2 * GLOBAL_BLOCK_SIZE);
        for slot in slots {
            pool.delete_handle(slot);
        }
        assert!(pool.is_empty());
    }
}
