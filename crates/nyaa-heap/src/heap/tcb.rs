use std::cell::UnsafeCell;
use std::thread::ThreadId;

use crate::handles::LocalHandles;

/// Per-thread state the collector needs to see: the thread's local handles.
///
/// Obtained from [`Heap::attach_thread`](crate::Heap::attach_thread). Only the
/// owning thread opens scopes and creates handles on it; the collector reads
/// and rewrites the slots while every mutator is stopped at a safepoint.
/// Opening a scope from any other thread panics.
pub struct ThreadControlBlock {
    local_handles: UnsafeCell<LocalHandles>,
    thread: ThreadId,
}

impl ThreadControlBlock {
    /// Control block for the calling thread, not attached to any heap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            local_handles: UnsafeCell::new(LocalHandles::new()),
            thread: std::thread::current().id(),
        }
    }

    /// Raw access to the handle storage.
    ///
    /// Dereferencing is sound on the owning thread, or from the collector
    /// while the owner is stopped.
    #[must_use]
    pub fn local_handles_ptr(&self) -> *mut LocalHandles {
        self.local_handles.get()
    }

    /// Thread that created the block.
    #[must_use]
    pub const fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Returns `true` on the thread that created the block.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    /// # Panics
    ///
    /// Panics unless called on the thread that created the block.
    #[track_caller]
    pub fn assert_owner(&self) {
        assert_eq!(
            std::thread::current().id(),
            self.thread,
            "ThreadControlBlock used off its owning thread (owner={:?}, current={:?})",
            self.thread,
            std::thread::current().id(),
        );
    }

    /// Number of handle slots held by open scopes.
    ///
    /// # Panics
    ///
    /// Panics off the owning thread.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.assert_owner();
        // SAFETY: owning thread.
        unsafe { (*self.local_handles.get()).len() }
    }
}

impl Default for ThreadControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ThreadControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("ThreadControlBlock");
        debug.field("thread", &self.thread);
        if self.is_owner() {
            debug.field("handles", &self.handle_count());
        }
        debug.finish()
    }
}

// SAFETY: every scope and handle operation asserts the owning thread, and
// the collector only touches the handles while that thread is parked at a
// safepoint.
unsafe impl Sync for ThreadControlBlock {}
