//! Per-thread storage behind local handles.
//!
//! - `HandleSlot`: one rooted value
//! - `HandleBlock`: 256 slots, boxed so slot addresses never move
//! - `HandleScopeData`: bump cursor of the innermost open scope
//! - `LocalHandles`: the blocks of one thread
//!
//! Blocks are never freed while the thread lives. Closing a scope rewinds the
//! cursor, and the next scope reuses the same slots.

#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]

use crate::object::Value;

pub const HANDLE_BLOCK_SIZE: usize = 256;

#[repr(transparent)]
pub struct HandleSlot {
    value: Value,
}

impl HandleSlot {
    #[inline]
    pub const fn null() -> Self {
        Self { value: Value::NIL }
    }

    #[inline]
    pub const fn get(&self) -> Value {
        self.value
    }

    #[inline]
    pub fn set(&mut self, value: Value) {
        self.value = value;
    }
}

pub struct HandleBlock {
    slots: [HandleSlot; HANDLE_BLOCK_SIZE],
}

impl HandleBlock {
    fn new() -> Box<Self> {
        Box::new(Self {
            slots: std::array::from_fn(|_| HandleSlot::null()),
        })
    }

    #[inline]
    fn start(&mut self) -> *mut HandleSlot {
        self.slots.as_mut_ptr()
    }
}

/// Cursor state saved and restored by every scope.
#[derive(Debug, Clone, Copy)]
pub struct HandleScopeData {
    pub(crate) next: *mut HandleSlot,
    pub(crate) limit: *mut HandleSlot,
    pub(crate) block: usize,
    pub(crate) level: u32,
    #[cfg(debug_assertions)]
    pub(crate) sealed_level: u32,
}

impl HandleScopeData {
    pub const fn new() -> Self {
        Self {
            next: std::ptr::null_mut(),
            limit: std::ptr::null_mut(),
            block: 0,
            level: 0,
            #[cfg(debug_assertions)]
            sealed_level: 0,
        }
    }

    #[inline]
    pub const fn is_active(&self) -> bool {
        self.level > 0
    }

    #[cfg(debug_assertions)]
    #[inline]
    pub const fn is_sealed(&self) -> bool {
        self.sealed_level > 0 && self.level <= self.sealed_level
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    pub const fn is_sealed(&self) -> bool {
        false
    }
}

impl Default for HandleScopeData {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LocalHandles {
    blocks: Vec<Box<HandleBlock>>,
    pub(crate) scope_data: HandleScopeData,
}

impl LocalHandles {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            scope_data: HandleScopeData::new(),
        }
    }

    #[inline]
    pub fn scope_data(&self) -> &HandleScopeData {
        &self.scope_data
    }

    #[inline]
    pub fn scope_data_mut(&mut self) -> &mut HandleScopeData {
        &mut self.scope_data
    }

    /// Number of blocks ever created.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Move the cursor to the start of block `index`, creating it if needed.
    fn enter_block(&mut self, index: usize) {
        if index == self.blocks.len() {
            self.blocks.push(HandleBlock::new());
        }
        let start = self.blocks[index].start();
        self.scope_data.next = start;
        // SAFETY: one past the end of the slot array.
        self.scope_data.limit = unsafe { start.add(HANDLE_BLOCK_SIZE) };
        self.scope_data.block = index;
    }

    /// Hand out a cleared slot in the innermost scope.
    ///
    /// # Panics
    ///
    /// Panics without an open scope, and in debug builds inside a sealed one.
    #[inline]
    pub fn allocate(&mut self) -> *mut HandleSlot {
        assert!(self.scope_data.is_active(), "no open HandleScope");
        #[cfg(debug_assertions)]
        {
            assert!(
                !self.scope_data.is_sealed(),
                "cannot allocate handle in sealed scope"
            );
        }

        if self.scope_data.next.is_null() {
            self.enter_block(0);
        } else if self.scope_data.next >= self.scope_data.limit {
            self.enter_block(self.scope_data.block + 1);
        }

        let slot = self.scope_data.next;
        // SAFETY: next < limit, both inside the current block.
        unsafe {
            (*slot).set(Value::NIL);
            self.scope_data.next = slot.add(1);
        }
        slot
    }

    /// Visit every non-nil slot below the cursor. The visitor may rewrite the
    /// value in place.
    pub fn iterate_mut(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        if self.scope_data.next.is_null() {
            return;
        }
        let current = self.scope_data.block;
        let cursor = self.scope_data.next;
        for (index, block) in self.blocks.iter_mut().enumerate().take(current + 1) {
            let start = block.start();
            let end = if index == current {
                cursor
            } else {
                // SAFETY: one past the end of the slot array.
                unsafe { start.add(HANDLE_BLOCK_SIZE) }
            };
            let mut slot = start;
            while slot < end {
                // SAFETY: slot lies in [start, end) of a live block.
                let value = unsafe { &mut (*slot).value };
                if !value.is_nil() {
                    visitor(value);
                }
                slot = unsafe { slot.add(1) };
            }
        }
    }

    /// Number of slots handed out in open scopes.
    pub fn len(&self) -> usize {
        if self.scope_data.next.is_null() {
            return 0;
        }
        let start = self.blocks[self.scope_data.block]
            .slots
            .as_ptr()
            .cast_mut();
        // SAFETY: both pointers are in the current block.
        let in_block = unsafe { self.scope_data.next.offset_from(start) };
        #[allow(clippy::cast_sign_loss)]
        let in_block = in_block as usize;
        self.scope_data.block * HANDLE_BLOCK_SIZE + in_block
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LocalHandles {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the raw cursors point into blocks owned by this value.
unsafe impl Send for LocalHandles {}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(handles: &mut LocalHandles) -> HandleScopeData {
        let saved = handles.scope_data;
        handles.scope_data.level += 1;
        saved
    }

    #[test]
    fn test_allocate_and_iterate() {
        let mut handles = LocalHandles::new();
        let _saved = open(&mut handles);
        for i in 0..10 {
            let slot = handles.allocate();
            unsafe { (*slot).set(Value::from_int(i)) };
        }
        let mut seen = Vec::new();
        handles.iterate_mut(&mut |v| seen.push(v.as_int().unwrap_or(-1)));
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(handles.len(), 10);
    }

    #[test]
    fn test_blocks_are_reused() {
        let mut handles = LocalHandles::new();
        let saved = open(&mut handles);
        let first: Vec<_> = (0..HANDLE_BLOCK_SIZE + 10)
            .map(|_| handles.allocate())
            .collect();
        assert_eq!(handles.block_count(), 2);
        handles.scope_data = saved;

        let _saved = open(&mut handles);
        let second: Vec<_> = (0..HANDLE_BLOCK_SIZE + 10)
            .map(|_| handles.allocate())
            .collect();
        assert_eq!(handles.block_count(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_iterate_skips_rewound_slots() {
        let mut handles = LocalHandles::new();
        let _outer = open(&mut handles);
        let slot = handles.allocate();
        unsafe { (*slot).set(Value::from_int(1)) };

        let inner = open(&mut handles);
        for _ in 0..300 {
            let slot = handles.allocate();
            unsafe { (*slot).set(Value::from_int(2)) };
        }
        handles.scope_data = inner;

        let mut count = 0;
        handles.iterate_mut(&mut |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    #[should_panic(expected = "no open HandleScope")]
    fn test_allocate_without_scope_panics() {
        let mut handles = LocalHandles::new();
        let _ = handles.allocate();
    }
}
