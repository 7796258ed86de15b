//! Lifetime-bound handles for moving heap objects.
//!
//! Native code never holds a raw object address across a call that can
//! collect. It holds a [`Local`] instead: a pointer to a slot the collector
//! knows about and rewrites when the object moves. Slots live in the
//! [`LocalHandles`] of the thread's [`ThreadControlBlock`] and are released
//! wholesale when the [`HandleScope`] that created them is dropped; the
//! borrow checker keeps a `Local` from outliving its scope.
//!
//! [`Persistent`] handles live in the heap-wide [`GlobalHandles`] pool and
//! are released when dropped.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::elidable_lifetime_names)]
#![allow(clippy::missing_safety_doc)]

mod global;
mod local_handles;

pub use global::{GlobalHandles, Persistent, GLOBAL_BLOCK_SIZE};
pub use local_handles::{
    HandleBlock, HandleScopeData, HandleSlot, LocalHandles, HANDLE_BLOCK_SIZE,
};

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

use crate::heap::{Heap, ThreadControlBlock};
use crate::kinds::{AnyValue, HeapType};
use crate::object::{HeapObject, Value};

pub struct HandleScope<'env> {
    tcb: &'env ThreadControlBlock,
    prev: HandleScopeData,
    _marker: PhantomData<*mut ()>,
}

impl<'env> HandleScope<'env> {
    /// Open a scope on `tcb`.
    ///
    /// # Panics
    ///
    /// Panics when called off the thread that owns `tcb`.
    pub fn new(tcb: &'env ThreadControlBlock) -> Self {
        tcb.assert_owner();
        // SAFETY: owning thread, checked above.
        let prev = unsafe {
            let scope_data = (*tcb.local_handles_ptr()).scope_data_mut();
            let prev = *scope_data;
            scope_data.level = prev
                .level
                .checked_add(1)
                .expect("HandleScope level overflow");
            prev
        };

        Self {
            tcb,
            prev,
            _marker: PhantomData,
        }
    }

    fn allocate_slot(&self) -> *mut HandleSlot {
        // SAFETY: scopes are only opened on the owning thread and never leave it.
        unsafe {
            let handles = &mut *self.tcb.local_handles_ptr();
            debug_assert_eq!(
                handles.scope_data().level,
                self.prev.level + 1,
                "handle created in an outer HandleScope"
            );
            handles.allocate()
        }
    }

    /// Root `value` in this scope.
    pub fn local<'scope>(&'scope self, value: Value) -> Local<'scope, AnyValue> {
        // SAFETY: AnyValue accepts every value.
        unsafe { self.local_unchecked(value) }
    }

    /// Root `value` in this scope with a static type.
    ///
    /// # Safety
    ///
    /// `T::matches(value)` must hold.
    pub unsafe fn local_unchecked<'scope, T: HeapType>(&'scope self, value: Value) -> Local<'scope, T> {
        debug_assert!(T::matches(value));
        let slot = self.allocate_slot();
        // SAFETY: fresh slot of this scope.
        unsafe { (*slot).set(value) };
        Local {
            slot,
            _marker: PhantomData,
        }
    }

    pub fn level(&self) -> u32 {
        // SAFETY: scopes are only opened on the owning thread and never leave it.
        unsafe { (*self.tcb.local_handles_ptr()).scope_data().level }
    }

    pub fn thread(&self) -> &'env ThreadControlBlock {
        self.tcb
    }

    /// Close the scope. Same as dropping it.
    pub fn close(self) {}
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        // SAFETY: scopes are only opened on the owning thread and never leave it.
        unsafe {
            let scope_data = (*self.tcb.local_handles_ptr()).scope_data_mut();
            debug_assert_eq!(scope_data.level, self.prev.level + 1, "HandleScopes dropped out of order");
            scope_data.next = self.prev.next;
            scope_data.limit = self.prev.limit;
            scope_data.block = self.prev.block;
            scope_data.level = self.prev.level;
        }
    }
}

// ============================================================================
// Local
// ============================================================================

/// A rooted value, valid until its [`HandleScope`] closes.
pub struct Local<'scope, T: HeapType = AnyValue> {
    slot: *mut HandleSlot,
    _marker: PhantomData<(&'scope (), *const T)>,
}

impl<'scope, T: HeapType> Local<'scope, T> {
    /// Current value of the slot. Reread after every collection.
    #[inline]
    pub fn value(&self) -> Value {
        // SAFETY: the slot outlives 'scope.
        unsafe { (*self.slot).get() }
    }

    /// The referenced object, if the value is one.
    #[inline]
    pub fn object(&self) -> Option<HeapObject> {
        self.value().as_object()
    }

    /// Address of the referenced object, 0 when the value is not an object.
    pub fn address(&self) -> usize {
        self.object().map_or(0, HeapObject::address)
    }

    /// View the handle as `U` if the value matches.
    pub fn cast<U: HeapType>(self) -> Option<Local<'scope, U>> {
        U::matches(self.value()).then_some(Local {
            slot: self.slot,
            _marker: PhantomData,
        })
    }

    /// Forget the static type.
    pub fn as_any(self) -> Local<'scope, AnyValue> {
        Local {
            slot: self.slot,
            _marker: PhantomData,
        }
    }

    /// Root the value in the heap's global pool.
    pub fn to_persistent(&self, heap: &Heap) -> Persistent<T> {
        Persistent::new(heap, self)
    }

    /// Replace the rooted value.
    pub(crate) fn set_value(&self, value: Value) {
        debug_assert!(T::matches(value));
        // SAFETY: the slot outlives 'scope.
        unsafe { (*self.slot).set(value) };
    }

    pub(crate) fn slot_ptr(&self) -> *const HandleSlot {
        self.slot
    }
}

impl<T: HeapType> Clone for Local<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: HeapType> Copy for Local<'_, T> {}

impl<T: HeapType> PartialEq for Local<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.value() == other.value()
    }
}

impl<T: HeapType> fmt::Debug for Local<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Local").field(&self.value()).finish()
    }
}

// ============================================================================
// EscapableHandleScope
// ============================================================================

/// A child scope that can hand one handle back to its parent.
///
/// The parent slot is reserved when the child opens, so escaping never
/// allocates.
pub struct EscapableHandleScope<'parent, 'env> {
    inner: HandleScope<'env>,
    escaped: Cell<bool>,
    escape_slot: *mut HandleSlot,
    _parent: PhantomData<&'parent HandleScope<'env>>,
}

impl<'parent, 'env> EscapableHandleScope<'parent, 'env> {
    pub fn new(parent: &'parent HandleScope<'env>) -> Self {
        let escape_slot = parent.allocate_slot();
        let inner = HandleScope::new(parent.tcb);
        Self {
            inner,
            escaped: Cell::new(false),
            escape_slot,
            _parent: PhantomData,
        }
    }

    /// Copy `handle` into the reserved parent slot.
    ///
    /// # Panics
    ///
    /// Panics when called twice.
    pub fn escape<T: HeapType>(&self, handle: Local<'_, T>) -> Local<'parent, T> {
        assert!(
            !self.escaped.replace(true),
            "EscapableHandleScope::escape() can only be called once"
        );
        // SAFETY: the escape slot belongs to the parent scope.
        unsafe { (*self.escape_slot).set(handle.value()) };
        Local {
            slot: self.escape_slot,
            _marker: PhantomData,
        }
    }

    /// Run `body` in a fresh child of `parent`, escape the handle it returns
    /// and close the child. Every other handle `body` created is released.
    ///
    /// # Errors
    ///
    /// Returns whatever error `body` returns.
    pub fn close_and_escape<T, E, F>(parent: &'parent HandleScope<'env>, body: F) -> Result<Local<'parent, T>, E>
    where
        T: HeapType,
        F: for<'child> FnOnce(&'child HandleScope<'env>) -> Result<Local<'child, T>, E>,
    {
        let scope = Self::new(parent);
        let local = body(&scope.inner)?;
        Ok(scope.escape(local))
    }
}

impl<'env> Deref for EscapableHandleScope<'_, 'env> {
    type Target = HandleScope<'env>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// ============================================================================
// MaybeLocal
// ============================================================================

/// A handle that may be empty, for APIs that can fail without an error.
pub struct MaybeLocal<'scope, T: HeapType = AnyValue> {
    slot: *mut HandleSlot,
    _marker: PhantomData<(&'scope (), *const T)>,
}

impl<'scope, T: HeapType> MaybeLocal<'scope, T> {
    pub const fn empty() -> Self {
        Self {
            slot: std::ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_null()
    }

    pub fn to_local(self) -> Option<Local<'scope, T>> {
        (!self.slot.is_null()).then_some(Local {
            slot: self.slot,
            _marker: PhantomData,
        })
    }
}

impl<'scope, T: HeapType> From<Local<'scope, T>> for MaybeLocal<'scope, T> {
    fn from(local: Local<'scope, T>) -> Self {
        Self {
            slot: local.slot,
            _marker: PhantomData,
        }
    }
}

impl<T: HeapType> Clone for MaybeLocal<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: HeapType> Copy for MaybeLocal<'_, T> {}

impl<T: HeapType> Default for MaybeLocal<'_, T> {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// SealedHandleScope
// ============================================================================

/// Debug guard forbidding handle creation in the current scope.
#[cfg(debug_assertions)]
pub struct SealedHandleScope<'env> {
    tcb: &'env ThreadControlBlock,
    prev_sealed_level: u32,
    _marker: PhantomData<*mut ()>,
}

#[cfg(not(debug_assertions))]
pub struct SealedHandleScope<'env>(PhantomData<&'env ()>);

impl<'env> SealedHandleScope<'env> {
    #[cfg(debug_assertions)]
    pub fn new(tcb: &'env ThreadControlBlock) -> Self {
        tcb.assert_owner();
        // SAFETY: owning thread, checked above.
        let prev_sealed_level = unsafe {
            let scope_data = (*tcb.local_handles_ptr()).scope_data_mut();
            std::mem::replace(&mut scope_data.sealed_level, scope_data.level)
        };
        Self {
            tcb,
            prev_sealed_level,
            _marker: PhantomData,
        }
    }

    #[cfg(not(debug_assertions))]
    pub fn new(tcb: &'env ThreadControlBlock) -> Self {
        tcb.assert_owner();
        Self(PhantomData)
    }
}

#[cfg(debug_assertions)]
impl Drop for SealedHandleScope<'_> {
    fn drop(&mut self) {
        // SAFETY: scopes are only opened on the owning thread and never leave it.
        unsafe {
            (*self.tcb.local_handles_ptr())
                .scope_data_mut()
                .sealed_level = self.prev_sealed_level;
        }
    }
}
