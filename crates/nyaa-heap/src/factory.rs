//! Built-in object construction and typed handle accessors.
//!
//! Every constructor returns the new object already rooted in the caller's
//! [`HandleScope`]: the handle is created before the allocation lock is
//! released, so a collection can never observe the object unrooted.
//!
//! Young allocations fall back to old space when the original semi-space is
//! full. Callers that would rather collect first should check
//! [`Heap::collection_needed`] before allocating.

use std::any::TypeId;
use std::mem::{align_of, size_of};
use std::ptr;

use crate::error::{AllocError, AllocationResult};
use crate::handles::{HandleScope, Local};
use crate::heap::{AllocFlags, Heap, SpaceKind};
use crate::kinds::{Array, HeapType, Instance, Str, WeakRef};
use crate::object::{
    self, array_size, instance_size, string_size, ClassId, HeapObject, ObjectKind, TypeInfo, Value,
    WEAK_REF_SIZE, WORD,
};

/// Allocates built-in objects and class instances on a [`Heap`].
#[derive(Debug, Clone, Copy)]
pub struct ObjectFactory<'h> {
    heap: &'h Heap,
}

impl<'h> ObjectFactory<'h> {
    /// Factory for `heap`.
    #[must_use]
    pub const fn new(heap: &'h Heap) -> Self {
        Self { heap }
    }

    /// The heap this factory allocates on.
    #[must_use]
    pub const fn heap(&self) -> &'h Heap {
        self.heap
    }

    fn allocate<'s, T: HeapType>(
        &self,
        scope: &'s HandleScope<'_>,
        size: usize,
        flags: AllocFlags,
        info: TypeInfo,
        mut init: impl FnMut(HeapObject),
    ) -> AllocationResult<Local<'s, T>> {
        let heap = self.heap;
        let mut place = |object: HeapObject| {
            init(object);
            if !heap.is_young(object.address()) {
                record_old_slots(heap, object);
            }
            // SAFETY: the header was written with T's kind.
            unsafe { scope.local_unchecked::<T>(Value::from_object(object)) }
        };
        let young = !flags.intersects(AllocFlags::OLD | AllocFlags::LARGE);
        let result = match heap.allocate_object(size, flags, info, &mut place) {
            Err(AllocError::OutOfMemory {
                space: SpaceKind::New,
                ..
            }) if young => {
                #[cfg(feature = "tracing")]
                tracing::debug!(size, "young generation full, allocating in old space");
                heap.allocate_object(size, flags | AllocFlags::OLD, info, &mut place)
            }
            other => other,
        };
        result.map(|(_, local)| local)
    }

    /// Allocate a string holding `bytes`.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when no space can hold it.
    pub fn new_string<'s>(
        &self,
        scope: &'s HandleScope<'_>,
        bytes: impl AsRef<[u8]>,
        flags: AllocFlags,
    ) -> AllocationResult<Local<'s, Str>> {
        let bytes = bytes.as_ref();
        self.allocate(
            scope,
            string_size(bytes.len()),
            flags,
            TypeInfo::new(ObjectKind::Str),
            |object| {
                // SAFETY: the allocation holds the length word and the bytes.
                unsafe {
                    object.write_word(0, bytes.len());
                    ptr::copy_nonoverlapping(bytes.as_ptr(), object.payload().add(WORD), bytes.len());
                }
            },
        )
    }

    /// Allocate an array of `len` nil slots.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when no space can hold it.
    pub fn new_array<'s>(
        &self,
        scope: &'s HandleScope<'_>,
        len: usize,
        flags: AllocFlags,
    ) -> AllocationResult<Local<'s, Array>> {
        self.new_array_from(scope, &vec![Value::NIL; len], flags)
    }

    /// Allocate an array holding a copy of `values`.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when no space can hold it.
    pub fn new_array_from<'s>(
        &self,
        scope: &'s HandleScope<'_>,
        values: &[Value],
        flags: AllocFlags,
    ) -> AllocationResult<Local<'s, Array>> {
        self.allocate(
            scope,
            array_size(values.len()),
            flags,
            TypeInfo::new(ObjectKind::Array),
            |object| {
                // SAFETY: the allocation holds the length word and the slots.
                unsafe {
                    object.write_word(0, values.len());
                    for (i, value) in values.iter().enumerate() {
                        object::array_slot(object, i).write(*value);
                    }
                }
            },
        )
    }

    /// Allocate a weak reference to `target`. The reference does not keep
    /// `target` alive and reads as nil once it is collected.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when no space can hold it.
    pub fn new_weak<'s>(
        &self,
        scope: &'s HandleScope<'_>,
        target: Value,
        flags: AllocFlags,
    ) -> AllocationResult<Local<'s, WeakRef>> {
        self.allocate(
            scope,
            WEAK_REF_SIZE,
            flags,
            TypeInfo::new(ObjectKind::WeakRef),
            |object| {
                // SAFETY: the slot lies inside the allocation.
                unsafe { object::weak_slot(object).write(target) };
            },
        )
    }

    /// Allocate an instance of `class` holding `payload`.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when no space can hold it.
    ///
    /// # Panics
    ///
    /// Panics when `class` is not registered or its payload type is not `P`.
    pub fn new_instance<'s, P: Copy + 'static>(
        &self,
        scope: &'s HandleScope<'_>,
        class: ClassId,
        payload: P,
        flags: AllocFlags,
    ) -> AllocationResult<Local<'s, Instance>> {
        assert!(
            class_holds::<P>(self.heap, class),
            "class {class:?} does not hold a {}",
            std::any::type_name::<P>()
        );
        debug_assert!(align_of::<P>() <= WORD);
        self.allocate(
            scope,
            instance_size(size_of::<P>()),
            flags,
            TypeInfo::custom(class),
            |object| {
                // SAFETY: the payload is word aligned and large enough for P.
                unsafe { object.payload().cast::<P>().write(payload) };
            },
        )
    }
}

/// Run the write barrier for every slot of a freshly placed old object.
fn record_old_slots(heap: &Heap, object: HeapObject) {
    let Some(size) = heap.object_size(object.address()) else {
        return;
    };
    let classes = heap.classes.read();
    // SAFETY: the object is initialized and not yet visible to anyone else.
    unsafe {
        object::visit_pointers(object, size, &classes, &mut |slot| {
            heap.write_barrier(object, *slot);
        });
    }
}

fn class_holds<P: 'static>(heap: &Heap, class: ClassId) -> bool {
    heap.classes
        .read()
        .get(class)
        .and_then(|c| c.payload_type())
        == Some(TypeId::of::<P>())
}

fn live_object<T: HeapType>(local: &Local<'_, T>) -> HeapObject {
    local
        .object()
        .unwrap_or_else(|| panic!("typed handle holds a non-object {:?}", local.value()))
}

// ============================================================================
// Typed handle accessors
// ============================================================================

impl Local<'_, Str> {
    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        // SAFETY: the handle references a live string.
        unsafe { live_object(self).read_word(0) }
    }

    /// Returns `true` for the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        // SAFETY: the handle references a live string.
        unsafe { object::string_bytes(live_object(self)) }.to_vec()
    }

    /// The bytes as UTF-8, with invalid sequences replaced.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }
}

impl Local<'_, Array> {
    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        // SAFETY: the handle references a live array.
        unsafe { live_object(self).read_word(0) }
    }

    /// Returns `true` when the array has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value in slot `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        if index >= self.len() {
            return None;
        }
        // SAFETY: index is in bounds.
        Some(unsafe { *object::array_slot(live_object(self), index) })
    }

    /// Store `value` in slot `index` and run the write barrier.
    ///
    /// # Panics
    ///
    /// Panics when `index` is out of bounds.
    pub fn set(&self, heap: &Heap, index: usize, value: Value) {
        let len = self.len();
        assert!(index < len, "index {index} out of bounds for array of length {len}");
        let host = live_object(self);
        // SAFETY: index is in bounds.
        unsafe { object::array_slot(host, index).write(value) };
        heap.write_barrier(host, value);
    }
}

impl Local<'_, WeakRef> {
    /// The referenced value; nil once the target was collected.
    #[must_use]
    pub fn target(&self) -> Value {
        // SAFETY: the handle references a live weak reference.
        unsafe { *object::weak_slot(live_object(self)) }
    }

    /// Returns `true` when the target was collected (or was nil).
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.target().is_nil()
    }
}

impl Local<'_, Instance> {
    /// Class of the instance.
    #[must_use]
    pub fn class(&self) -> ClassId {
        // SAFETY: the handle references a live instance.
        let info = unsafe { live_object(self).type_info() };
        info.class
            .unwrap_or_else(|| panic!("instance {:#x} has no class", self.address()))
    }

    /// Copy of the payload, or `None` when the class does not hold a `P`.
    #[must_use]
    pub fn read<P: Copy + 'static>(&self, heap: &Heap) -> Option<P> {
        if !class_holds::<P>(heap, self.class()) {
            return None;
        }
        // SAFETY: the class stores a P at the start of the payload.
        Some(unsafe { live_object(self).payload().cast::<P>().read() })
    }

    /// Replace the payload and run the write barrier for its values.
    /// Returns `false` and leaves the instance alone when the class does not
    /// hold a `P`.
    pub fn write<P: Copy + 'static>(&self, heap: &Heap, payload: P) -> bool {
        if !class_holds::<P>(heap, self.class()) {
            return false;
        }
        let host = live_object(self);
        // SAFETY: the class stores a P at the start of the payload.
        unsafe { host.payload().cast::<P>().write(payload) };
        if !heap.is_young(host.address()) {
            record_old_slots(heap, host);
        }
        true
    }
}
