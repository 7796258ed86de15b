//! Static types for handles.
//!
//! A [`Local`](crate::Local) or [`Persistent`](crate::Persistent) carries one
//! of these marker types. [`HeapType::matches`] is the runtime check behind
//! [`Local::cast`](crate::Local::cast).

use crate::object::{ObjectKind, Value};

/// Marker for a static handle type.
pub trait HeapType: 'static {
    /// Returns `true` if `value` may be viewed as `Self`.
    fn matches(value: Value) -> bool;
}

fn kind_of(value: Value) -> Option<ObjectKind> {
    let object = value.as_object()?;
    // SAFETY: handle values always reference live objects.
    Some(unsafe { object.type_info() }.kind)
}

/// Any value: nil, small integer or object.
#[derive(Debug)]
pub enum AnyValue {}

impl HeapType for AnyValue {
    fn matches(_: Value) -> bool {
        true
    }
}

/// A byte string.
#[derive(Debug)]
pub enum Str {}

impl HeapType for Str {
    fn matches(value: Value) -> bool {
        kind_of(value) == Some(ObjectKind::Str)
    }
}

/// A fixed-length array of values.
#[derive(Debug)]
pub enum Array {}

impl HeapType for Array {
    fn matches(value: Value) -> bool {
        kind_of(value) == Some(ObjectKind::Array)
    }
}

/// A weak reference.
#[derive(Debug)]
pub enum WeakRef {}

impl HeapType for WeakRef {
    fn matches(value: Value) -> bool {
        kind_of(value) == Some(ObjectKind::WeakRef)
    }
}

/// An instance of a registered class.
#[derive(Debug)]
pub enum Instance {}

impl HeapType for Instance {
    fn matches(value: Value) -> bool {
        kind_of(value) == Some(ObjectKind::Custom)
    }
}

/// Opaque bytes from [`Heap::allocate`](crate::Heap::allocate).
#[derive(Debug)]
pub enum RawBlob {}

impl HeapType for RawBlob {
    fn matches(value: Value) -> bool {
        kind_of(value) == Some(ObjectKind::Raw)
    }
}
