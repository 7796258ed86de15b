//! Client-defined object layouts.
//!
//! Built-in kinds are visited by an exhaustive match in the collector. The
//! one open extension point is [`ObjectClass`]: a registered class tells the
//! collector where the value slots of its instances are.

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};

use crate::error::ClassError;
use crate::object::{ClassId, Value, WORD};

// ============================================================================
// Visit - payload slot enumeration
// ============================================================================

/// Enumerate every [`Value`] stored in a payload.
///
/// # Safety
///
/// An implementation must hand every `Value` field to `visitor`, including
/// those of nested structs and arrays. A missed field dangles after the next
/// moving collection. Prefer `#[derive(Visit)]`.
pub unsafe trait Visit {
    /// Call `visitor` with each value slot.
    fn visit_values(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

unsafe impl Visit for Value {
    #[inline]
    fn visit_values(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(self);
    }
}

unsafe impl<T: Visit, const N: usize> Visit for [T; N] {
    #[inline]
    fn visit_values(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for item in self {
            item.visit_values(visitor);
        }
    }
}

macro_rules! impl_visit_leaf {
    ($($t:ty),*) => {
        $(
            unsafe impl Visit for $t {
                #[inline]
                fn visit_values(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
            }
        )*
    };
}

impl_visit_leaf![
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64
];

// ============================================================================
// ObjectClass
// ============================================================================

/// Pointer layout of a client object kind.
pub trait ObjectClass: Send + Sync {
    /// Human readable name, used in diagnostics.
    fn name(&self) -> &str;

    /// Call `visitor` with every strong value slot in the payload.
    ///
    /// # Safety
    ///
    /// `payload` points at `len` bytes of a live instance of this class that
    /// the caller owns exclusively for the duration of the call.
    unsafe fn visit_pointers(&self, payload: *mut u8, len: usize, visitor: &mut dyn FnMut(&mut Value));

    /// Rust type stored in the payload, when there is one. Typed payload
    /// access through a handle is refused for classes returning `None`.
    fn payload_type(&self) -> Option<TypeId> {
        None
    }
}

/// [`ObjectClass`] for instances whose payload is a `T`.
pub struct TypedClass<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Visit + Copy + 'static> TypedClass<T> {
    /// Class named `name`.
    ///
    /// # Errors
    ///
    /// [`ClassError::Misaligned`] when `T` needs more than word alignment.
    pub fn new(name: impl Into<String>) -> Result<Self, ClassError> {
        if align_of::<T>() > WORD {
            return Err(ClassError::Misaligned {
                align: align_of::<T>(),
            });
        }
        Ok(Self {
            name: name.into(),
            _marker: PhantomData,
        })
    }
}

impl<T: Visit + Copy + 'static> ObjectClass for TypedClass<T> {
    fn name(&self) -> &str {
        &self.name
    }

    unsafe fn visit_pointers(&self, payload: *mut u8, len: usize, visitor: &mut dyn FnMut(&mut Value)) {
        debug_assert!(len >= size_of::<T>());
        // SAFETY: instances of this class hold a T at the start of the payload.
        unsafe { (*payload.cast::<T>()).visit_values(visitor) };
    }

    fn payload_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<T>())
    }
}

impl<T> fmt::Debug for TypedClass<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedClass").field("name", &self.name).finish()
    }
}

// ============================================================================
// ClassRegistry
// ============================================================================

/// Table of registered classes, indexed by [`ClassId`].
#[derive(Default)]
pub struct ClassRegistry {
    classes: Vec<Box<dyn ObjectClass>>,
}

impl ClassRegistry {
    /// Largest number of classes a header can address.
    pub const MAX_CLASSES: usize = u16::MAX as usize - 1;

    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class.
    ///
    /// # Errors
    ///
    /// [`ClassError::TooManyClasses`] once the table is full.
    pub fn register(&mut self, class: Box<dyn ObjectClass>) -> Result<ClassId, ClassError> {
        if self.classes.len() >= Self::MAX_CLASSES {
            return Err(ClassError::TooManyClasses);
        }
        #[allow(clippy::cast_possible_truncation)]
        let id = ClassId(self.classes.len() as u16);
        self.classes.push(class);
        Ok(id)
    }

    /// Look up a class.
    #[must_use]
    pub fn get(&self, id: ClassId) -> Option<&dyn ObjectClass> {
        self.classes.get(id.index()).map(Box::as_ref)
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.classes.iter().map(|c| c.name()))
            .finish()
    }
}
