//! Heap object headers, values and built-in object layouts.
//!
//! Every heap object starts with one header word. The word is either a
//! forwarding address (written by a moving collector over an object it has
//! already copied) or a type word carrying the object kind, the heap color,
//! the survival age and an optional class id. Bit 0 discriminates the two.
//!
//! ```text
//! Forwarded:  [ new address ............................ | 1 ]
//! Typed:      [ class+1 (16) | kind (8) | 0 | age (3) | color (2) | 0 ]
//! ```
//!
//! Object sizes are never stored in the header; the allocation bitmap of the
//! owning space records them.

use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;

/// Size of a machine word in bytes.
pub const WORD: usize = size_of::<usize>();

/// Smallest allocation the heap hands out. The allocation bitmap needs
/// distinct start and end words.
pub const MIN_ALLOCATION: usize = 2 * WORD;

const FORWARD_TAG: usize = 1;
const COLOR_SHIFT: u32 = 1;
const COLOR_MASK: usize = 0b11;
const AGE_SHIFT: u32 = 3;
const AGE_MASK: usize = 0b111;
const KIND_SHIFT: u32 = 8;
const KIND_MASK: usize = 0xff;
const CLASS_SHIFT: u32 = 16;
const CLASS_MASK: usize = 0xffff;

/// Oldest age an object header can record.
pub const MAX_AGE: u8 = 7;

/// Round a request up to the allocation granularity.
#[must_use]
pub const fn round_allocation(size: usize) -> usize {
    let rounded = (size + WORD - 1) & !(WORD - 1);
    if rounded < MIN_ALLOCATION {
        MIN_ALLOCATION
    } else {
        rounded
    }
}

// ============================================================================
// Colors and kinds
// ============================================================================

/// One of the two rotating colors used by the tracing collector.
///
/// The heap keeps an *initialize* color (given to every object allocated in
/// the old or large space) and a *finalize* color (given to every object the
/// mark phase reaches). After a major cycle the two are swapped, so survivors
/// silently become "unmarked" for the next cycle without a clearing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeapColor {
    /// First color.
    Even = 1,
    /// Second color.
    Odd = 2,
}

impl HeapColor {
    /// The other color.
    #[must_use]
    pub const fn flip(self) -> Self {
        match self {
            Self::Even => Self::Odd,
            Self::Odd => Self::Even,
        }
    }

    pub(crate) const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Even),
            2 => Some(Self::Odd),
            _ => None,
        }
    }
}

/// Built-in object kinds.
///
/// The set is closed; client-defined layouts use [`ObjectKind::Custom`] and
/// provide their pointer visitor through an [`ObjectClass`](crate::ObjectClass).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    /// Opaque bytes handed out by [`Heap::allocate`](crate::Heap::allocate).
    Raw = 1,
    /// Byte string: length word followed by the bytes.
    Str = 2,
    /// Fixed-length array of values: length word followed by the slots.
    Array = 3,
    /// A single weak slot.
    WeakRef = 4,
    /// Client layout described by a registered class.
    Custom = 5,
}

impl ObjectKind {
    const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Raw),
            2 => Some(Self::Str),
            3 => Some(Self::Array),
            4 => Some(Self::WeakRef),
            5 => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Index of a registered [`ObjectClass`](crate::ObjectClass).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub(crate) u16);

impl ClassId {
    /// Numeric index of the class.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Header word
// ============================================================================

/// Type information stored in a non-forwarded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    /// Layout of the object.
    pub kind: ObjectKind,
    /// Tracing color; `None` for young objects.
    pub color: Option<HeapColor>,
    /// Number of minor collections survived.
    pub age: u8,
    /// Class of a [`ObjectKind::Custom`] object.
    pub class: Option<ClassId>,
}

impl TypeInfo {
    /// Type word for a freshly allocated object.
    #[must_use]
    pub const fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            color: None,
            age: 0,
            class: None,
        }
    }

    /// Type word for an instance of `class`.
    #[must_use]
    pub const fn custom(class: ClassId) -> Self {
        Self {
            kind: ObjectKind::Custom,
            color: None,
            age: 0,
            class: Some(class),
        }
    }

    /// Same type word with a different color.
    #[must_use]
    pub const fn with_color(mut self, color: Option<HeapColor>) -> Self {
        self.color = color;
        self
    }

    /// Same type word with a different age, saturated at [`MAX_AGE`].
    #[must_use]
    pub const fn with_age(mut self, age: u8) -> Self {
        self.age = if age > MAX_AGE { MAX_AGE } else { age };
        self
    }
}

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderWord {
    /// The object was copied; this is its new address.
    Forwarded(usize),
    /// A live object of the given type.
    Typed(TypeInfo),
}

impl HeaderWord {
    /// Pack into a single word.
    #[must_use]
    pub const fn encode(self) -> usize {
        match self {
            Self::Forwarded(addr) => {
                debug_assert!(addr % WORD == 0);
                addr | FORWARD_TAG
            }
            Self::Typed(info) => {
                let color = match info.color {
                    Some(c) => c as usize,
                    None => 0,
                };
                let class = match info.class {
                    Some(c) => c.0 as usize + 1,
                    None => 0,
                };
                (color << COLOR_SHIFT)
                    | ((info.age as usize & AGE_MASK) << AGE_SHIFT)
                    | ((info.kind as usize) << KIND_SHIFT)
                    | (class << CLASS_SHIFT)
            }
        }
    }

    /// Unpack a header word.
    ///
    /// # Panics
    ///
    /// Panics on a word that is neither a forwarding address nor a valid type
    /// word. That only happens when the heap is already corrupt.
    #[must_use]
    pub fn decode(word: usize) -> Self {
        if word & FORWARD_TAG != 0 {
            return Self::Forwarded(word & !FORWARD_TAG);
        }
        #[allow(clippy::cast_possible_truncation)]
        let kind_bits = ((word >> KIND_SHIFT) & KIND_MASK) as u8;
        let Some(kind) = ObjectKind::from_bits(kind_bits) else {
            panic!("corrupt object header word {word:#x}");
        };
        #[allow(clippy::cast_possible_truncation)]
        let color = HeapColor::from_bits(((word >> COLOR_SHIFT) & COLOR_MASK) as u8);
        #[allow(clippy::cast_possible_truncation)]
        let age = ((word >> AGE_SHIFT) & AGE_MASK) as u8;
        let class_bits = (word >> CLASS_SHIFT) & CLASS_MASK;
        #[allow(clippy::cast_possible_truncation)]
        let class = if class_bits == 0 {
            None
        } else {
            Some(ClassId((class_bits - 1) as u16))
        };
        Self::Typed(TypeInfo {
            kind,
            color,
            age,
            class,
        })
    }

    /// Returns `true` for a forwarding header.
    #[must_use]
    pub const fn is_forwarded(self) -> bool {
        matches!(self, Self::Forwarded(_))
    }
}

// ============================================================================
// Value
// ============================================================================

/// One word of VM data: nil, a small integer or a heap object reference.
///
/// Small integers carry a 1 in the low bit; object references are word
/// aligned and non-zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Value(usize);

impl Value {
    /// The nil value.
    pub const NIL: Self = Self(0);

    /// Wrap a small integer. The top bit of `n` is lost.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_int(n: isize) -> Self {
        Self(((n << 1) | 1) as usize)
    }

    /// Reference a heap object.
    #[must_use]
    pub fn from_object(object: HeapObject) -> Self {
        Self(object.0.as_ptr() as usize)
    }

    /// Reconstruct a value from its raw word.
    ///
    /// # Safety
    ///
    /// If the word is an object reference it must point at a live object.
    #[must_use]
    pub const unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw word.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Returns `true` for nil.
    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// The integer payload, if this is a small integer.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_int(self) -> Option<isize> {
        if self.0 & 1 == 1 {
            Some((self.0 as isize) >> 1)
        } else {
            None
        }
    }

    /// The referenced object, if this is an object reference.
    #[must_use]
    pub const fn as_object(self) -> Option<HeapObject> {
        if self.0 != 0 && self.0 & 1 == 0 {
            // SAFETY: checked non-zero above.
            Some(HeapObject(unsafe { NonNull::new_unchecked(self.0 as *mut u8) }))
        } else {
            None
        }
    }

    pub(crate) const fn object_address(self) -> Option<usize> {
        if self.0 != 0 && self.0 & 1 == 0 {
            Some(self.0)
        } else {
            None
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "Nil")
        } else if let Some(n) = self.as_int() {
            write!(f, "Int({n})")
        } else {
            write!(f, "Object({:#x})", self.0)
        }
    }
}

// ============================================================================
// HeapObject
// ============================================================================

/// Untyped pointer to the header word of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapObject(NonNull<u8>);

impl HeapObject {
    /// Wrap a raw address.
    ///
    /// # Safety
    ///
    /// `addr` must be a non-zero, word aligned address of an object header.
    #[must_use]
    pub const unsafe fn from_address(addr: usize) -> Self {
        Self(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Wrap a raw pointer.
    #[must_use]
    pub const fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Address of the header word.
    #[must_use]
    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Pointer to the header word.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Non-null pointer to the header word.
    #[must_use]
    pub const fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    /// Pointer to the first byte after the header word.
    #[must_use]
    pub const fn payload(self) -> *mut u8 {
        // SAFETY: every object is at least two words long.
        unsafe { self.0.as_ptr().add(WORD) }
    }

    /// Read and decode the header.
    ///
    /// # Safety
    ///
    /// The object must live in mapped heap memory.
    #[must_use]
    pub unsafe fn header(self) -> HeaderWord {
        HeaderWord::decode(unsafe { self.0.as_ptr().cast::<usize>().read() })
    }

    /// Overwrite the header.
    ///
    /// # Safety
    ///
    /// The object must live in mapped heap memory and the caller must own it
    /// exclusively (allocation, or a stop-the-world collection).
    pub unsafe fn set_header(self, header: HeaderWord) {
        unsafe { self.0.as_ptr().cast::<usize>().write(header.encode()) };
    }

    /// Type information of a non-forwarded object.
    ///
    /// # Safety
    ///
    /// See [`HeapObject::header`].
    ///
    /// # Panics
    ///
    /// Panics when the header is a forwarding address: reading a type
    /// through a stale pointer is a heap invariant violation.
    #[must_use]
    pub unsafe fn type_info(self) -> TypeInfo {
        match unsafe { self.header() } {
            HeaderWord::Typed(info) => info,
            HeaderWord::Forwarded(to) => {
                panic!(
                    "type read through forwarded object {:#x} -> {to:#x}",
                    self.address()
                )
            }
        }
    }

    /// Install a forwarding address over the header.
    ///
    /// # Safety
    ///
    /// See [`HeapObject::set_header`]; `to` must hold a complete copy.
    pub unsafe fn forward_to(self, to: Self) {
        unsafe { self.set_header(HeaderWord::Forwarded(to.address())) };
    }

    /// Read the `index`-th word after the header.
    ///
    /// # Safety
    ///
    /// The word must be inside the object.
    #[must_use]
    pub unsafe fn read_word(self, index: usize) -> usize {
        unsafe { self.payload().cast::<usize>().add(index).read() }
    }

    /// Write the `index`-th word after the header.
    ///
    /// # Safety
    ///
    /// The word must be inside the object.
    pub unsafe fn write_word(self, index: usize, word: usize) {
        unsafe { self.payload().cast::<usize>().add(index).write(word) };
    }
}

// ============================================================================
// Built-in layouts
// ============================================================================

/// Bytes needed for a string of `len` bytes.
#[must_use]
pub const fn string_size(len: usize) -> usize {
    round_allocation(2 * WORD + len)
}

/// Bytes needed for an array of `len` values.
#[must_use]
pub const fn array_size(len: usize) -> usize {
    round_allocation(2 * WORD + len * WORD)
}

/// Bytes needed for a weak reference.
pub const WEAK_REF_SIZE: usize = 2 * WORD;

/// Bytes needed for an instance with a payload of `payload` bytes.
#[must_use]
pub const fn instance_size(payload: usize) -> usize {
    round_allocation(WORD + payload)
}

/// Pointer to the bytes of a string object.
///
/// # Safety
///
/// `object` must be a live string.
pub(crate) unsafe fn string_bytes<'a>(object: HeapObject) -> &'a [u8] {
    unsafe {
        let len = object.read_word(0);
        std::slice::from_raw_parts(object.payload().add(WORD), len)
    }
}

/// Pointer to slot `index` of an array object.
///
/// # Safety
///
/// `object` must be a live array and `index` in bounds.
pub(crate) unsafe fn array_slot(object: HeapObject, index: usize) -> *mut Value {
    unsafe { object.payload().add(WORD).cast::<Value>().add(index) }
}

/// Pointer to the weak slot of a weak reference object.
pub(crate) const fn weak_slot(object: HeapObject) -> *mut Value {
    object.payload().cast::<Value>()
}

/// Visit every strong value slot of `object`.
///
/// `size` is the allocated size recorded by the owning space. Weak slots are
/// not visited; the collector handles them after tracing.
///
/// # Safety
///
/// `object` must be live, non-forwarded and exclusively owned by the caller
/// for the duration of the visit.
pub(crate) unsafe fn visit_pointers(
    object: HeapObject,
    size: usize,
    classes: &crate::class::ClassRegistry,
    visitor: &mut dyn FnMut(&mut Value),
) {
    let info = unsafe { object.type_info() };
    match info.kind {
        ObjectKind::Raw | ObjectKind::Str | ObjectKind::WeakRef => {}
        ObjectKind::Array => unsafe {
            let len = object.read_word(0);
            debug_assert!(array_size(len) <= size);
            for i in 0..len {
                visitor(&mut *array_slot(object, i));
            }
        },
        ObjectKind::Custom => {
            let class = info
                .class
                .and_then(|id| classes.get(id))
                .unwrap_or_else(|| panic!("instance {:#x} has no class", object.address()));
            unsafe { class.visit_pointers(object.payload(), size - WORD, visitor) };
        }
    }
}
