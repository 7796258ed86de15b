//! A generational, moving heap for the nyaa virtual machine.
//!
//! `nyaa-heap` owns every byte a running program allocates. Objects are born
//! in a copying young generation, promoted to a free-list old generation once
//! they survive long enough, and very large objects get pages of their own.
//! Native code reaches objects only through handles, because any collection
//! may move them.
//!
//! # Spaces
//!
//! - **New space**: two semi-spaces with lock-free bump allocation. A minor
//!   collection copies live objects into the other half and flips.
//! - **Old space**: 1 MiB pages with five size-class free lists and an
//!   allocation bitmap that records object sizes.
//! - **Large space**: one page per object.
//! - **Metadata space**: permanent bump allocation, never collected.
//!
//! # Collectors
//!
//! [`CollectionKind::Minor`] scavenges the young generation.
//! [`CollectionKind::MarkSweep`] marks the whole heap and frees dead old and
//! large objects in place. [`CollectionKind::MarkCompact`] marks and then
//! evacuates every live old page. [`CollectionKind::Full`] is a scavenge
//! followed by a mark-compact. All of them stop the world.
//!
//! # Quick Start
//!
//! ```
//! use nyaa_heap::{AllocFlags, CollectionKind, HandleScope, Heap, ObjectFactory};
//!
//! let heap = Heap::with_defaults().unwrap();
//! let thread = heap.attach_thread();
//! let scope = HandleScope::new(&thread);
//! let factory = ObjectFactory::new(&heap);
//!
//! let greeting = factory.new_string(&scope, "Hello", AllocFlags::empty()).unwrap();
//! heap.collect(CollectionKind::Minor).unwrap();
//! heap.collect(CollectionKind::MarkSweep).unwrap();
//! assert_eq!(greeting.to_string_lossy(), "Hello");
//! ```
//!
//! # Roots
//!
//! The collector treats as roots exactly: the [`Local`] handles of every
//! thread attached with [`Heap::attach_thread`], every live [`Persistent`],
//! and whatever [`RootProvider`] is passed to [`Heap::collect_with`] (for
//! example an [`ExecutionStack`]). An address held anywhere else dangles
//! after the next collection.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod bytecode;
pub mod class;
pub mod config;
pub mod error;
mod factory;
mod gc;
pub mod handles;
pub mod heap;
pub mod kinds;
pub mod metrics;
pub mod object;
pub mod printer;
pub mod roots;

// Re-export public API
pub use class::{ClassRegistry, ObjectClass, TypedClass, Visit};
pub use config::HeapConfig;
pub use error::{
    AllocError, AllocationResult, BytecodeError, ClassError, ConfigError, GcError, StreamError,
};
pub use factory::ObjectFactory;
pub use gc::tracing::GcId;
pub use gc::{default_collect_condition, CollectCondition, CollectInfo, CollectionKind};
pub use handles::{
    EscapableHandleScope, GlobalHandles, HandleScope, Local, MaybeLocal, Persistent,
    SealedHandleScope,
};
pub use heap::{AllocFlags, Heap, SpaceKind, ThreadControlBlock};
pub use kinds::{AnyValue, Array, HeapType, Instance, RawBlob, Str, WeakRef};
pub use metrics::{global_metrics, CollectionType, GcMetrics, GlobalMetrics};
pub use object::{ClassId, HeapObject, Value};
#[cfg(feature = "tracing")]
pub use printer::TracingPrinter;
pub use printer::{BufferPrinter, GcPrinter, NullPrinter};
pub use roots::{ExecutionStack, NoRoots, RootProvider};

// Re-export derive macro when feature is enabled
#[cfg(feature = "derive")]
pub use nyaa_heap_derive::Visit;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use crate::object::{HeaderWord, HeapObject};

    /// Decode the header word at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be the start of an object that has not been freed, or the
    /// stale address of an object a moving collector has copied.
    pub unsafe fn header_at(addr: usize) -> HeaderWord {
        // SAFETY: guaranteed by the caller.
        unsafe { HeapObject::from_address(addr).header() }
    }

    /// Returns `true` if the object at `addr` was copied elsewhere.
    ///
    /// # Safety
    ///
    /// Same as [`header_at`].
    pub unsafe fn is_forwarded(addr: usize) -> bool {
        // SAFETY: guaranteed by the caller.
        unsafe { header_at(addr) }.is_forwarded()
    }
}
