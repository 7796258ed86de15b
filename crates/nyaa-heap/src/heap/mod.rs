//! The heap: spaces, allocation routing and collection entry points.
//!
//! A [`Heap`] owns one young generation ([`NewSpace`]), one old generation
//! ([`OldSpace`]), one large-object space ([`LargeSpace`]) and a permanent
//! metadata space ([`MetaSpace`]). Allocation is routed by size and
//! [`AllocFlags`]; collection is stop-the-world and runs under the write side
//! of the heap's GC lock while every allocation holds the read side.
//!
//! # Safepoints
//!
//! The heap does not suspend mutator threads. A collection may only be
//! started while every other thread attached to the heap is parked at a
//! point where it holds no raw object address outside its handles.

mod bitmap;
mod large_space;
mod meta_space;
mod old_space;
mod page;
mod page_table;
mod ring;
mod semi_space;
mod tcb;

pub use bitmap::{AllocationBitmap, BitmapIter};
pub use large_space::LargeSpace;
pub use meta_space::MetaSpace;
pub use old_space::{OldSpace, OldSpaceOptions};
pub use page::{
    LargePage, LinearPage, Page, PageHeader, RegionClass, SpaceKind, PAGE_HEADER_SIZE, PAGE_MAGIC,
    PAGE_MASK, PAGE_SIZE, REGION_CLASSES,
};
pub use page_table::PageTable;
pub use ring::{PageArena, PageId, PageRing, RingTag};
pub use semi_space::{NewSpace, SemiSpace, SemiSpaceIter};
pub use tcb::ThreadControlBlock;

use std::alloc::Layout;
use std::collections::HashSet;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use sys_alloc::{OsAllocator, PageAllocator};

use crate::class::{ClassRegistry, ObjectClass, TypedClass, Visit};
use crate::config::HeapConfig;
use crate::error::{AllocError, AllocationResult, ClassError, GcError};
use crate::gc::{self, CollectCondition, CollectInfo, CollectionKind};
use crate::handles::GlobalHandles;
use crate::metrics::{global_metrics, GcMetrics};
use crate::object::{
    round_allocation, ClassId, HeaderWord, HeapColor, HeapObject, ObjectKind, TypeInfo, Value,
    WORD,
};
use crate::printer::{GcPrinter, NullPrinter};
use crate::roots::{NoRoots, RootProvider};

/// Buffered barrier records that trigger an early fold into the remembered
/// set.
const REMEMBERED_BUFFER_LIMIT: usize = 1024;

bitflags! {
    /// Placement hints for [`Heap::allocate`].
    ///
    /// The empty set allocates in the young generation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u8 {
        /// Allocate directly in old space.
        const OLD = 1 << 0;
        /// Allocate in the large-object space regardless of size.
        const LARGE = 1 << 1;
        /// Allocate permanent, unscanned memory.
        const METADATA = 1 << 2;
    }
}

/// A generational, moving heap.
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) page_table: Arc<PageTable>,
    pub(crate) new_space: NewSpace,
    pub(crate) old_space: OldSpace,
    pub(crate) large_space: LargeSpace,
    pub(crate) meta_space: MetaSpace,
    initialize_color: AtomicU8,
    finalize_color: AtomicU8,
    gc_lock: RwLock<()>,
    collecting: AtomicBool,
    /// Hosts recorded by the write barrier since the last collection.
    remembered_buffer: SegQueue<usize>,
    /// Old and large objects that may hold young references.
    pub(crate) remembered: Mutex<HashSet<usize>>,
    /// Every weak reference object.
    pub(crate) weak_objects: Mutex<Vec<usize>>,
    threads: Mutex<Vec<Weak<ThreadControlBlock>>>,
    globals: Arc<GlobalHandles>,
    pub(crate) classes: RwLock<ClassRegistry>,
    pub(crate) printer: Box<dyn GcPrinter>,
    last_metrics: Mutex<GcMetrics>,
    collect_condition: Mutex<CollectCondition>,
    collections: AtomicUsize,
}

impl Heap {
    /// Create a heap drawing memory straight from the OS.
    ///
    /// `config` is used as given; run [`HeapConfig::validate`] or
    /// [`HeapConfig::clamped`] first on untrusted input.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when the semi-spaces cannot be mapped.
    pub fn new(config: HeapConfig, printer: Box<dyn GcPrinter>) -> AllocationResult<Self> {
        Self::with_allocator(config, printer, Arc::new(OsAllocator))
    }

    /// Create a heap with the default printer and configuration.
    ///
    /// # Errors
    ///
    /// See [`Heap::new`].
    pub fn with_defaults() -> AllocationResult<Self> {
        Self::new(HeapConfig::default(), Box::new(NullPrinter))
    }

    /// Create a heap over a custom page allocator.
    ///
    /// # Errors
    ///
    /// See [`Heap::new`].
    pub fn with_allocator(
        config: HeapConfig,
        printer: Box<dyn GcPrinter>,
        allocator: Arc<dyn PageAllocator>,
    ) -> AllocationResult<Self> {
        let new_space =
            NewSpace::new(allocator.as_ref(), config.new_space_size).map_err(|_| {
                AllocError::OutOfMemory {
                    space: SpaceKind::New,
                    requested: config.new_space_size,
                }
            })?;
        let page_table = Arc::new(PageTable::new());
        let old_space = OldSpace::new(
            Arc::clone(&allocator),
            Arc::clone(&page_table),
            OldSpaceOptions {
                max_pages: (config.old_space_limit / PAGE_SIZE).max(1),
                max_freed_pages: config.max_freed_pages,
                allocate_retries: config.allocate_retries,
                protect_free_pages: config.protect_free_pages,
            },
        );
        let large_space = LargeSpace::new(Arc::clone(&allocator), Arc::clone(&page_table));
        let meta_space = MetaSpace::new(allocator, Arc::clone(&page_table));

        #[cfg(feature = "tracing")]
        tracing::debug!(
            new_space = config.new_space_size,
            old_limit = config.old_space_limit,
            large_threshold = config.large_object_threshold,
            "heap created"
        );

        Ok(Self {
            config,
            page_table,
            new_space,
            old_space,
            large_space,
            meta_space,
            initialize_color: AtomicU8::new(HeapColor::Even as u8),
            finalize_color: AtomicU8::new(HeapColor::Odd as u8),
            gc_lock: RwLock::new(()),
            collecting: AtomicBool::new(false),
            remembered_buffer: SegQueue::new(),
            remembered: Mutex::new(HashSet::new()),
            weak_objects: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            globals: Arc::new(GlobalHandles::new()),
            classes: RwLock::new(ClassRegistry::new()),
            printer,
            last_metrics: Mutex::new(GcMetrics::new()),
            collect_condition: Mutex::new(gc::default_collect_condition as CollectCondition),
            collections: AtomicUsize::new(0),
        })
    }

    /// Configuration the heap was built with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `size` bytes and return the object address.
    ///
    /// The first word is initialized to a [`ObjectKind::Raw`] header so the
    /// collector can walk the memory; the caller may fill the rest.
    /// Metadata allocations carry no header and are never collected.
    ///
    /// # Errors
    ///
    /// [`AllocError::BadRequest`] for a zero size, and
    /// [`AllocError::OutOfMemory`] when the chosen space is full. A full
    /// young generation is an ordinary failure: collect and retry.
    pub fn allocate(&self, size: usize, flags: AllocFlags) -> AllocationResult<NonNull<u8>> {
        if size == 0 {
            return Err(AllocError::BadRequest { size, align: WORD });
        }
        if flags.contains(AllocFlags::METADATA) {
            return self.meta_space.allocate(size);
        }
        self.allocate_object(size, flags, TypeInfo::new(ObjectKind::Raw), |_| ())
            .map(|(object, ())| object.as_non_null())
    }

    /// [`Heap::allocate`] for a [`Layout`].
    ///
    /// # Errors
    ///
    /// [`AllocError::BadRequest`] when the alignment is above one word.
    pub fn allocate_layout(&self, layout: Layout, flags: AllocFlags) -> AllocationResult<NonNull<u8>> {
        if layout.align() > WORD {
            return Err(AllocError::BadRequest {
                size: layout.size(),
                align: layout.align(),
            });
        }
        self.allocate(layout.size(), flags)
    }

    /// Allocate an object, write its header and run `init` on it while no
    /// collection can start.
    pub(crate) fn allocate_object<R>(
        &self,
        size: usize,
        flags: AllocFlags,
        info: TypeInfo,
        init: impl FnOnce(HeapObject) -> R,
    ) -> AllocationResult<(HeapObject, R)> {
        let size = round_allocation(size);
        let _guard = self.gc_lock.read();
        let (ptr, space) = if flags.contains(AllocFlags::LARGE) || size > self.config.large_object_threshold
        {
            (self.large_space.allocate(size)?, SpaceKind::Large)
        } else if flags.contains(AllocFlags::OLD) {
            (self.old_space.allocate(size)?, SpaceKind::Old)
        } else {
            (self.new_space.allocate(size)?, SpaceKind::New)
        };
        let object = HeapObject::from_ptr(ptr);
        let color = match space {
            SpaceKind::New => None,
            _ => Some(self.initialize_color()),
        };
        // SAFETY: freshly allocated, nobody else can see it yet.
        unsafe { object.set_header(HeaderWord::Typed(info.with_color(color))) };
        if info.kind == ObjectKind::WeakRef {
            self.weak_objects.lock().push(object.address());
        }
        let result = init(object);
        Ok((object, result))
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    /// Space holding `addr`, if any.
    ///
    /// Young addresses are only recognised below the allocation cursor.
    #[must_use]
    pub fn space_of(&self, addr: usize) -> Option<SpaceKind> {
        if self.new_space.contains(addr) {
            return Some(SpaceKind::New);
        }
        self.page_table.lookup(addr)
    }

    /// Returns `true` if `addr` is in the young generation.
    #[must_use]
    pub fn is_young(&self, addr: usize) -> bool {
        self.new_space.contains(addr)
    }

    /// Returns `true` if `addr` is an object in old space.
    #[must_use]
    pub fn is_old(&self, addr: usize) -> bool {
        self.page_table.lookup(addr) == Some(SpaceKind::Old) && self.old_space.contains(addr)
    }

    /// Returns `true` if an object starts at `addr` in a collected space.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        match self.space_of(addr) {
            Some(SpaceKind::New) => self.new_space.original().is_allocated(addr),
            Some(SpaceKind::Old) => self.old_space.contains(addr),
            Some(SpaceKind::Large) => self.large_space.contains(addr),
            Some(SpaceKind::Metadata) | None => false,
        }
    }

    /// Allocated size of the object at `addr`.
    #[must_use]
    pub fn object_size(&self, addr: usize) -> Option<usize> {
        match self.space_of(addr)? {
            SpaceKind::New => {
                let original = self.new_space.original();
                original
                    .is_allocated(addr)
                    .then(|| original.allocated_size(addr))
            }
            SpaceKind::Old => self
                .old_space
                .contains(addr)
                .then(|| self.old_space.allocated_size(addr)),
            SpaceKind::Large => self.large_space.object_size(addr),
            SpaceKind::Metadata => None,
        }
    }

    /// The young generation.
    #[must_use]
    pub const fn new_space(&self) -> &NewSpace {
        &self.new_space
    }

    /// The old generation.
    #[must_use]
    pub const fn old_space(&self) -> &OldSpace {
        &self.old_space
    }

    /// The large-object space.
    #[must_use]
    pub const fn large_space(&self) -> &LargeSpace {
        &self.large_space
    }

    /// The metadata space.
    #[must_use]
    pub const fn meta_space(&self) -> &MetaSpace {
        &self.meta_space
    }

    // ------------------------------------------------------------------
    // Colors
    // ------------------------------------------------------------------

    /// Color given to new old and large objects.
    #[must_use]
    pub fn initialize_color(&self) -> HeapColor {
        HeapColor::from_bits(self.initialize_color.load(Ordering::Acquire))
            .unwrap_or(HeapColor::Even)
    }

    /// Color the next mark phase paints reachable objects with.
    #[must_use]
    pub fn finalize_color(&self) -> HeapColor {
        HeapColor::from_bits(self.finalize_color.load(Ordering::Acquire))
            .unwrap_or(HeapColor::Odd)
    }

    /// Exchange the two colors. Survivors of the last mark phase become the
    /// unmarked color of the next one.
    pub fn swap_colors(&self) {
        let initialize = self.initialize_color();
        let finalize = self.finalize_color();
        self.initialize_color.store(finalize as u8, Ordering::Release);
        self.finalize_color.store(initialize as u8, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Mutator support
    // ------------------------------------------------------------------

    /// Record that `host` now stores `value`.
    ///
    /// Must follow every store of a value into an object field made outside
    /// the factory accessors.
    pub fn write_barrier(&self, host: HeapObject, value: Value) {
        let Some(target) = value.object_address() else {
            return;
        };
        if !self.is_young(target) || self.is_young(host.address()) {
            return;
        }
        let host = host.address();
        if !matches!(
            self.page_table.lookup(host),
            Some(SpaceKind::Old | SpaceKind::Large)
        ) {
            return;
        }
        let known = self.remembered.lock().contains(&host);
        if known {
            return;
        }
        self.remembered_buffer.push(host);
        if self.remembered_buffer.len() >= REMEMBERED_BUFFER_LIMIT {
            self.drain_remembered_buffer();
        }
    }

    /// Barrier records not yet folded into the remembered set.
    pub(crate) fn buffered_hosts(&self) -> usize {
        self.remembered_buffer.len()
    }

    /// Move the write barrier buffer into the remembered set.
    pub(crate) fn drain_remembered_buffer(&self) -> usize {
        let mut remembered = self.remembered.lock();
        let mut drained = 0;
        while let Some(host) = self.remembered_buffer.pop() {
            remembered.insert(host);
            drained += 1;
        }
        drained
    }

    /// Number of hosts in the remembered set, buffered ones included.
    #[must_use]
    pub fn remembered_count(&self) -> usize {
        self.drain_remembered_buffer();
        self.remembered.lock().len()
    }

    /// Register a weak reference allocated outside the factory.
    pub fn register_weak(&self, object: HeapObject) {
        self.weak_objects.lock().push(object.address());
    }

    /// Number of registered weak references.
    #[must_use]
    pub fn weak_count(&self) -> usize {
        self.weak_objects.lock().len()
    }

    /// Create a control block for the calling thread and attach it, so the
    /// collector walks its handle scopes.
    #[must_use]
    pub fn attach_thread(&self) -> Arc<ThreadControlBlock> {
        let tcb = Arc::new(ThreadControlBlock::new());
        let mut threads = self.threads.lock();
        threads.retain(|t| t.strong_count() > 0);
        threads.push(Arc::downgrade(&tcb));
        tcb
    }

    /// Number of attached control blocks still alive.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads
            .lock()
            .iter()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    /// Register a client object layout.
    ///
    /// # Errors
    ///
    /// [`ClassError::TooManyClasses`] when the class table is full.
    pub fn register_class(&self, class: Box<dyn ObjectClass>) -> Result<ClassId, ClassError> {
        self.classes.write().register(class)
    }

    /// Register a class whose instances hold a `T`.
    ///
    /// # Errors
    ///
    /// [`ClassError::Misaligned`] when `T` needs more than word alignment.
    pub fn register_type<T: Visit + Copy + 'static>(
        &self,
        name: impl Into<String>,
    ) -> Result<ClassId, ClassError> {
        self.register_class(Box::new(TypedClass::<T>::new(name)?))
    }

    /// Heap-wide pool behind [`Persistent`](crate::Persistent) handles.
    #[must_use]
    pub const fn global_handles(&self) -> &Arc<GlobalHandles> {
        &self.globals
    }

    /// Visit every root slot: handles of attached threads, the global pool
    /// and `extra`.
    pub(crate) fn visit_roots(
        &self,
        extra: &mut dyn RootProvider,
        visitor: &mut dyn FnMut(&mut Value),
    ) {
        let threads: Vec<_> = {
            let mut threads = self.threads.lock();
            threads.retain(|t| t.strong_count() > 0);
            threads.iter().filter_map(Weak::upgrade).collect()
        };
        for tcb in threads {
            // SAFETY: mutators are stopped while the collector runs.
            unsafe { (*tcb.local_handles_ptr()).iterate_mut(visitor) };
        }
        self.globals.iterate(visitor);
        extra.visit_roots(visitor);
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Run a collection with no roots besides handles.
    ///
    /// # Errors
    ///
    /// See [`Heap::collect_with`].
    pub fn collect(&self, kind: CollectionKind) -> Result<GcMetrics, GcError> {
        self.collect_with(kind, &mut NoRoots)
    }

    /// Run a collection that also treats `roots` as roots.
    ///
    /// Every other thread attached to the heap must be parked at a safepoint.
    ///
    /// # Errors
    ///
    /// [`GcError::Reentrant`] when a collection is already running, or the
    /// error that aborted the cycle.
    pub fn collect_with(
        &self,
        kind: CollectionKind,
        roots: &mut dyn RootProvider,
    ) -> Result<GcMetrics, GcError> {
        if self.collecting.swap(true, Ordering::AcqRel) {
            return Err(GcError::Reentrant);
        }
        let _reset = CollectingGuard(&self.collecting);
        let _lock = self.gc_lock.write();

        let total = self.collections.fetch_add(1, Ordering::Relaxed) + 1;
        let mut metrics = gc::run(self, kind, roots)?;
        metrics.total_collections = total;

        global_metrics().record(&metrics);
        *self.last_metrics.lock() = metrics;
        self.printer.println(format_args!(
            "[gc #{total}] {}: collected {} bytes in {} objects, {} bytes survive, {} promoted, {:?}",
            metrics.collection_type.name(),
            metrics.bytes_collected,
            metrics.objects_collected,
            metrics.bytes_surviving,
            metrics.bytes_promoted,
            metrics.duration,
        ));
        Ok(metrics)
    }

    /// Returns `true` while a collection runs.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }

    /// Kind of collection the current condition asks for, if any.
    #[must_use]
    pub fn collection_needed(&self) -> Option<CollectionKind> {
        let condition = *self.collect_condition.lock();
        condition(&self.collect_info(), &self.config)
    }

    /// Collect if the condition asks for it.
    ///
    /// # Errors
    ///
    /// See [`Heap::collect_with`].
    pub fn safepoint(&self, roots: &mut dyn RootProvider) -> Result<Option<GcMetrics>, GcError> {
        match self.collection_needed() {
            Some(kind) => self.collect_with(kind, roots).map(Some),
            None => Ok(None),
        }
    }

    /// Replace the function deciding when to collect.
    pub fn set_collect_condition(&self, condition: CollectCondition) {
        *self.collect_condition.lock() = condition;
    }

    /// Snapshot of the usage numbers the collect condition sees.
    #[must_use]
    pub fn collect_info(&self) -> CollectInfo {
        let original = self.new_space.original();
        CollectInfo::new(
            original.used(),
            original.capacity(),
            self.old_space.used_size(),
            self.old_space.limit(),
            self.large_space.used_size(),
            self.collections.load(Ordering::Relaxed),
        )
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub fn last_gc_metrics(&self) -> GcMetrics {
        *self.last_metrics.lock()
    }

    /// Number of collections run so far.
    #[must_use]
    pub fn collection_count(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }
}

struct CollectingGuard<'a>(&'a AtomicBool);

impl Drop for CollectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("new_space", &self.new_space)
            .field("old_space", &self.old_space)
            .field("large_space", &self.large_space)
            .field("initialize_color", &self.initialize_color())
            .field("collections", &self.collection_count())
            .finish_non_exhaustive()
    }
}
