//! End-to-end collection tests: survival through every collector, handle
//! rewriting, reclamation and the remembered set.

use std::cell::Cell;

use nyaa_heap::config::MIN_OLD_SPACE_LIMIT;
use nyaa_heap::{
    AllocError, AllocFlags, Array, BufferPrinter, CollectionKind, CollectionType, EscapableHandleScope,
    ExecutionStack, GcError, HandleScope, Heap, HeapConfig, NoRoots, NullPrinter, ObjectFactory,
    RootProvider, SpaceKind, Str, Value, WeakRef,
};

fn heap() -> Heap {
    Heap::new(HeapConfig::default(), Box::new(NullPrinter)).expect("heap")
}

// ============================================================================
// Survival
// ============================================================================

#[test]
fn test_string_survives_minor_then_major() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let hello = factory
        .new_string(&scope, "Hello", AllocFlags::empty())
        .expect("string");
    let born = hello.address();

    heap.collect(CollectionKind::Minor).expect("minor");
    assert_ne!(hello.address(), born, "scavenge must move the string");
    assert!(heap.contains(hello.address()));
    assert_eq!(hello.to_string_lossy(), "Hello");

    heap.collect(CollectionKind::MarkSweep).expect("major");
    assert!(heap.contains(hello.address()));
    assert_eq!(hello.to_string_lossy(), "Hello");
}

#[test]
fn test_string_survives_every_kind() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);
    let hello = factory
        .new_string(&scope, "Hello", AllocFlags::empty())
        .expect("string");

    for kind in [
        CollectionKind::Minor,
        CollectionKind::Minor,
        CollectionKind::MarkCompact,
        CollectionKind::MarkSweep,
        CollectionKind::Full,
    ] {
        heap.collect(kind).expect("collect");
        assert!(heap.contains(hello.address()), "{kind}");
        assert_eq!(hello.to_bytes(), b"Hello", "{kind}");
    }
    assert!(heap.is_old(hello.address()));
    assert_eq!(heap.collection_count(), 5);
}

#[test]
fn test_promotion_after_second_minor() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let s = ObjectFactory::new(&heap)
        .new_string(&scope, "aging", AllocFlags::empty())
        .expect("string");

    let first = heap.collect(CollectionKind::Minor).expect("minor");
    assert!(heap.is_young(s.address()));
    assert_eq!(first.bytes_promoted, 0);

    let second = heap.collect(CollectionKind::Minor).expect("minor");
    assert!(heap.is_old(s.address()));
    assert!(second.bytes_promoted > 0);
    assert_eq!(s.to_string_lossy(), "aging");
}

#[test]
fn test_shared_and_cyclic_references() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let a = factory.new_array(&scope, 2, AllocFlags::empty()).expect("a");
    {
        let inner = HandleScope::new(&thread);
        let b = factory.new_array(&inner, 2, AllocFlags::empty()).expect("b");
        let s = factory
            .new_string(&inner, "shared", AllocFlags::empty())
            .expect("s");
        a.set(&heap, 0, b.value());
        a.set(&heap, 1, s.value());
        b.set(&heap, 0, a.value());
        b.set(&heap, 1, s.value());
    }
    let born = a.value();

    for kind in [CollectionKind::Minor, CollectionKind::Minor, CollectionKind::MarkCompact] {
        heap.collect(kind).expect("collect");
        let b = scope
            .local(a.get(0).expect("slot"))
            .cast::<Array>()
            .expect("array");
        assert_eq!(b.get(0), Some(a.value()), "{kind}");
        assert_eq!(b.get(1), a.get(1), "{kind}");
    }
    assert_ne!(a.value(), born);
    let s = scope.local(a.get(1).expect("slot")).cast::<Str>().expect("str");
    assert_eq!(s.to_string_lossy(), "shared");
}

#[cfg(feature = "test-util")]
#[test]
fn test_stale_address_reads_forwarding_header() {
    use nyaa_heap::test_util::is_forwarded;

    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let s = ObjectFactory::new(&heap)
        .new_string(&scope, "moved", AllocFlags::empty())
        .expect("string");
    let stale = s.address();

    heap.collect(CollectionKind::Minor).expect("minor");
    assert!(unsafe { is_forwarded(stale) });
    assert!(!unsafe { is_forwarded(s.address()) });
}

// ============================================================================
// Reclamation
// ============================================================================

#[test]
fn test_unreachable_young_objects_are_collected() {
    let heap = heap();
    let thread = heap.attach_thread();
    let factory = ObjectFactory::new(&heap);
    {
        let scope = HandleScope::new(&thread);
        for _ in 0..100 {
            factory
                .new_string(&scope, "garbage", AllocFlags::empty())
                .expect("string");
        }
    }
    let metrics = heap.collect(CollectionKind::Minor).expect("minor");
    assert_eq!(metrics.collection_type, CollectionType::Minor);
    assert_eq!(metrics.objects_collected, 100);
    assert!(metrics.bytes_collected > 0);
    assert_eq!(metrics.objects_surviving, 0);
    assert_eq!(heap.new_space().original().used(), 0);
}

#[test]
fn test_swept_memory_is_reused() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let dead = {
        let inner = HandleScope::new(&thread);
        factory
            .new_string(&inner, "dead", AllocFlags::OLD)
            .expect("dead")
            .address()
    };
    let live = factory
        .new_string(&scope, "live", AllocFlags::OLD)
        .expect("live");
    let used_before = heap.old_space().used_size();

    let metrics = heap.collect(CollectionKind::MarkSweep).expect("sweep");
    assert!(metrics.objects_collected > 0);
    assert!(metrics.bytes_collected > 0);
    assert!(heap.old_space().used_size() < used_before);
    assert_eq!(live.to_string_lossy(), "live");

    let again = factory
        .new_string(&scope, "anew", AllocFlags::OLD)
        .expect("again");
    assert_eq!(again.address(), dead);
    assert_eq!(heap.old_space().used_size(), used_before);
}

#[test]
fn test_dead_large_objects_are_released() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);
    let big = vec![7_u8; 512 * 1024];

    let kept = factory
        .new_string(&scope, &big, AllocFlags::empty())
        .expect("large");
    {
        let inner = HandleScope::new(&thread);
        factory
            .new_string(&inner, &big, AllocFlags::empty())
            .expect("large");
    }
    assert_eq!(heap.large_space().len(), 2);

    heap.collect(CollectionKind::MarkSweep).expect("sweep");
    assert_eq!(heap.large_space().len(), 1);
    assert_eq!(kept.len(), big.len());
    assert!(kept.to_bytes().iter().all(|&b| b == 7));
}

// ============================================================================
// Remembered set
// ============================================================================

#[test]
fn test_old_array_keeps_young_string_alive() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let array = factory.new_array(&scope, 1, AllocFlags::OLD).expect("array");
    let born = {
        let inner = HandleScope::new(&thread);
        let s = factory
            .new_string(&inner, "young", AllocFlags::empty())
            .expect("string");
        array.set(&heap, 0, s.value());
        s.address()
    };
    assert_eq!(heap.remembered_count(), 1);

    heap.collect(CollectionKind::Minor).expect("minor");
    let slot = array.get(0).expect("slot");
    let s = scope.local(slot).cast::<Str>().expect("str");
    assert_ne!(s.address(), born);
    assert!(heap.is_young(s.address()));
    assert_eq!(s.to_string_lossy(), "young");
    assert_eq!(heap.remembered_count(), 1);

    heap.collect(CollectionKind::Minor).expect("minor");
    let s = scope.local(array.get(0).expect("slot")).cast::<Str>().expect("str");
    assert!(heap.is_old(s.address()));
    assert_eq!(s.to_string_lossy(), "young");
    assert_eq!(heap.remembered_count(), 0);
}

#[test]
fn test_array_allocated_old_with_young_values() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let s = factory
        .new_string(&scope, "element", AllocFlags::empty())
        .expect("string");
    let array = factory
        .new_array_from(&scope, &[s.value(), Value::from_int(3)], AllocFlags::OLD)
        .expect("array");
    drop(s);
    assert_eq!(heap.remembered_count(), 1);

    heap.collect(CollectionKind::Minor).expect("minor");
    let s = scope.local(array.get(0).expect("slot")).cast::<Str>().expect("str");
    assert_eq!(s.to_string_lossy(), "element");
    assert_eq!(array.get(1), Some(Value::from_int(3)));
}

// ============================================================================
// Roots
// ============================================================================

#[test]
fn test_execution_stack_roots() {
    let heap = heap();
    let thread = heap.attach_thread();
    let factory = ObjectFactory::new(&heap);
    let mut stack = ExecutionStack::new();
    {
        let scope = HandleScope::new(&thread);
        let s = factory
            .new_string(&scope, "on the stack", AllocFlags::empty())
            .expect("string");
        stack.enter_frame();
        stack.push(Value::from_int(1));
        stack.push(s.value());
    }
    let before = stack.peek(0).expect("top");

    heap.collect_with(CollectionKind::Minor, &mut stack)
        .expect("minor");
    let after = stack.peek(0).expect("top");
    assert_ne!(after, before);

    let scope = HandleScope::new(&thread);
    let s = scope.local(after).cast::<Str>().expect("str");
    assert_eq!(s.to_string_lossy(), "on the stack");
    assert_eq!(stack.peek(1), Some(Value::from_int(1)));
}

#[test]
fn test_escaped_handle_outlives_child_scope() {
    let heap = heap();
    let thread = heap.attach_thread();
    let outer = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);
    let temp = Cell::new(Value::NIL);

    let kept = EscapableHandleScope::close_and_escape(&outer, |child| {
        let t = factory.new_string(child, "temp", AllocFlags::empty())?;
        temp.set(t.value());
        factory.new_string(child, "kept", AllocFlags::empty())
    })
    .expect("escape");
    let probe = factory
        .new_weak(&outer, temp.get(), AllocFlags::empty())
        .expect("weak");

    heap.collect(CollectionKind::Minor).expect("minor");
    assert_eq!(kept.to_string_lossy(), "kept");
    assert!(probe.is_cleared());
}

#[test]
fn test_persistent_outlives_scopes_until_dropped() {
    let heap = heap();
    let thread = heap.attach_thread();
    let factory = ObjectFactory::new(&heap);

    let persistent = {
        let scope = HandleScope::new(&thread);
        factory
            .new_string(&scope, "global", AllocFlags::empty())
            .expect("string")
            .to_persistent(&heap)
    };
    assert_eq!(heap.global_handles().len(), 1);

    heap.collect(CollectionKind::Minor).expect("minor");
    heap.collect(CollectionKind::Full).expect("full");

    let mut stack = ExecutionStack::new();
    {
        let scope = HandleScope::new(&thread);
        let s = persistent.to_local(&scope);
        assert_eq!(s.to_string_lossy(), "global");
        let probe = factory
            .new_weak(&scope, persistent.value(), AllocFlags::empty())
            .expect("weak");
        stack.push(probe.value());
    }

    drop(persistent);
    assert!(heap.global_handles().is_empty());
    heap.collect_with(CollectionKind::MarkSweep, &mut stack)
        .expect("sweep");

    let scope = HandleScope::new(&thread);
    let probe = scope
        .local(stack.peek(0).expect("probe"))
        .cast::<WeakRef>()
        .expect("weak");
    assert!(probe.is_cleared());
}

#[test]
fn test_persistent_slots_are_reused() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let local = scope.local(Value::from_int(5));

    let first = local.to_persistent(&heap);
    let capacity = heap.global_handles().capacity();
    first.dispose();
    let second = local.to_persistent(&heap);
    assert_eq!(heap.global_handles().capacity(), capacity);
    assert_eq!(second.value(), Value::from_int(5));
}

// ============================================================================
// Scheduling, metrics and reporting
// ============================================================================

struct Reentrant<'h> {
    heap: &'h Heap,
    result: Option<Result<(), GcError>>,
}

impl RootProvider for Reentrant<'_> {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {
        if self.result.is_none() {
            self.result = Some(self.heap.collect(CollectionKind::Minor).map(|_| ()));
        }
    }
}

#[test]
fn test_nested_collection_is_refused() {
    let heap = heap();
    let mut roots = Reentrant {
        heap: &heap,
        result: None,
    };
    heap.collect_with(CollectionKind::Minor, &mut roots)
        .expect("outer");
    assert_eq!(roots.result, Some(Err(GcError::Reentrant)));
    assert!(!heap.is_collecting());
}

#[test]
fn test_safepoint_follows_condition() {
    let heap = heap();
    assert_eq!(heap.collection_needed(), None);
    assert!(heap
        .safepoint(&mut NoRoots)
        .expect("safepoint")
        .is_none());

    heap.set_collect_condition(|_, _| Some(CollectionKind::MarkSweep));
    let metrics = heap
        .safepoint(&mut NoRoots)
        .expect("safepoint")
        .expect("collected");
    assert_eq!(metrics.collection_type, CollectionType::MarkSweep);
    assert_eq!(heap.last_gc_metrics().total_collections, 1);
}

#[test]
fn test_minor_trigger_from_usage() {
    let config = HeapConfig {
        new_space_size: nyaa_heap::config::MIN_NEW_SPACE_SIZE,
        ..HeapConfig::default()
    };
    let heap = Heap::new(config, Box::new(NullPrinter)).expect("heap");
    while heap.collection_needed().is_none() {
        heap.allocate(1024, AllocFlags::empty()).expect("allocate");
    }
    assert_eq!(heap.collection_needed(), Some(CollectionKind::Minor));
    heap.safepoint(&mut NoRoots).expect("safepoint");
    assert_eq!(heap.collection_needed(), None);
}

#[test]
fn test_printer_receives_one_line_per_cycle() {
    let printer = BufferPrinter::new();
    let heap = Heap::new(HeapConfig::default(), Box::new(printer.clone())).expect("heap");
    heap.collect(CollectionKind::Minor).expect("minor");
    heap.collect(CollectionKind::MarkCompact).expect("compact");

    let lines = printer.take();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("[gc #1] minor"), "{}", lines[0]);
    assert!(lines[1].starts_with("[gc #2] mark_compact"), "{}", lines[1]);
}

#[test]
fn test_metrics_are_recorded() {
    let heap = heap();
    let before = nyaa_heap::global_metrics().total_collections();
    let metrics = heap.collect(CollectionKind::Full).expect("full");
    assert_eq!(metrics.collection_type, CollectionType::Full);
    assert_eq!(heap.last_gc_metrics().collection_type, CollectionType::Full);
    assert!(metrics.mark_duration + metrics.sweep_duration <= metrics.duration);
    assert!(nyaa_heap::global_metrics().total_collections() > before);
}

// ============================================================================
// Failed cycles
// ============================================================================

#[test]
fn test_failed_promotion_is_undone() {
    let config = HeapConfig {
        old_space_limit: MIN_OLD_SPACE_LIMIT,
        ..HeapConfig::default()
    };
    let heap = Heap::new(config, Box::new(NullPrinter)).expect("heap");
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let tiny = factory
        .new_string(&scope, "tiny", AllocFlags::empty())
        .expect("string");
    let big: Vec<_> = (b'0'..b'4')
        .map(|fill| {
            factory
                .new_string(&scope, vec![fill; 1000], AllocFlags::empty())
                .expect("string")
        })
        .collect();
    heap.collect(CollectionKind::Minor).expect("minor");

    // Leave no room in old space for a big string.
    let size = heap.object_size(big[0].address()).expect("size");
    while heap.allocate(200 * 1024, AllocFlags::OLD).is_ok() {}
    while heap.allocate(size, AllocFlags::OLD).is_ok() {}

    let tiny_at = tiny.address();
    let big_at: Vec<usize> = big.iter().map(|s| s.address()).collect();
    let err = heap
        .collect(CollectionKind::Minor)
        .expect_err("promotion must fail");
    assert!(
        matches!(
            err,
            GcError::PromotionFailed(AllocError::OutOfMemory {
                space: SpaceKind::Old,
                ..
            })
        ),
        "{err}"
    );

    assert_eq!(tiny.address(), tiny_at);
    assert_eq!(tiny.to_string_lossy(), "tiny");
    for ((s, &addr), fill) in big.iter().zip(&big_at).zip(b'0'..) {
        assert_eq!(s.address(), addr);
        assert!(heap.is_young(addr));
        assert_eq!(s.to_bytes(), vec![fill; 1000]);
    }
    heap.old_space().verify();

    // Sweeping the unreachable filler makes room.
    heap.collect(CollectionKind::MarkSweep).expect("sweep");
    heap.collect(CollectionKind::Minor).expect("minor");
    assert!(heap.is_old(tiny.address()));
    assert_eq!(tiny.to_string_lossy(), "tiny");
    for (s, fill) in big.iter().zip(b'0'..) {
        assert!(heap.is_old(s.address()));
        assert_eq!(s.to_bytes(), vec![fill; 1000]);
    }
}
