//! Weak reference behaviour under every collector.

use nyaa_heap::{
    AllocFlags, CollectionKind, HandleScope, Heap, HeapConfig, Local, NullPrinter, ObjectFactory,
    Str, Value, WeakRef,
};

fn heap() -> Heap {
    Heap::new(HeapConfig::default(), Box::new(NullPrinter)).expect("heap")
}

fn target_str<'s>(scope: &'s HandleScope<'_>, weak: Local<'_, WeakRef>) -> Option<Local<'s, Str>> {
    scope.local(weak.target()).cast::<Str>()
}

// ============================================================================
// Minor
// ============================================================================

#[test]
fn test_minor_follows_live_target() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let s = factory
        .new_string(&scope, "kept", AllocFlags::empty())
        .expect("string");
    let weak = factory
        .new_weak(&scope, s.value(), AllocFlags::empty())
        .expect("weak");
    assert_eq!(heap.weak_count(), 1);

    let metrics = heap.collect(CollectionKind::Minor).expect("minor");
    assert_eq!(metrics.weak_cleared, 0);
    assert_eq!(weak.target(), s.value());
    let target = target_str(&scope, weak).expect("target");
    assert_eq!(target.to_string_lossy(), "kept");
}

#[test]
fn test_minor_clears_dead_target() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let target = {
        let inner = HandleScope::new(&thread);
        factory
            .new_string(&inner, "gone", AllocFlags::empty())
            .expect("string")
            .value()
    };
    let weak = factory
        .new_weak(&scope, target, AllocFlags::empty())
        .expect("weak");

    let metrics = heap.collect(CollectionKind::Minor).expect("minor");
    assert_eq!(metrics.weak_cleared, 1);
    assert!(weak.is_cleared());
    assert_eq!(weak.target(), Value::NIL);
}

#[test]
fn test_dead_weak_objects_are_dropped() {
    let heap = heap();
    let thread = heap.attach_thread();
    let factory = ObjectFactory::new(&heap);
    {
        let scope = HandleScope::new(&thread);
        for _ in 0..10 {
            factory
                .new_weak(&scope, Value::from_int(1), AllocFlags::empty())
                .expect("weak");
        }
    }
    assert_eq!(heap.weak_count(), 10);
    heap.collect(CollectionKind::Minor).expect("minor");
    assert_eq!(heap.weak_count(), 0);
}

#[test]
fn test_non_object_target_is_untouched() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let weak = ObjectFactory::new(&heap)
        .new_weak(&scope, Value::from_int(42), AllocFlags::empty())
        .expect("weak");

    for kind in [CollectionKind::Minor, CollectionKind::MarkSweep, CollectionKind::MarkCompact] {
        heap.collect(kind).expect("collect");
        assert_eq!(weak.target(), Value::from_int(42), "{kind}");
    }
}

// ============================================================================
// Major
// ============================================================================

#[test]
fn test_mark_sweep_clears_unreachable_old_target() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let kept = factory
        .new_string(&scope, "kept", AllocFlags::OLD)
        .expect("kept");
    let dropped = {
        let inner = HandleScope::new(&thread);
        factory
            .new_string(&inner, "dropped", AllocFlags::OLD)
            .expect("dropped")
            .value()
    };
    let to_kept = factory
        .new_weak(&scope, kept.value(), AllocFlags::OLD)
        .expect("weak");
    let to_dropped = factory
        .new_weak(&scope, dropped, AllocFlags::OLD)
        .expect("weak");

    let metrics = heap.collect(CollectionKind::MarkSweep).expect("sweep");
    assert_eq!(metrics.weak_cleared, 1);
    assert!(to_dropped.is_cleared());
    assert_eq!(to_kept.target(), kept.value());
    assert_eq!(heap.weak_count(), 2);
}

#[test]
fn test_young_weak_to_old_target() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let dropped = {
        let inner = HandleScope::new(&thread);
        factory
            .new_string(&inner, "old", AllocFlags::OLD)
            .expect("string")
            .value()
    };
    let weak = factory
        .new_weak(&scope, dropped, AllocFlags::empty())
        .expect("weak");

    // A scavenge never inspects old targets.
    heap.collect(CollectionKind::Minor).expect("minor");
    assert_eq!(weak.target(), dropped);

    heap.collect(CollectionKind::MarkSweep).expect("sweep");
    assert!(weak.is_cleared());
}

#[test]
fn test_mark_compact_follows_moved_target() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let kept = factory
        .new_string(&scope, "moved", AllocFlags::OLD)
        .expect("kept");
    let dropped = {
        let inner = HandleScope::new(&thread);
        factory
            .new_string(&inner, "dropped", AllocFlags::OLD)
            .expect("dropped")
            .value()
    };
    let to_kept = factory
        .new_weak(&scope, kept.value(), AllocFlags::OLD)
        .expect("weak");
    let to_dropped = factory
        .new_weak(&scope, dropped, AllocFlags::OLD)
        .expect("weak");
    let weak_before = to_kept.address();
    let kept_before = kept.address();

    let metrics = heap.collect(CollectionKind::MarkCompact).expect("compact");
    assert_eq!(metrics.weak_cleared, 1);
    assert_ne!(kept.address(), kept_before);
    assert_ne!(to_kept.address(), weak_before);
    assert_eq!(to_kept.target(), kept.value());
    assert!(to_dropped.is_cleared());

    let target = target_str(&scope, to_kept).expect("target");
    assert_eq!(target.to_string_lossy(), "moved");
    assert_eq!(heap.weak_count(), 2);
}

#[test]
fn test_full_collection_resolves_young_targets() {
    let heap = heap();
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let kept = factory
        .new_string(&scope, "young", AllocFlags::empty())
        .expect("kept");
    let weak = factory
        .new_weak(&scope, kept.value(), AllocFlags::OLD)
        .expect("weak");

    heap.collect(CollectionKind::Full).expect("full");
    assert_eq!(weak.target(), kept.value());
    assert_eq!(
        target_str(&scope, weak).expect("target").to_string_lossy(),
        "young"
    );
}
