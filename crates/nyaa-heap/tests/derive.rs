//! Client payloads described with `#[derive(Visit)]`.

#![cfg(feature = "derive")]

use nyaa_heap::{
    AllocFlags, CollectionKind, HandleScope, Heap, HeapConfig, NullPrinter, ObjectFactory, Str,
    Value, Visit,
};

#[derive(Clone, Copy, Visit)]
#[repr(C)]
struct Pair {
    head: Value,
    tail: Value,
    count: u64,
}

#[derive(Clone, Copy, Visit)]
#[repr(C)]
struct Frame {
    slots: [Value; 3],
    pair: Pair,
}

#[derive(Clone, Copy, Visit)]
enum Cell {
    Empty,
    Full(Value),
    Linked { value: Value, next: Value },
}

fn heap() -> Heap {
    Heap::new(HeapConfig::default(), Box::new(NullPrinter)).expect("heap")
}

fn string_at(scope: &HandleScope<'_>, value: Value) -> String {
    scope
        .local(value)
        .cast::<Str>()
        .expect("str")
        .to_string_lossy()
}

#[test]
fn test_derived_fields_are_traced() {
    let heap = heap();
    let pair_class = heap.register_type::<Pair>("Pair").expect("class");
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let instance = {
        let inner = HandleScope::new(&thread);
        let head = factory
            .new_string(&inner, "head", AllocFlags::empty())
            .expect("head");
        let tail = factory
            .new_string(&inner, "tail", AllocFlags::empty())
            .expect("tail");
        let pair = Pair {
            head: head.value(),
            tail: tail.value(),
            count: 2,
        };
        factory
            .new_instance(&inner, pair_class, pair, AllocFlags::empty())
            .expect("instance")
            .value()
    };
    let instance = scope
        .local(instance)
        .cast::<nyaa_heap::Instance>()
        .expect("instance");

    for kind in [CollectionKind::Minor, CollectionKind::Minor, CollectionKind::MarkCompact] {
        heap.collect(kind).expect("collect");
        let pair = instance.read::<Pair>(&heap).expect("payload");
        assert_eq!(pair.count, 2);
        assert_eq!(string_at(&scope, pair.head), "head", "{kind}");
        assert_eq!(string_at(&scope, pair.tail), "tail", "{kind}");
    }
    assert_eq!(instance.class(), pair_class);
}

#[test]
fn test_nested_payload() {
    let heap = heap();
    let class = heap.register_type::<Frame>("Frame").expect("class");
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let names = ["a", "b", "c", "d"];
    let frame = {
        let inner = HandleScope::new(&thread);
        let mut values = names.iter().map(|name| {
            factory
                .new_string(&inner, name, AllocFlags::empty())
                .expect("string")
                .value()
        });
        let frame = Frame {
            slots: [
                values.next().expect("a"),
                values.next().expect("b"),
                values.next().expect("c"),
            ],
            pair: Pair {
                head: values.next().expect("d"),
                tail: Value::from_int(-1),
                count: 0,
            },
        };
        factory
            .new_instance(&inner, class, frame, AllocFlags::OLD)
            .expect("instance")
            .value()
    };
    let frame = scope
        .local(frame)
        .cast::<nyaa_heap::Instance>()
        .expect("instance");
    assert_eq!(heap.remembered_count(), 1);

    heap.collect(CollectionKind::Minor).expect("minor");
    heap.collect(CollectionKind::Full).expect("full");

    let payload = frame.read::<Frame>(&heap).expect("payload");
    for (slot, name) in payload.slots.iter().zip(names) {
        assert_eq!(string_at(&scope, *slot), name);
    }
    assert_eq!(string_at(&scope, payload.pair.head), "d");
    assert_eq!(payload.pair.tail, Value::from_int(-1));
    assert!(frame.read::<Pair>(&heap).is_none());
}

#[test]
fn test_enum_payload_variants() {
    let heap = heap();
    let class = heap.register_type::<Cell>("Cell").expect("class");
    let thread = heap.attach_thread();
    let scope = HandleScope::new(&thread);
    let factory = ObjectFactory::new(&heap);

    let first = factory
        .new_string(&scope, "first", AllocFlags::empty())
        .expect("first");
    let cell = factory
        .new_instance(&scope, class, Cell::Full(first.value()), AllocFlags::empty())
        .expect("cell");

    heap.collect(CollectionKind::Minor).expect("minor");
    match cell.read::<Cell>(&heap).expect("payload") {
        Cell::Full(value) => assert_eq!(string_at(&scope, value), "first"),
        _ => panic!("variant changed"),
    }

    let second = factory
        .new_string(&scope, "second", AllocFlags::empty())
        .expect("second");
    assert!(cell.write(
        &heap,
        Cell::Linked {
            value: second.value(),
            next: cell.value(),
        },
    ));
    heap.collect(CollectionKind::Minor).expect("minor");
    match cell.read::<Cell>(&heap).expect("payload") {
        Cell::Linked { value, next } => {
            assert_eq!(string_at(&scope, value), "second");
            assert_eq!(next, cell.value());
        }
        _ => panic!("variant changed"),
    }

    assert!(cell.write(&heap, Cell::Empty));
    assert!(matches!(cell.read::<Cell>(&heap), Some(Cell::Empty)));
}

#[test]
fn test_manual_visit_matches_derive() {
    let mut pair = Pair {
        head: Value::from_int(1),
        tail: Value::from_int(2),
        count: 9,
    };
    let mut seen = Vec::new();
    pair.visit_values(&mut |slot| seen.push(*slot));
    assert_eq!(seen, vec![Value::from_int(1), Value::from_int(2)]);
}
