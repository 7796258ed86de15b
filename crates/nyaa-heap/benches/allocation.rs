//! Benchmark: allocation throughput and collection pause times.
//!
//! Measures bump allocation in the young generation, free-list allocation in
//! old space, the cost of each collector on a typical object graph, and the
//! bytecode word codec.

use bumpalo::Bump;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use nyaa_heap::bytecode::{decode_stream, encode_stream, BytecodeNode, Opcode};
use nyaa_heap::{
    AllocFlags, CollectionKind, ExecutionStack, HandleScope, Heap, HeapConfig, NullPrinter,
    ObjectFactory,
};
use std::hint::black_box;
use std::time::Duration;

fn new_heap() -> Heap {
    Heap::new(HeapConfig::default(), Box::new(NullPrinter)).expect("heap")
}

/// Allocate `count` strings with every fourth one pushed onto `stack`.
fn populate(heap: &Heap, stack: &mut ExecutionStack, count: usize, flags: AllocFlags) {
    let thread = heap.attach_thread();
    let factory = ObjectFactory::new(heap);
    let scope = HandleScope::new(&thread);
    for i in 0..count {
        let s = factory
            .new_string(&scope, format!("object {i}"), flags)
            .expect("string");
        if i % 4 == 0 {
            stack.push(s.value());
        }
    }
}

fn bench_young_allocation(c: &mut Criterion) {
    c.bench_function("young_allocate_10000", |b| {
        b.iter_batched(
            new_heap,
            |heap| {
                for _ in 0..10_000 {
                    black_box(heap.allocate(48, AllocFlags::empty()).expect("allocate"));
                }
                heap
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_old_allocation(c: &mut Criterion) {
    c.bench_function("old_allocate_10000", |b| {
        b.iter_batched(
            new_heap,
            |heap| {
                for i in 0..10_000 {
                    let size = 16 + 8 * (i % 32);
                    black_box(heap.allocate(size, AllocFlags::OLD).expect("allocate"));
                }
                heap
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_collection(c: &mut Criterion, name: &str, kind: CollectionKind, flags: AllocFlags) {
    c.bench_function(name, |b| {
        b.iter_batched(
            || {
                let heap = new_heap();
                let mut stack = ExecutionStack::new();
                populate(&heap, &mut stack, 10_000, flags);
                (heap, stack)
            },
            |(heap, mut stack)| {
                black_box(heap.collect_with(kind, &mut stack).expect("collect"));
                (heap, stack)
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_minor(c: &mut Criterion) {
    bench_collection(c, "minor_10000_objects", CollectionKind::Minor, AllocFlags::empty());
}

fn bench_mark_sweep(c: &mut Criterion) {
    bench_collection(c, "mark_sweep_10000_objects", CollectionKind::MarkSweep, AllocFlags::OLD);
}

fn bench_mark_compact(c: &mut Criterion) {
    bench_collection(
        c,
        "mark_compact_10000_objects",
        CollectionKind::MarkCompact,
        AllocFlags::OLD,
    );
}

fn bench_bytecode(c: &mut Criterion) {
    let program: Vec<BytecodeNode> = (0..1000)
        .map(|i| match i % 4 {
            0 => BytecodeNode::ab(Opcode::LoadImm, i % 16, i * 37),
            1 => BytecodeNode::ab(Opcode::Add, i % 16, (i + 1) % 16),
            2 => BytecodeNode::a(Opcode::Jump, -i),
            _ => BytecodeNode::n(Opcode::Nop),
        })
        .collect::<Result<_, _>>()
        .expect("program");
    let words = encode_stream(&program);

    c.bench_function("bytecode_encode_1000", |b| {
        b.iter(|| black_box(encode_stream(black_box(&program))));
    });
    c.bench_function("bytecode_decode_1000", |b| {
        b.iter(|| {
            let arena = Bump::new();
            black_box(decode_stream(&arena, black_box(&words)).expect("decode").len())
        });
    });
}

criterion_group!(
    name = allocation;
    config = Criterion::default()
        .sample_size(30)
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(2));
    targets =
        bench_young_allocation,
        bench_old_allocation,
        bench_minor,
        bench_mark_sweep,
        bench_mark_compact,
        bench_bytecode,
);

criterion_main!(allocation);
