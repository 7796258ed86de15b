//! Young generation allocation: bump order, iteration and concurrent
//! mutators.

use std::collections::BTreeMap;

use nyaa_heap::heap::NewSpace;
use nyaa_heap::{AllocFlags, Heap, HeapConfig, NullPrinter};
use sys_alloc::OsAllocator;

const MIB: usize = 1024 * 1024;

#[test]
fn test_walk_returns_every_allocation_in_order() {
    let space = NewSpace::new(&OsAllocator, 10 * MIB).expect("map");
    let size = 16 * 1024;
    let mut expected = Vec::new();
    for tag in 0..630_u64 {
        let ptr = space.allocate(size).expect("allocate");
        // SAFETY: the allocation is `size` bytes and nobody else sees it.
        unsafe { ptr.cast::<u64>().as_ptr().write(tag) };
        expected.push(ptr.as_ptr() as usize);
    }

    let walked: Vec<(usize, usize)> = space.original().iter().collect();
    assert_eq!(walked.len(), 630);
    for (i, &(addr, len)) in walked.iter().enumerate() {
        assert_eq!(addr, expected[i]);
        assert_eq!(len, size);
        // SAFETY: every walked address is one of our allocations.
        let tag = unsafe { (addr as *const u64).read() };
        assert_eq!(tag, i as u64);
    }
    assert_eq!(space.original().used(), 630 * size);
}

#[test]
fn test_bump_allocation_is_contiguous() {
    let space = NewSpace::new(&OsAllocator, MIB).expect("map");
    let first = space.allocate(32).expect("first").as_ptr() as usize;
    let second = space.allocate(64).expect("second").as_ptr() as usize;
    let third = space.allocate(16).expect("third").as_ptr() as usize;
    assert_eq!(first, space.original().chunk());
    assert_eq!(second, first + 32);
    assert_eq!(third, second + 64);
    assert_eq!(space.original().top(), third + 16);
    assert!(space.contains(second));
    assert!(!space.contains(third + 16));
}

#[test]
fn test_exhaustion_and_flip() {
    let space = NewSpace::new(&OsAllocator, MIB).expect("map");
    let original = space.original().chunk();
    while space.allocate(4096).is_ok() {}
    assert_eq!(space.original().available(), 0);
    assert!(space.allocate(16).is_err());

    space.flip(true);
    assert_ne!(space.original().chunk(), original);
    assert_eq!(space.survive().chunk(), original);
    assert_eq!(space.survive().used(), 0);
    assert!(space.allocate(16).is_ok());
}

#[test]
fn test_concurrent_allocation_is_disjoint() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 2000;

    let heap = Heap::new(HeapConfig::default(), Box::new(NullPrinter)).expect("heap");
    let ranges: Vec<Vec<(usize, usize)>> = crossbeam::thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let heap = &heap;
                s.spawn(move |_| {
                    (0..PER_THREAD)
                        .map(|i| {
                            let size = 16 + 8 * ((t + i) % 8);
                            let ptr = heap.allocate(size, AllocFlags::empty()).expect("allocate");
                            (ptr.as_ptr() as usize, size)
                        })
                        .collect()
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker"))
            .collect()
    })
    .expect("scope");

    let mut all = BTreeMap::new();
    for (addr, size) in ranges.into_iter().flatten() {
        assert!(heap.is_young(addr));
        assert!(all.insert(addr, size).is_none(), "{addr:#x} handed out twice");
    }
    assert_eq!(all.len(), THREADS * PER_THREAD);

    let mut end = 0;
    for (&addr, &size) in &all {
        assert!(addr >= end, "{addr:#x} overlaps the previous allocation");
        end = addr + size;
    }
    assert_eq!(heap.new_space().original().iter().count(), THREADS * PER_THREAD);
}
