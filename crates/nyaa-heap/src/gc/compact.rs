//! Major collection with evacuation of old space.
//!
//! After marking, every live old page is detached and each marked object on
//! it is copied into a fresh page. The originals get forwarding headers and
//! an address map is kept, so every reference (roots, old copies, marked
//! large and young objects, remembered hosts) can be rewritten. Weak slots
//! are resolved last, against the new addresses, and only then are the
//! evacuated pages released.
//!
//! When old space runs out of pages mid-evacuation, every copy is undone and
//! the cycle finishes as an in-place sweep before the error is reported.

use std::collections::HashMap;
use std::ptr;

use crate::error::{AllocError, GcError};
use crate::heap::Heap;
use crate::metrics::PhaseTimer;
use crate::object::{self, HeapObject, Value};
use crate::roots::RootProvider;
use super::tracing::internal::{log_phase_end, log_phase_start, trace_phase, GcPhase};

use super::marking::{retain_remembered, sweep, sweep_large, Marker};
use super::CycleStats;

/// Run a mark-compact collection.
pub(super) fn mark_compact(
    heap: &Heap,
    roots: &mut dyn RootProvider,
    timer: &mut PhaseTimer,
) -> Result<CycleStats, GcError> {
    let mut stats = CycleStats::default();
    let classes = heap.classes.read();
    let mut marker = Marker::new(heap);

    {
        let _phase = trace_phase(GcPhase::Mark);
        log_phase_start(GcPhase::Mark, heap.old_space.used_size());
        timer.start();
        marker.mark_roots(roots, &classes);
        timer.end_mark();
        log_phase_end(GcPhase::Mark, 0);
    }

    let _phase = trace_phase(GcPhase::Compact);
    let before = heap.old_space.used_size();
    log_phase_start(GcPhase::Compact, before);
    timer.start();

    let forwarding = match evacuate(heap, &marker, &mut stats) {
        Ok(forwarding) => forwarding,
        Err(err) => {
            timer.end_sweep();
            let swept = sweep(heap, &marker, timer);
            log_phase_end(GcPhase::Compact, swept.bytes_collected);
            heap.swap_colors();
            return Err(GcError::CompactionFailed(err));
        }
    };

    // Rewrite every strong reference.
    let mut relocate = |slot: &mut Value| {
        if let Some(&to) = slot.object_address().and_then(|addr| forwarding.get(&addr)) {
            // SAFETY: forwarding targets are complete copies.
            *slot = Value::from_object(unsafe { HeapObject::from_address(to) });
        }
    };
    heap.visit_roots(roots, &mut relocate);
    let mut survivors: Vec<(usize, usize)> = heap.old_space.live_objects();
    survivors.extend(
        heap.large_space
            .objects()
            .into_iter()
            .filter(|&(addr, _)| !marker.is_dead(addr)),
    );
    for &addr in &marker.young {
        if let Some(size) = heap.object_size(addr) {
            survivors.push((addr, size));
        }
    }
    for (addr, size) in survivors {
        // SAFETY: every survivor is a live, non-forwarded object.
        unsafe {
            object::visit_pointers(HeapObject::from_address(addr), size, &classes, &mut relocate);
        }
    }
    timer.end_sweep();

    // Resolve weak slots against the new addresses, while dead objects on
    // the evacuated pages still have their headers.
    {
        let _phase = trace_phase(GcPhase::Weak);
        timer.start();
        let mut weak_objects = heap.weak_objects.lock();
        weak_objects.retain_mut(|addr| {
            if let Some(&to) = forwarding.get(addr) {
                *addr = to;
            } else if heap.old_space.is_evacuating(*addr) || marker.is_dead(*addr) {
                return false;
            }
            // SAFETY: surviving weak objects are live.
            let slot = object::weak_slot(unsafe { HeapObject::from_address(*addr) });
            unsafe {
                if let Some(target) = (*slot).object_address() {
                    if let Some(&to) = forwarding.get(&target) {
                        *slot = Value::from_object(HeapObject::from_address(to));
                    } else if heap.old_space.is_evacuating(target) || marker.is_dead(target) {
                        *slot = Value::NIL;
                        stats.weak_cleared += 1;
                    }
                }
            }
            true
        });
        timer.end_weak();
    }

    timer.start();
    retain_remembered(heap, |host| {
        forwarding
            .get(&host)
            .copied()
            .or_else(|| (!heap.old_space.is_evacuating(host) && !marker.is_dead(host)).then_some(host))
    });
    stats.pages_released = heap.old_space.release_evacuated();
    let (bytes, objects) = sweep_large(heap, &marker);
    stats.bytes_collected += bytes;
    stats.objects_collected += objects;
    timer.end_sweep();
    log_phase_end(GcPhase::Compact, stats.bytes_collected);

    stats.bytes_surviving = marker.marked_bytes;
    stats.objects_surviving = marker.marked_objects;
    heap.swap_colors();
    Ok(stats)
}

/// Copy every marked object off the detached pages. Dead objects are counted
/// into `stats`. On failure the evacuation is undone and the pages are live
/// again, exactly as marked.
fn evacuate(
    heap: &Heap,
    marker: &Marker<'_>,
    stats: &mut CycleStats,
) -> Result<HashMap<usize, usize>, AllocError> {
    heap.old_space.detach_live_pages();
    let mut forwarding: HashMap<usize, usize> = HashMap::new();
    for (addr, size) in heap.old_space.evacuating_objects() {
        if marker.is_dead(addr) {
            stats.objects_collected += 1;
            stats.bytes_collected += size;
            continue;
        }
        let target = match heap.old_space.allocate(size) {
            Ok(target) => target,
            Err(err) => {
                undo_evacuation(heap, &forwarding);
                return Err(err);
            }
        };
        let copy = HeapObject::from_ptr(target);
        // SAFETY: distinct allocations of at least `size` bytes; the mutators
        // are stopped.
        unsafe {
            let original = HeapObject::from_address(addr);
            ptr::copy_nonoverlapping(original.as_ptr(), copy.as_ptr(), size);
            original.forward_to(copy);
        }
        forwarding.insert(addr, copy.address());
    }
    Ok(forwarding)
}

/// Give every original its header back, free the copies and return the
/// detached pages to the live ring. No reference has been rewritten yet.
fn undo_evacuation(heap: &Heap, forwarding: &HashMap<usize, usize>) {
    for (&from, &to) in forwarding {
        // SAFETY: `to` is a byte copy of `from` taken before `from` was
        // forwarded, so its header is the original one.
        unsafe {
            let header = HeapObject::from_address(to).header();
            HeapObject::from_address(from).set_header(header);
        }
        heap.old_space.free(to, true);
    }
    heap.old_space.reattach_evacuating();
}
