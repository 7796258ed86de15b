//! Major collection, mark phase and in-place sweep.
//!
//! Marking paints every reachable old and large object with the heap's
//! finalize color. It uses an explicit stack, so deep object graphs cannot
//! overflow the native stack. Young objects are traced through but not
//! colored; a side set records which ones were reached.

use std::collections::HashSet;

use crate::class::ClassRegistry;
use crate::heap::{Heap, SpaceKind};
use crate::metrics::PhaseTimer;
use crate::object::{self, HeaderWord, HeapColor, HeapObject, Value};
use crate::roots::RootProvider;
use super::tracing::internal::{log_phase_end, log_phase_start, trace_phase, GcPhase};

use super::CycleStats;

pub(super) struct Marker<'h> {
    heap: &'h Heap,
    color: HeapColor,
    stack: Vec<usize>,
    /// Young objects reached by the mark.
    pub(super) young: HashSet<usize>,
    pub(super) marked_objects: usize,
    pub(super) marked_bytes: usize,
}

impl<'h> Marker<'h> {
    pub(super) fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            color: heap.finalize_color(),
            stack: Vec::new(),
            young: HashSet::new(),
            marked_objects: 0,
            marked_bytes: 0,
        }
    }

    fn mark_value(&mut self, value: Value) {
        let Some(addr) = value.object_address() else {
            return;
        };
        if self.heap.new_space.contains(addr) {
            if self.young.insert(addr) {
                self.stack.push(addr);
            }
            return;
        }
        if !matches!(
            self.heap.page_table.lookup(addr),
            Some(SpaceKind::Old | SpaceKind::Large)
        ) {
            return;
        }
        // SAFETY: references into old and large space point at live objects.
        let object = unsafe { HeapObject::from_address(addr) };
        let info = unsafe { object.type_info() };
        if info.color != Some(self.color) {
            unsafe { object.set_header(HeaderWord::Typed(info.with_color(Some(self.color)))) };
            self.stack.push(addr);
        }
    }

    /// Mark everything reachable from the roots.
    pub(super) fn mark_roots(&mut self, roots: &mut dyn RootProvider, classes: &ClassRegistry) {
        let mut pending = Vec::new();
        self.heap.visit_roots(roots, &mut |slot| pending.push(*slot));
        for value in pending {
            self.mark_value(value);
        }
        self.drain(classes);
    }

    fn drain(&mut self, classes: &ClassRegistry) {
        let mut children = Vec::new();
        while let Some(addr) = self.stack.pop() {
            let size = self
                .heap
                .object_size(addr)
                .unwrap_or_else(|| panic!("marked object {addr:#x} has no size"));
            if !self.young.contains(&addr) {
                self.marked_objects += 1;
                self.marked_bytes += size;
            }
            // SAFETY: addr was pushed as a live object.
            unsafe {
                object::visit_pointers(HeapObject::from_address(addr), size, classes, &mut |slot| {
                    children.push(*slot);
                });
            }
            for child in children.drain(..) {
                self.mark_value(child);
            }
        }
    }

    /// Returns `true` if `addr` is an old or large object the mark did not
    /// reach. Young and unknown addresses are never dead here.
    pub(super) fn is_dead(&self, addr: usize) -> bool {
        if !matches!(
            self.heap.page_table.lookup(addr),
            Some(SpaceKind::Old | SpaceKind::Large)
        ) {
            return false;
        }
        // SAFETY: old and large objects keep valid headers until freed.
        let info = unsafe { HeapObject::from_address(addr).type_info() };
        info.color != Some(self.color)
    }
}

/// Free every unmarked large object. Returns `(bytes, objects)`.
pub(super) fn sweep_large(heap: &Heap, marker: &Marker<'_>) -> (usize, usize) {
    let mut bytes = 0;
    let mut objects = 0;
    for (addr, _) in heap.large_space.objects() {
        if marker.is_dead(addr) {
            bytes += heap.large_space.free(addr);
            objects += 1;
        }
    }
    (bytes, objects)
}

/// Rebuild the remembered set from `keep`, which maps each host to its
/// address after the cycle or to `None` when it died.
pub(super) fn retain_remembered(heap: &Heap, mut keep: impl FnMut(usize) -> Option<usize>) {
    let mut remembered = heap.remembered.lock();
    *remembered = remembered.drain().filter_map(&mut keep).collect();
}

/// Run a mark-sweep collection.
pub(super) fn mark_sweep(heap: &Heap, roots: &mut dyn RootProvider, timer: &mut PhaseTimer) -> CycleStats {
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

    let stats = sweep(heap, &marker, timer);
    heap.swap_colors();
    stats
}

/// Clear dead weak slots and free every unmarked old and large object in
/// place. The caller swaps colors afterwards.
pub(super) fn sweep(heap: &Heap, marker: &Marker<'_>, timer: &mut PhaseTimer) -> CycleStats {
    let mut stats = CycleStats::default();

    // Weak slots are cleared while the dead targets still have headers.
    {
        let _phase = trace_phase(GcPhase::Weak);
        timer.start();
        let mut weak_objects = heap.weak_objects.lock();
        weak_objects.retain(|&addr| {
            if marker.is_dead(addr) {
                return false;
            }
            // SAFETY: surviving weak objects are live.
            let slot = object::weak_slot(unsafe { HeapObject::from_address(addr) });
            unsafe {
                if let Some(target) = (*slot).object_address() {
                    if marker.is_dead(target) {
                        *slot = Value::NIL;
                        stats.weak_cleared += 1;
                    }
                }
            }
            true
        });
        timer.end_weak();
    }

    {
        let _phase = trace_phase(GcPhase::Sweep);
        let before = heap.old_space.used_size();
        log_phase_start(GcPhase::Sweep, before);
        timer.start();
        retain_remembered(heap, |host| (!marker.is_dead(host)).then_some(host));
        let dead: Vec<(usize, usize)> = heap
            .old_space
            .live_objects()
            .into_iter()
            .filter(|&(addr, _)| marker.is_dead(addr))
            .collect();
        // Back to front, so each chunk merges with the one freed before it.
        for &(addr, _) in dead.iter().rev() {
            stats.bytes_collected += heap.old_space.free(addr, true);
        }
        stats.objects_collected += dead.len();
        stats.pages_released = heap.old_space.purge_if_needed();

        let (bytes, objects) = sweep_large(heap, marker);
        stats.bytes_collected += bytes;
        stats.objects_collected += objects;
        timer.end_sweep();
        log_phase_end(GcPhase::Sweep, stats.bytes_collected);
    }

    stats.bytes_surviving = marker.marked_bytes;
    stats.objects_surviving = marker.marked_objects;
    stats
}
