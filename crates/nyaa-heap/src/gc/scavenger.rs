//! Minor collection: Cheney copy of the young generation.
//!
//! Live young objects are copied breadth-first into the survive area, or into
//! old space once they reach the promotion age. Each copied object leaves a
//! forwarding header behind, so a second reference to it is redirected
//! instead of copied again. Old and large objects are not traced; the
//! remembered set supplies the old-to-young edges.
//!
//! A cycle that cannot place a copy is undone: every original gets its
//! header back, every rewritten root and remembered slot points at the
//! original again, and the copies are released. The young generation is
//! left exactly as before the cycle.

use std::collections::{HashMap, HashSet};
use std::ptr;

use crate::class::ClassRegistry;
use crate::error::GcError;
use crate::heap::{Heap, SemiSpace, SpaceKind};
use crate::metrics::PhaseTimer;
use crate::object::{self, HeaderWord, HeapObject, TypeInfo, Value};
use crate::roots::RootProvider;
use super::tracing::internal::{log_phase_end, log_phase_start, trace_phase, GcPhase};

use super::CycleStats;

struct Scavenger<'h> {
    heap: &'h Heap,
    from: &'h SemiSpace,
    to: &'h SemiSpace,
    promotion_age: u8,
    /// Promoted copies not yet scanned.
    promoted: Vec<usize>,
    /// Every copy made so far with the original's type word.
    copies: Vec<(HeapObject, HeapObject, TypeInfo)>,
    /// Old hosts that still reference young objects after the cycle.
    remembered: HashSet<usize>,
    error: Option<GcError>,
    stats: CycleStats,
}

impl<'h> Scavenger<'h> {
    /// Redirect `slot` to the copy of its young target, copying the target
    /// first if needed. Returns `true` if the slot now references the
    /// survive area.
    fn evacuate(&mut self, slot: &mut Value) -> bool {
        let Some(addr) = slot.object_address() else {
            return false;
        };
        if !self.from.contains(addr) {
            return self.to.contains(addr);
        }
        // SAFETY: addresses below the cursor of the original area are objects.
        let object = unsafe { HeapObject::from_address(addr) };
        match unsafe { object.header() } {
            HeaderWord::Forwarded(to) => {
                // SAFETY: forwarding addresses point at complete copies.
                *slot = Value::from_object(unsafe { HeapObject::from_address(to) });
                self.to.contains(to)
            }
            HeaderWord::Typed(info) => {
                if self.error.is_some() {
                    return false;
                }
                let size = self.from.allocated_size(addr);
                match self.copy(object, info, size) {
                    Ok(copy) => {
                        *slot = Value::from_object(copy);
                        self.to.contains(copy.address())
                    }
                    Err(err) => {
                        self.error = Some(err);
                        false
                    }
                }
            }
        }
    }

    fn copy(&mut self, object: HeapObject, info: TypeInfo, size: usize) -> Result<HeapObject, GcError> {
        let promote = info.age >= self.promotion_age;
        let (target, header) = if promote {
            let target = self
                .heap
                .old_space
                .allocate(size)
                .map_err(GcError::PromotionFailed)?;
            (target, info.with_color(Some(self.heap.initialize_color())))
        } else {
            let target = self
                .to
                .acquire_space(size)
                .ok_or(GcError::SurvivorOverflow { requested: size })?;
            (target, info.with_age(info.age + 1))
        };

        let copy = HeapObject::from_ptr(target);
        // SAFETY: both ranges are `size` bytes of distinct allocations.
        unsafe {
            ptr::copy_nonoverlapping(object.as_ptr(), copy.as_ptr(), size);
            copy.set_header(HeaderWord::Typed(header));
            object.forward_to(copy);
        }

        self.copies.push((object, copy, info));
        self.stats.objects_surviving += 1;
        self.stats.bytes_surviving += size;
        if promote {
            self.stats.bytes_promoted += size;
            self.promoted.push(copy.address());
        }
        Ok(copy)
    }

    /// Evacuate every strong slot of `object`. Returns `true` if any slot
    /// still references the young generation afterwards.
    fn scan_object(&mut self, object: HeapObject, size: usize, classes: &ClassRegistry) -> bool {
        let mut young = false;
        // SAFETY: the object is live and the mutators are stopped.
        unsafe {
            object::visit_pointers(object, size, classes, &mut |slot| {
                young |= self.evacuate(slot);
            });
        }
        young
    }

    fn old_object_size(&self, addr: usize) -> usize {
        match self.heap.page_table.lookup(addr) {
            Some(SpaceKind::Old) => self.heap.old_space.allocated_size(addr),
            Some(SpaceKind::Large) => self.heap.large_space.object_size(addr).unwrap_or_else(|| {
                panic!("remembered large object {addr:#x} is gone")
            }),
            other => panic!("remembered host {addr:#x} in {other:?}"),
        }
    }

    /// Scan copies in the survive area and promoted copies until both are
    /// exhausted.
    fn process(&mut self, classes: &ClassRegistry) {
        let mut scan = self.to.chunk();
        loop {
            while scan < self.to.top() && self.error.is_none() {
                let size = self.to.allocated_size(scan);
                // SAFETY: every allocation in the survive area is a copy.
                let object = unsafe { HeapObject::from_address(scan) };
                self.scan_object(object, size, classes);
                scan += size;
            }
            if self.error.is_some() {
                return;
            }
            let Some(addr) = self.promoted.pop() else {
                return;
            };
            let size = self.heap.old_space.allocated_size(addr);
            // SAFETY: promoted copies are complete objects.
            let object = unsafe { HeapObject::from_address(addr) };
            if self.scan_object(object, size, classes) {
                self.remembered.insert(addr);
            }
        }
    }

    /// Undo every copy made this cycle. `hosts` are the remembered hosts the
    /// cycle drained; they are remembered again.
    fn undo(&mut self, roots: &mut dyn RootProvider, hosts: &[usize], classes: &ClassRegistry) {
        let originals: HashMap<usize, usize> = self
            .copies
            .iter()
            .map(|(original, copy, _)| (copy.address(), original.address()))
            .collect();
        let mut restore = |slot: &mut Value| {
            if let Some(&original) = slot.object_address().and_then(|addr| originals.get(&addr)) {
                // SAFETY: originals keep their bodies until the area is purged.
                *slot = Value::from_object(unsafe { HeapObject::from_address(original) });
            }
        };
        self.heap.visit_roots(roots, &mut restore);
        for &host in hosts {
            let size = self.old_object_size(host);
            // SAFETY: remembered hosts are live old or large objects.
            unsafe {
                object::visit_pointers(HeapObject::from_address(host), size, classes, &mut restore);
            }
        }

        for (original, copy, info) in self.copies.drain(..) {
            // SAFETY: the original was forwarded by this cycle; its body is
            // untouched.
            unsafe { original.set_header(HeaderWord::Typed(info)) };
            if !self.to.contains(copy.address()) {
                self.heap.old_space.free(copy.address(), true);
            }
        }
        self.to.purge();
        self.promoted.clear();
        self.remembered.clear();
        self.heap.remembered.lock().extend(hosts.iter().copied());
    }

    /// Follow or clear every weak slot that points into the original area,
    /// and drop weak objects that died.
    fn purge_weak_objects(&mut self) {
        let mut weak_objects = self.heap.weak_objects.lock();
        let from = self.from;
        let mut cleared = 0;
        weak_objects.retain_mut(|addr| {
            if from.contains(*addr) {
                // SAFETY: registered weak objects are allocated objects.
                match unsafe { HeapObject::from_address(*addr).header() } {
                    HeaderWord::Forwarded(to) => *addr = to,
                    HeaderWord::Typed(_) => return false,
                }
            }
            // SAFETY: `addr` is a live weak reference object.
            let slot = object::weak_slot(unsafe { HeapObject::from_address(*addr) });
            unsafe {
                if let Some(target) = (*slot).object_address() {
                    if from.contains(target) {
                        match HeapObject::from_address(target).header() {
                            HeaderWord::Forwarded(to) => {
                                *slot = Value::from_object(HeapObject::from_address(to));
                            }
                            HeaderWord::Typed(_) => {
                                *slot = Value::NIL;
                                cleared += 1;
                            }
                        }
                    }
                }
            }
            true
        });
        self.stats.weak_cleared += cleared;
    }
}

/// Run a minor collection.
pub(super) fn scavenge(
    heap: &Heap,
    roots: &mut dyn RootProvider,
    timer: &mut PhaseTimer,
) -> Result<CycleStats, GcError> {
    let stats = evacuate_young(heap, heap.new_space.survive(), roots, timer)?;
    timer.start();
    heap.new_space.flip(true);
    timer.end_sweep();
    Ok(stats)
}

/// Copy the live objects of the original area into `to` or old space, fix
/// up weak slots and rebuild the remembered set. The caller flips.
fn evacuate_young(
    heap: &Heap,
    to: &SemiSpace,
    roots: &mut dyn RootProvider,
    timer: &mut PhaseTimer,
) -> Result<CycleStats, GcError> {
    let from = heap.new_space.original();
    debug_assert_eq!(to.used(), 0, "survive area not purged");

    let (objects_before, bytes_before) = from
        .iter()
        .fold((0, 0), |(count, bytes), (_, size)| (count + 1, bytes + size));

    let mut scavenger = Scavenger {
        heap,
        from,
        to,
        promotion_age: heap.config.promotion_age,
        promoted: Vec::new(),
        copies: Vec::new(),
        remembered: HashSet::new(),
        error: None,
        stats: CycleStats::default(),
    };

    {
        let _phase = trace_phase(GcPhase::Scavenge);
        log_phase_start(GcPhase::Scavenge, bytes_before);
        timer.start();
        let classes = heap.classes.read();

        heap.visit_roots(roots, &mut |slot| {
            scavenger.evacuate(slot);
        });

        let hosts: Vec<usize> = heap.remembered.lock().drain().collect();
        for &host in &hosts {
            let size = scavenger.old_object_size(host);
            // SAFETY: remembered hosts are live old or large objects.
            let object = unsafe { HeapObject::from_address(host) };
            if scavenger.scan_object(object, size, &classes) {
                scavenger.remembered.insert(host);
            }
        }

        scavenger.process(&classes);
        if let Some(err) = scavenger.error.take() {
            scavenger.undo(roots, &hosts, &classes);
            timer.end_mark();
            log_phase_end(GcPhase::Scavenge, 0);
            return Err(err);
        }
        timer.end_mark();
        log_phase_end(GcPhase::Scavenge, bytes_before - scavenger.stats.bytes_surviving);
    }

    {
        let _phase = trace_phase(GcPhase::Weak);
        timer.start();
        scavenger.purge_weak_objects();
        timer.end_weak();
    }

    heap.remembered.lock().extend(scavenger.remembered.drain());

    let mut stats = scavenger.stats;
    stats.objects_collected = objects_before - stats.objects_surviving;
    stats.bytes_collected = bytes_before - stats.bytes_surviving;
    Ok(stats)
}
