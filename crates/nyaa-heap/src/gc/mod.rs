//! Garbage collection.
//!
//! Three stop-the-world collectors share the heap's root set:
//! - [`scavenger`]: copies live young objects into the survive area or
//!   promotes them to old space.
//! - [`marking`]: marks from the roots and sweeps dead old and large
//!   objects back into the free lists.
//! - [`compact`]: marks, then evacuates every live old page into fresh pages
//!   and rewrites every reference.
//!
//! A [`CollectionKind::Full`] cycle runs a scavenge followed by a
//! mark-compact.

mod compact;
mod marking;
mod scavenger;
pub mod tracing;

use std::fmt;
use std::time::Instant;

use crate::config::HeapConfig;
use crate::error::GcError;
use crate::heap::Heap;
use crate::metrics::{CollectionType, GcMetrics, PhaseTimer};
use crate::roots::RootProvider;
use self::tracing::internal::{
    log_phase_end, log_phase_start, next_gc_id, trace_gc_collection, trace_phase, GcPhase,
};

/// Which collector to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    /// Scavenge the young generation.
    Minor,
    /// Mark the heap and sweep old and large space in place.
    MarkSweep,
    /// Mark the heap and evacuate old space into fresh pages.
    MarkCompact,
    /// Scavenge, then mark-compact.
    Full,
}

impl CollectionKind {
    const fn collection_type(self) -> CollectionType {
        match self {
            Self::Minor => CollectionType::Minor,
            Self::MarkSweep => CollectionType::MarkSweep,
            Self::MarkCompact => CollectionType::MarkCompact,
            Self::Full => CollectionType::Full,
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection_type().name())
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// Usage snapshot handed to a [`CollectCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectInfo {
    young_used: usize,
    young_capacity: usize,
    old_used: usize,
    old_limit: usize,
    large_used: usize,
    collections: usize,
}

impl CollectInfo {
    pub(crate) const fn new(
        young_used: usize,
        young_capacity: usize,
        old_used: usize,
        old_limit: usize,
        large_used: usize,
        collections: usize,
    ) -> Self {
        Self {
            young_used,
            young_capacity,
            old_used,
            old_limit,
            large_used,
            collections,
        }
    }

    /// Bytes allocated in the original semi-space.
    #[must_use]
    pub const fn young_used(&self) -> usize {
        self.young_used
    }

    /// Capacity of one semi-space.
    #[must_use]
    pub const fn young_capacity(&self) -> usize {
        self.young_capacity
    }

    /// Bytes allocated in old space.
    #[must_use]
    pub const fn old_used(&self) -> usize {
        self.old_used
    }

    /// Most bytes old space may map.
    #[must_use]
    pub const fn old_limit(&self) -> usize {
        self.old_limit
    }

    /// Bytes held by large objects.
    #[must_use]
    pub const fn large_used(&self) -> usize {
        self.large_used
    }

    /// Collections run so far.
    #[must_use]
    pub const fn collections(&self) -> usize {
        self.collections
    }
}

/// Decides whether a collection is due and of which kind.
pub type CollectCondition = fn(&CollectInfo, &HeapConfig) -> Option<CollectionKind>;

/// Major cycle once old and large usage reaches `major_gc_trigger` of the
/// old-space limit, otherwise a minor cycle once the original semi-space
/// reaches `minor_gc_trigger`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn default_collect_condition(info: &CollectInfo, config: &HeapConfig) -> Option<CollectionKind> {
    let old = (info.old_used + info.large_used) as f64;
    if old >= info.old_limit as f64 * config.major_gc_trigger {
        return Some(CollectionKind::MarkSweep);
    }
    let young = info.young_used as f64;
    if young >= info.young_capacity as f64 * config.minor_gc_trigger {
        return Some(CollectionKind::Minor);
    }
    None
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run one cycle. The caller holds the GC lock.
pub(crate) fn run(
    heap: &Heap,
    kind: CollectionKind,
    roots: &mut dyn RootProvider,
) -> Result<GcMetrics, GcError> {
    let gc_id = next_gc_id();
    let _span = trace_gc_collection(kind.collection_type().name(), gc_id);
    let start = Instant::now();
    let mut timer = PhaseTimer::new();
    let mut metrics = GcMetrics {
        collection_type: kind.collection_type(),
        ..GcMetrics::new()
    };

    {
        let _phase = trace_phase(GcPhase::Clear);
        log_phase_start(GcPhase::Clear, 0);
        heap.drain_remembered_buffer();
        log_phase_end(GcPhase::Clear, 0);
    }
    match kind {
        CollectionKind::Minor => {
            scavenger::scavenge(heap, roots, &mut timer)?.add_to(&mut metrics);
        }
        CollectionKind::MarkSweep => {
            marking::mark_sweep(heap, roots, &mut timer).add_to(&mut metrics);
        }
        CollectionKind::MarkCompact => {
            compact::mark_compact(heap, roots, &mut timer)?.add_to(&mut metrics);
        }
        CollectionKind::Full => {
            scavenger::scavenge(heap, roots, &mut timer)?.add_to(&mut metrics);
            let major = compact::mark_compact(heap, roots, &mut timer)?;
            // Objects that survived the scavenge are counted again by the mark.
            metrics.bytes_surviving = 0;
            metrics.objects_surviving = 0;
            major.add_to(&mut metrics);
        }
    }

    metrics.record_phases(&timer);
    metrics.duration = start.elapsed();
    Ok(metrics)
}

/// Counters produced by one collector pass.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CycleStats {
    pub bytes_collected: usize,
    pub objects_collected: usize,
    pub bytes_surviving: usize,
    pub objects_surviving: usize,
    pub bytes_promoted: usize,
    pub weak_cleared: usize,
    pub pages_released: usize,
}

impl CycleStats {
    fn add_to(self, metrics: &mut GcMetrics) {
        metrics.bytes_collected += self.bytes_collected;
        metrics.objects_collected += self.objects_collected;
        metrics.bytes_surviving += self.bytes_surviving;
        metrics.objects_surviving += self.objects_surviving;
        metrics.bytes_promoted += self.bytes_promoted;
        metrics.weak_cleared += self.weak_cleared;
        metrics.pages_released += self.pages_released;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(young_used: usize, old_used: usize) -> CollectInfo {
        CollectInfo::new(young_used, 1000, old_used, 1000, 0, 0)
    }

    #[test]
    fn test_default_condition() {
        let config = HeapConfig::default();
        assert_eq!(default_collect_condition(&info(0, 0), &config), None);
        assert_eq!(
            default_collect_condition(&info(900, 0), &config),
            Some(CollectionKind::Minor)
        );
        assert_eq!(
            default_collect_condition(&info(900, 800), &config),
            Some(CollectionKind::MarkSweep)
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(CollectionKind::MarkCompact.to_string(), "mark_compact");
    }
}
