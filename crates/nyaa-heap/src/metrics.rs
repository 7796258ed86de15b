//! GC metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Statistics from the most recent garbage collection of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Duration of the whole cycle.
    pub duration: Duration,
    /// Bytes reclaimed.
    pub bytes_collected: usize,
    /// Objects reclaimed.
    pub objects_collected: usize,
    /// Bytes that survived.
    pub bytes_surviving: usize,
    /// Objects that survived.
    pub objects_surviving: usize,
    /// Bytes copied from the young generation into old space.
    pub bytes_promoted: usize,
    /// Weak references cleared.
    pub weak_cleared: usize,
    /// Old pages returned to the free ring or the OS.
    pub pages_released: usize,
    /// Kind of cycle.
    pub collection_type: CollectionType,
    /// Collections run by this heap so far, this one included.
    pub total_collections: usize,
    /// Duration of root scanning and marking (or copying, for a scavenge).
    pub mark_duration: Duration,
    /// Duration of sweeping, compaction or the flip.
    pub sweep_duration: Duration,
    /// Duration of the weak reference pass.
    pub weak_duration: Duration,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            bytes_collected: 0,
            objects_collected: 0,
            bytes_surviving: 0,
            objects_surviving: 0,
            bytes_promoted: 0,
            weak_cleared: 0,
            pages_released: 0,
            collection_type: CollectionType::None,
            total_collections: 0,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            weak_duration: Duration::ZERO,
        }
    }

    pub(crate) fn record_phases(&mut self, timer: &PhaseTimer) {
        self.mark_duration = timer.mark;
        self.sweep_duration = timer.sweep;
        self.weak_duration = timer.weak;
    }
}

/// Type of GC collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Scavenge of the young generation.
    Minor = 1,
    /// Mark and sweep of old and large space.
    MarkSweep = 2,
    /// Mark and compact of old space, sweep of large space.
    MarkCompact = 3,
    /// Scavenge followed by mark-compact.
    Full = 4,
}

impl CollectionType {
    /// Short lowercase name, used in spans and printer lines.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minor => "minor",
            Self::MarkSweep => "mark_sweep",
            Self::MarkCompact => "mark_compact",
            Self::Full => "full",
        }
    }

    /// Returns `true` for cycles that mark the whole heap.
    #[must_use]
    pub const fn is_major(self) -> bool {
        matches!(self, Self::MarkSweep | Self::MarkCompact | Self::Full)
    }
}

/// Helper for capturing phase durations.
///
/// # Example
///
/// ```
/// use nyaa_heap::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... mark phase work ...
/// timer.end_mark();
///
/// timer.start();
/// // ... sweep phase work ...
/// timer.end_sweep();
/// assert!(timer.total() >= timer.mark);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Accumulated mark (or copy) time.
    pub mark: Duration,
    /// Accumulated sweep (or compact) time.
    pub sweep: Duration,
    /// Accumulated weak pass time.
    pub weak: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            weak: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the mark phase and add its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark += start.elapsed();
        }
    }

    /// End the sweep phase and add its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep += start.elapsed();
        }
    }

    /// End the weak phase and add its duration.
    pub fn end_weak(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.weak += start.elapsed();
        }
    }

    /// Sum of the recorded phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.mark + self.sweep + self.weak
    }
}

/// Process-level cumulative GC statistics over every heap.
///
/// # Example
///
/// ```
/// use nyaa_heap::global_metrics;
///
/// let metrics = global_metrics();
/// println!("Total collections: {}", metrics.total_collections());
/// println!("Total bytes collected: {}", metrics.total_bytes_collected());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    minor_collections: AtomicUsize,
    major_collections: AtomicUsize,
    bytes_collected: AtomicUsize,
    objects_collected: AtomicUsize,
    bytes_promoted: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create a new `GlobalMetrics` with all counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            minor_collections: AtomicUsize::new(0),
            major_collections: AtomicUsize::new(0),
            bytes_collected: AtomicUsize::new(0),
            objects_collected: AtomicUsize::new(0),
            bytes_promoted: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, metrics: &GcMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        match metrics.collection_type {
            CollectionType::Minor => {
                self.minor_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::MarkSweep | CollectionType::MarkCompact | CollectionType::Full => {
                self.major_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::None => {}
        }
        self.bytes_collected
            .fetch_add(metrics.bytes_collected, Ordering::Relaxed);
        self.objects_collected
            .fetch_add(metrics.objects_collected, Ordering::Relaxed);
        self.bytes_promoted
            .fetch_add(metrics.bytes_promoted, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        self.pause_ns
            .fetch_add(metrics.duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Returns the total number of collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of minor collections performed.
    #[inline]
    #[must_use]
    pub fn total_minor_collections(&self) -> usize {
        self.minor_collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of major collections performed.
    #[inline]
    #[must_use]
    pub fn total_major_collections(&self) -> usize {
        self.major_collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of bytes collected.
    #[inline]
    #[must_use]
    pub fn total_bytes_collected(&self) -> usize {
        self.bytes_collected.load(Ordering::Relaxed)
    }

    /// Returns the total number of objects collected.
    #[inline]
    #[must_use]
    pub fn total_objects_collected(&self) -> usize {
        self.objects_collected.load(Ordering::Relaxed)
    }

    /// Returns the total number of bytes promoted to old space.
    #[inline]
    #[must_use]
    pub fn total_bytes_promoted(&self) -> usize {
        self.bytes_promoted.load(Ordering::Relaxed)
    }

    /// Returns the total pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Get the global cumulative GC metrics.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_accumulates() {
        let mut timer = PhaseTimer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_mark();
        let first = timer.mark;
        timer.start();
        timer.end_mark();
        assert!(timer.mark >= first);
        assert_eq!(timer.sweep, Duration::ZERO);
    }

    #[test]
    fn test_end_without_start_is_ignored() {
        let mut timer = PhaseTimer::new();
        timer.end_sweep();
        assert_eq!(timer.total(), Duration::ZERO);
    }

    #[test]
    fn test_global_record() {
        let global = GlobalMetrics::new();
        let metrics = GcMetrics {
            collection_type: CollectionType::MarkCompact,
            bytes_collected: 128,
            objects_collected: 4,
            ..GcMetrics::new()
        };
        global.record(&metrics);
        global.record(&GcMetrics {
            collection_type: CollectionType::Minor,
            ..GcMetrics::new()
        });
        assert_eq!(global.total_collections(), 2);
        assert_eq!(global.total_major_collections(), 1);
        assert_eq!(global.total_minor_collections(), 1);
        assert_eq!(global.total_bytes_collected(), 128);
        assert_eq!(global.total_objects_collected(), 4);
    }

    #[test]
    fn test_collection_type_names() {
        assert_eq!(CollectionType::Full.name(), "full");
        assert!(CollectionType::MarkSweep.is_major());
        assert!(!CollectionType::Minor.is_major());
    }
}
