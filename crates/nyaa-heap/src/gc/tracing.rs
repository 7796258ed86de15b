//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collection cycles. Without it every helper
//! compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of a collection cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Fold pending write-barrier records into the remembered set.
        Clear,
        /// Trace the live object graph.
        Mark,
        /// Free unmarked objects.
        Sweep,
        /// Evacuate live old pages.
        Compact,
        /// Copy live young objects.
        Scavenge,
        /// Clear dead weak references.
        Weak,
    }

    /// Stable identifier for a GC run.
    ///
    /// Correlates every event of one collection. Monotonically increasing
    /// across all heaps of the process, starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire GC collection.
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a GC phase.
    pub fn log_phase_start(phase: GcPhase, bytes_before: usize) {
        tracing::debug!(phase = ?phase, bytes_before, "phase_start");
    }

    /// Log the end of a GC phase.
    pub fn log_phase_end(phase: GcPhase, bytes_reclaimed: usize) {
        tracing::debug!(phase = ?phase, bytes_reclaimed, "phase_end");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub phase when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Fold pending write-barrier records into the remembered set.
        Clear,
        /// Trace the live object graph.
        Mark,
        /// Free unmarked objects.
        Sweep,
        /// Evacuate live old pages.
        Compact,
        /// Copy live young objects.
        Scavenge,
        /// Clear dead weak references.
        Weak,
    }

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }

    /// Stub span guard.
    pub struct EnteredSpan;

    /// Stub function when tracing is disabled.
    pub const fn trace_gc_collection(_collection_type: &str, _gc_id: GcId) -> EnteredSpan {
        EnteredSpan
    }

    /// Stub function when tracing is disabled.
    pub const fn trace_phase(_phase: GcPhase) -> EnteredSpan {
        EnteredSpan
    }

    /// Stub function when tracing is disabled.
    pub const fn log_phase_start(_phase: GcPhase, _bytes_before: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_phase_end(_phase: GcPhase, _bytes_reclaimed: usize) {}
}

pub use internal::GcId;
