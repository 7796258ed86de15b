//! Heap configuration.
//!
//! The heap trusts whatever [`HeapConfig`] it is built with. Embedders that
//! take sizes from users run [`HeapConfig::validate`] to reject bad input, or
//! [`HeapConfig::clamped`] to raise undersized values with a warning.

use crate::error::ConfigError;
use crate::heap::{PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::object::MAX_AGE;

/// Default capacity of each semi-space.
pub const DEFAULT_NEW_SPACE_SIZE: usize = 8 * 1024 * 1024;
/// Default old-space limit.
pub const DEFAULT_OLD_SPACE_LIMIT: usize = 512 * 1024 * 1024;
/// Default size above which objects go to the large-object space.
pub const DEFAULT_LARGE_OBJECT_THRESHOLD: usize = 256 * 1024;
/// Default fraction of the original area in use before a minor cycle.
pub const DEFAULT_MINOR_TRIGGER: f64 = 0.8;
/// Default fraction of the old-space limit in use before a major cycle.
pub const DEFAULT_MAJOR_TRIGGER: f64 = 0.75;
/// Default number of minor cycles an object survives before promotion.
pub const DEFAULT_PROMOTION_AGE: u8 = 1;
/// Default number of empty pages kept for reuse.
pub const DEFAULT_MAX_FREED_PAGES: usize = 8;
/// Default number of attempts to obtain a page from the OS.
pub const DEFAULT_ALLOCATE_RETRIES: usize = 3;

/// Smallest accepted semi-space.
pub const MIN_NEW_SPACE_SIZE: usize = 256 * 1024;
/// Smallest accepted old-space limit.
pub const MIN_OLD_SPACE_LIMIT: usize = 4 * PAGE_SIZE;

/// Sizes, limits and policies consumed by [`Heap::new`](crate::Heap::new).
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Capacity of each of the two semi-spaces, in bytes.
    pub new_space_size: usize,
    /// Upper bound on old-space pages, in bytes.
    pub old_space_limit: usize,
    /// Objects strictly larger than this go to the large-object space.
    pub large_object_threshold: usize,
    /// Young usage rate that schedules a minor cycle.
    pub minor_gc_trigger: f64,
    /// Old usage rate that schedules a major cycle.
    pub major_gc_trigger: f64,
    /// Minor cycles survived before an object is promoted.
    pub promotion_age: u8,
    /// Empty old pages kept for reuse instead of returned to the OS.
    pub max_freed_pages: usize,
    /// Attempts made to obtain a page before reporting out-of-memory.
    pub allocate_retries: usize,
    /// Map retained free pages inaccessible so stale pointers fault.
    pub protect_free_pages: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            new_space_size: DEFAULT_NEW_SPACE_SIZE,
            old_space_limit: DEFAULT_OLD_SPACE_LIMIT,
            large_object_threshold: DEFAULT_LARGE_OBJECT_THRESHOLD,
            minor_gc_trigger: DEFAULT_MINOR_TRIGGER,
            major_gc_trigger: DEFAULT_MAJOR_TRIGGER,
            promotion_age: DEFAULT_PROMOTION_AGE,
            max_freed_pages: DEFAULT_MAX_FREED_PAGES,
            allocate_retries: DEFAULT_ALLOCATE_RETRIES,
            protect_free_pages: false,
        }
    }
}

/// Largest threshold an old-space page can still satisfy.
const fn max_large_threshold() -> usize {
    PAGE_SIZE - PAGE_HEADER_SIZE
}

impl HeapConfig {
    /// Check every constraint and report the first violation.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.new_space_size < MIN_NEW_SPACE_SIZE {
            return Err(ConfigError::NewSpaceTooSmall {
                size: self.new_space_size,
                min: MIN_NEW_SPACE_SIZE,
            });
        }
        if self.old_space_limit < MIN_OLD_SPACE_LIMIT {
            return Err(ConfigError::OldSpaceTooSmall {
                size: self.old_space_limit,
                min: MIN_OLD_SPACE_LIMIT,
            });
        }
        let max = max_large_threshold().min(self.new_space_size);
        if self.large_object_threshold > max {
            return Err(ConfigError::LargeThresholdTooBig {
                threshold: self.large_object_threshold,
                max,
            });
        }
        for (name, value) in [
            ("minor_gc_trigger", self.minor_gc_trigger),
            ("major_gc_trigger", self.major_gc_trigger),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::TriggerRate { name, value });
            }
        }
        if self.promotion_age > MAX_AGE {
            return Err(ConfigError::PromotionAge {
                age: self.promotion_age,
            });
        }
        Ok(())
    }

    /// Raise undersized values to their minimum and pull out-of-range ones
    /// back into range, warning about each adjustment.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        if self.new_space_size < MIN_NEW_SPACE_SIZE {
            warn_clamped("new_space_size", self.new_space_size, MIN_NEW_SPACE_SIZE);
            self.new_space_size = MIN_NEW_SPACE_SIZE;
        }
        if self.old_space_limit < MIN_OLD_SPACE_LIMIT {
            warn_clamped("old_space_limit", self.old_space_limit, MIN_OLD_SPACE_LIMIT);
            self.old_space_limit = MIN_OLD_SPACE_LIMIT;
        }
        let max = max_large_threshold().min(self.new_space_size);
        if self.large_object_threshold > max {
            warn_clamped("large_object_threshold", self.large_object_threshold, max);
            self.large_object_threshold = max;
        }
        if !(self.minor_gc_trigger > 0.0 && self.minor_gc_trigger <= 1.0) {
            warn_rate("minor_gc_trigger", self.minor_gc_trigger, DEFAULT_MINOR_TRIGGER);
            self.minor_gc_trigger = DEFAULT_MINOR_TRIGGER;
        }
        if !(self.major_gc_trigger > 0.0 && self.major_gc_trigger <= 1.0) {
            warn_rate("major_gc_trigger", self.major_gc_trigger, DEFAULT_MAJOR_TRIGGER);
            self.major_gc_trigger = DEFAULT_MAJOR_TRIGGER;
        }
        if self.promotion_age > MAX_AGE {
            warn_clamped(
                "promotion_age",
                usize::from(self.promotion_age),
                usize::from(MAX_AGE),
            );
            self.promotion_age = MAX_AGE;
        }
        self
    }
}

#[cfg(feature = "tracing")]
fn warn_clamped(name: &str, value: usize, to: usize) {
    tracing::warn!(option = name, value, clamped = to, "heap option out of range");
}

#[cfg(not(feature = "tracing"))]
const fn warn_clamped(_name: &str, _value: usize, _to: usize) {}

#[cfg(feature = "tracing")]
fn warn_rate(name: &str, value: f64, to: f64) {
    tracing::warn!(option = name, value, clamped = to, "heap trigger rate out of range");
}

#[cfg(not(feature = "tracing"))]
const fn warn_rate(_name: &str, _value: f64, _to: f64) {}
