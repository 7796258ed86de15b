//! Error types.
//!
//! Allocation failure is an ordinary, recoverable result: callers are expected
//! to run a collection and retry. Heap corruption is not represented here; it
//! panics where it is detected.

use std::fmt;

use crate::heap::SpaceKind;

/// Result of every allocation entry point.
pub type AllocationResult<T> = Result<T, AllocError>;

/// Why an allocation could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The space is full and could not be grown.
    OutOfMemory {
        /// Space that refused the request.
        space: SpaceKind,
        /// Requested size in bytes.
        requested: usize,
    },
    /// The request can never be satisfied (zero size, alignment above a word).
    BadRequest {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
    },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { space, requested } => {
                write!(f, "{space} space out of memory allocating {requested} bytes")
            }
            Self::BadRequest { size, align } => {
                write!(f, "unsatisfiable allocation of {size} bytes aligned to {align}")
            }
        }
    }
}

impl std::error::Error for AllocError {}

/// Why a collection cycle could not complete.
///
/// A failed cycle leaves the heap consistent. A minor cycle that cannot place
/// a copy is undone, so every young object keeps its address. A compaction
/// that runs out of pages is undone and finished as an in-place sweep. Either
/// way the heap can be collected again once memory has been freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// The survive area could not hold the copies of live young objects.
    SurvivorOverflow {
        /// Size of the object that did not fit.
        requested: usize,
    },
    /// Old space refused a promoted object.
    PromotionFailed(AllocError),
    /// Old space refused a page while compacting; dead objects were still
    /// swept in place.
    CompactionFailed(AllocError),
    /// A collection was requested while one was already running.
    Reentrant,
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SurvivorOverflow { requested } => {
                write!(f, "survive area overflow copying {requested} bytes")
            }
            Self::PromotionFailed(err) => write!(f, "promotion failed: {err}"),
            Self::CompactionFailed(err) => write!(f, "compaction failed: {err}"),
            Self::Reentrant => f.write_str("collection requested during a collection"),
        }
    }
}

impl std::error::Error for GcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PromotionFailed(err) | Self::CompactionFailed(err) => Some(err),
            _ => None,
        }
    }
}

/// Why a class could not be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassError {
    /// The payload type needs more than word alignment.
    Misaligned {
        /// Alignment of the payload type.
        align: usize,
    },
    /// The class table is full.
    TooManyClasses,
}

impl fmt::Display for ClassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned { align } => {
                write!(f, "payload alignment {align} exceeds the heap word")
            }
            Self::TooManyClasses => f.write_str("class table is full"),
        }
    }
}

impl std::error::Error for ClassError {}

/// First constraint a [`HeapConfig`](crate::HeapConfig) violates.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A semi-space is below the minimum size.
    NewSpaceTooSmall {
        /// Configured size.
        size: usize,
        /// Smallest accepted size.
        min: usize,
    },
    /// The old-space limit is below the minimum.
    OldSpaceTooSmall {
        /// Configured limit.
        size: usize,
        /// Smallest accepted limit.
        min: usize,
    },
    /// The large-object threshold does not fit an old-space page.
    LargeThresholdTooBig {
        /// Configured threshold.
        threshold: usize,
        /// Largest accepted threshold.
        max: usize,
    },
    /// A trigger rate is outside `(0, 1]`.
    TriggerRate {
        /// Which rate.
        name: &'static str,
        /// Configured value.
        value: f64,
    },
    /// Promotion age above what a header can count.
    PromotionAge {
        /// Configured value.
        age: u8,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewSpaceTooSmall { size, min } => {
                write!(f, "new space size {size} is below the minimum {min}")
            }
            Self::OldSpaceTooSmall { size, min } => {
                write!(f, "old space limit {size} is below the minimum {min}")
            }
            Self::LargeThresholdTooBig { threshold, max } => {
                write!(f, "large object threshold {threshold} exceeds {max}")
            }
            Self::TriggerRate { name, value } => {
                write!(f, "{name} must be in (0, 1], got {value}")
            }
            Self::PromotionAge { age } => write!(f, "promotion age {age} is too large"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Why a bytecode word or node is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BytecodeError {
    /// The opcode field names no opcode.
    UnknownOpcode(u8),
    /// The scale field is not one of the three operand widths.
    InvalidScale(u8),
    /// An operand does not fit the signed 24-bit range.
    OperandOutOfRange(i64),
    /// The number of operands does not match the opcode.
    KindMismatch {
        /// Mnemonic of the opcode.
        opcode: &'static str,
        /// Operands the opcode takes.
        expected: usize,
        /// Operands supplied.
        found: usize,
    },
    /// Bits above the last operand are set.
    TrailingBits(u64),
}

impl fmt::Display for BytecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode(id) => write!(f, "unknown opcode {id:#04x}"),
            Self::InvalidScale(scale) => write!(f, "invalid operand scale {scale}"),
            Self::OperandOutOfRange(value) => write!(f, "operand {value} does not fit 24 bits"),
            Self::KindMismatch {
                opcode,
                expected,
                found,
            } => write!(f, "{opcode} takes {expected} operands, got {found}"),
            Self::TrailingBits(word) => write!(f, "trailing bits set in {word:#018x}"),
        }
    }
}

impl std::error::Error for BytecodeError {}

/// A [`BytecodeError`] at a position of an instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamError {
    /// Index of the offending word.
    pub index: usize,
    /// What was wrong with it.
    pub error: BytecodeError,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "word {}: {}", self.index, self.error)
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
