//! # Address Spaces
//!
//! The framework manages two kinds of memory with the same algorithms:
//!
//! ```text
//! host space:    HostPtr(0x7f3a_2c00_0040)          real process address
//! device space:  DeviceAddress { memory: #3, +4096 } opaque object + offset
//! ```
//!
//! Strategies never look inside an address. They only need to know which
//! region it lives in, where in that region it points, and how to point
//! somewhere else in the same region. That is the [`Address`] trait.

use crate::error::{MemoryError, MemoryResult};
use std::fmt;

/// A location produced by an allocator.
///
/// Addresses order by `(region, offset)`, which is the order freelist
/// blocks are kept in.
pub trait Address: Copy + Eq + fmt::Debug {
    /// Identifies the contiguous region the address lives in.
    ///
    /// All host memory shares region 0. Each device memory object is its
    /// own region.
    fn region(self) -> u64;

    /// Position inside the region.
    fn offset(self) -> u64;

    /// Same region, different offset.
    #[must_use]
    fn with_offset(self, offset: u64) -> Self;
}

/// A host address: a real, dereferenceable location in process memory.
///
/// The bytes behind a `HostPtr` are reached through
/// [`HostSpace`](crate::allocator::HostSpace), never by casting.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPtr(u64);

impl HostPtr {
    /// Wraps a raw address.
    #[inline]
    #[must_use]
    pub const fn new(address: u64) -> Self {
        Self(address)
    }

    /// Returns the raw address.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true if the address is a multiple of `alignment`.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 % alignment == 0
    }
}

impl fmt::Debug for HostPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostPtr({:#x})", self.0)
    }
}

impl Address for HostPtr {
    #[inline]
    fn region(self) -> u64 {
        0
    }

    #[inline]
    fn offset(self) -> u64 {
        self.0
    }

    #[inline]
    fn with_offset(self, offset: u64) -> Self {
        Self(offset)
    }
}

/// Opaque identifier of one device memory object (a GPU heap allocation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryId(pub u64);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A device address: an offset into a memory object the host cannot read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    /// The memory object the offset points into.
    pub memory: MemoryId,
    /// Byte offset from the start of the memory object.
    pub offset: u64,
}

impl DeviceAddress {
    /// Creates a device address.
    #[inline]
    #[must_use]
    pub const fn new(memory: MemoryId, offset: u64) -> Self {
        Self { memory, offset }
    }
}

impl Address for DeviceAddress {
    #[inline]
    fn region(self) -> u64 {
        self.memory.0
    }

    #[inline]
    fn offset(self) -> u64 {
        self.offset
    }

    #[inline]
    fn with_offset(self, offset: u64) -> Self {
        Self {
            memory: self.memory,
            offset,
        }
    }
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    match value.checked_add(alignment - 1) {
        Some(bumped) => Some(bumped & !(alignment - 1)),
        None => None,
    }
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two),
/// reporting overflow as `OutOfMemory`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> MemoryResult<u64> {
    checked_align_up(value, alignment).ok_or(MemoryError::OutOfMemory { requested: value })
}

/// Normalises and validates a requested alignment against a ceiling.
///
/// Zero means "no requirement" and becomes 1.
pub fn validate_alignment(alignment: u64, max_alignment: u64) -> MemoryResult<u64> {
    let alignment = alignment.max(1);
    if !alignment.is_power_of_two() {
        return Err(MemoryError::InvalidAlignment(alignment));
    }
    if alignment > max_alignment {
        return Err(MemoryError::AlignmentTooLarge {
            requested: alignment,
            max: max_alignment,
        });
    }
    Ok(alignment)
}
