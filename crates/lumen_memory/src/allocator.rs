//! # Allocator Contract
//!
//! Every strategy and leaf implements the same two traits:
//!
//! - [`AllocatorInfo`] is object safe and describes an allocator: its kind,
//!   its alignment ceiling, its statistics and the allocator it draws from.
//! - [`Allocator`] adds `allocate` / `deallocate` over a concrete
//!   [`Address`] type.
//!
//! Strategies own (or borrow, through `&mut A`) their upstream, so a chain
//! such as pool-on-freelist-on-leaf is just a nested type:
//!
//! ```rust,ignore
//! let leaf = LeafAllocator::new(DeviceHeap::new(HeapConfig::default()));
//! let freelist = DeviceFreelistAllocator::new(leaf, FreelistConfig::default())?;
//! let mut pool = PoolAllocator::new(freelist, PoolConfig::new(256, 256))?;
//! let slot = pool.allocate(256, 256)?;
//! ```

use crate::address::{Address, HostPtr};
use crate::error::{MemoryError, MemoryResult};
use std::fmt;

/// The strategy an allocator implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// One-shot wrapper around an external heap.
    Leaf,
    /// Best-fit freelist over host memory.
    HostFreelist,
    /// Best-fit freelist over device memory.
    DeviceFreelist,
    /// Fixed-size slot pool.
    Pool,
    /// Bump arena.
    Monotonic,
    /// Lock wrapper around another allocator.
    Shared,
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Leaf => "leaf",
            Self::HostFreelist => "host-freelist",
            Self::DeviceFreelist => "device-freelist",
            Self::Pool => "pool",
            Self::Monotonic => "monotonic",
            Self::Shared => "shared",
        };
        f.write_str(name)
    }
}

/// Point-in-time accounting for one allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Allocations handed out and not yet returned.
    pub live_allocations: u64,
    /// Bytes requested by live allocations (after rounding).
    pub bytes_in_use: u64,
    /// Extents (or chunks) currently held from upstream.
    pub extents: u64,
    /// Total size of those extents.
    pub extent_bytes: u64,
}

impl AllocatorStats {
    /// Bytes held from upstream but not handed out.
    #[inline]
    #[must_use]
    pub const fn bytes_free(&self) -> u64 {
        self.extent_bytes.saturating_sub(self.bytes_in_use)
    }
}

/// Object-safe description of an allocator.
pub trait AllocatorInfo {
    /// The strategy this allocator implements.
    fn kind(&self) -> AllocatorKind;

    /// Largest alignment this allocator accepts.
    fn max_alignment(&self) -> u64;

    /// Current accounting.
    fn stats(&self) -> AllocatorStats;

    /// The allocator this one draws extents from, or `None` for a leaf.
    fn upstream(&self) -> Option<&dyn AllocatorInfo>;
}

/// The allocation contract shared by every strategy.
pub trait Allocator: AllocatorInfo {
    /// The address space this allocator hands out.
    type Address: Address;

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// - `AlignmentTooLarge` / `InvalidAlignment` for a bad alignment.
    /// - `OutOfMemory` if the upstream allocator could not provide an extent.
    fn allocate(&mut self, size: u64, alignment: u64) -> MemoryResult<Self::Address>;

    /// Returns an allocation produced by this instance.
    ///
    /// # Errors
    ///
    /// `InvalidHandle` where the allocator is able to detect a foreign handle.
    fn deallocate(&mut self, address: Self::Address) -> MemoryResult<()>;
}

/// Byte access to host memory.
///
/// Host allocators forward to their upstream until the request reaches the
/// heap that owns the bytes. Copy-in/copy-out keeps this usable through a
/// lock (see [`SharedAllocator`](crate::shared::SharedAllocator)).
pub trait HostSpace {
    /// Copies `buf.len()` bytes starting at `address` into `buf`.
    ///
    /// # Errors
    ///
    /// `InvalidHandle` if the range is not inside live host memory.
    fn read_bytes(&self, address: HostPtr, buf: &mut [u8]) -> MemoryResult<()>;

    /// Copies `data` into memory starting at `address`.
    ///
    /// # Errors
    ///
    /// `InvalidHandle` if the range is not inside live host memory.
    fn write_bytes(&mut self, address: HostPtr, data: &[u8]) -> MemoryResult<()>;
}

impl<A: AllocatorInfo + ?Sized> AllocatorInfo for &mut A {
    fn kind(&self) -> AllocatorKind {
        (**self).kind()
    }

    fn max_alignment(&self) -> u64 {
        (**self).max_alignment()
    }

    fn stats(&self) -> AllocatorStats {
        (**self).stats()
    }

    fn upstream(&self) -> Option<&dyn AllocatorInfo> {
        (**self).upstream()
    }
}

impl<A: Allocator + ?Sized> Allocator for &mut A {
    type Address = A::Address;

    fn allocate(&mut self, size: u64, alignment: u64) -> MemoryResult<Self::Address> {
        (**self).allocate(size, alignment)
    }

    fn deallocate(&mut self, address: Self::Address) -> MemoryResult<()> {
        (**self).deallocate(address)
    }
}

impl<A: HostSpace + ?Sized> HostSpace for &mut A {
    fn read_bytes(&self, address: HostPtr, buf: &mut [u8]) -> MemoryResult<()> {
        (**self).read_bytes(address, buf)
    }

    fn write_bytes(&mut self, address: HostPtr, data: &[u8]) -> MemoryResult<()> {
        (**self).write_bytes(address, data)
    }
}

/// Lists the kinds of an allocator chain, starting with `allocator` itself.
#[must_use]
pub fn chain(allocator: &dyn AllocatorInfo) -> Vec<AllocatorKind> {
    let mut kinds = vec![allocator.kind()];
    let mut current = allocator.upstream();
    while let Some(next) = current {
        kinds.push(next.kind());
        current = next.upstream();
    }
    kinds
}

/// Checks at construction time that a strategy's ceiling fits its upstream.
pub(crate) fn check_ceiling(max_alignment: u64, upstream: &dyn AllocatorInfo) -> MemoryResult<()> {
    if !max_alignment.is_power_of_two() {
        return Err(MemoryError::InvalidAlignment(max_alignment));
    }
    if max_alignment > upstream.max_alignment() {
        return Err(MemoryError::AlignmentTooLarge {
            requested: max_alignment,
            max: upstream.max_alignment(),
        });
    }
    Ok(())
}

/// Maps an upstream growth failure to the error the strategy reports.
///
/// A one-shot leaf refusing a second extent means the chain is exhausted.
pub(crate) fn growth_error(requested: u64) -> impl FnOnce(MemoryError) -> MemoryError {
    move |error| match error {
        MemoryError::AlreadyAllocated { .. } => MemoryError::OutOfMemory { requested },
        other => other,
    }
}
