//! # Leaf Allocator
//!
//! The bottom of every chain: one extent from one external source.

use crate::address::{validate_alignment, HostPtr};
use crate::allocator::{Allocator, AllocatorInfo, AllocatorKind, AllocatorStats, HostSpace};
use crate::error::{MemoryError, MemoryResult};
use crate::source::MemorySource;

/// The extent a leaf currently owns.
#[derive(Clone, Copy, Debug)]
struct LeafExtent<A> {
    address: A,
    size: u64,
}

/// One-shot wrapper around a [`MemorySource`].
///
/// The first `allocate` obtains a single extent and returns its start. A
/// second `allocate` before the matching `deallocate` fails with
/// `AlreadyAllocated`: a leaf backs exactly one composed allocator above
/// it. `deallocate` returns the extent to the source and the leaf becomes
/// reusable.
///
/// Dropping the leaf releases a still-live extent.
pub struct LeafAllocator<S: MemorySource> {
    source: S,
    extent: Option<LeafExtent<S::Address>>,
}

impl<S: MemorySource> LeafAllocator<S> {
    /// Wraps a source.
    #[must_use]
    pub const fn new(source: S) -> Self {
        Self {
            source,
            extent: None,
        }
    }

    /// Returns the wrapped source.
    #[inline]
    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Returns true while an extent is live.
    #[inline]
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.extent.is_some()
    }
}

impl<S: MemorySource> AllocatorInfo for LeafAllocator<S> {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Leaf
    }

    fn max_alignment(&self) -> u64 {
        self.source.max_alignment()
    }

    fn stats(&self) -> AllocatorStats {
        match self.extent {
            Some(extent) => AllocatorStats {
                live_allocations: 1,
                bytes_in_use: extent.size,
                extents: 1,
                extent_bytes: extent.size,
            },
            None => AllocatorStats::default(),
        }
    }

    fn upstream(&self) -> Option<&dyn AllocatorInfo> {
        None
    }
}

impl<S: MemorySource> Allocator for LeafAllocator<S> {
    type Address = S::Address;

    fn allocate(&mut self, size: u64, alignment: u64) -> MemoryResult<S::Address> {
        if let Some(extent) = self.extent {
            return Err(MemoryError::AlreadyAllocated { size: extent.size });
        }
        let alignment = validate_alignment(alignment, self.source.max_alignment())?;
        if size > self.source.max_extent_size() {
            return Err(MemoryError::OutOfMemory { requested: size });
        }

        let address = self.source.acquire(size, alignment)?;
        self.extent = Some(LeafExtent { address, size });
        Ok(address)
    }

    fn deallocate(&mut self, address: S::Address) -> MemoryResult<()> {
        match self.extent {
            Some(extent) if extent.address == address => {
                self.source.release(address)?;
                self.extent = None;
                Ok(())
            }
            _ => Err(MemoryError::invalid_handle(address)),
        }
    }
}

impl<S: MemorySource + HostSpace> HostSpace for LeafAllocator<S> {
    fn read_bytes(&self, address: HostPtr, buf: &mut [u8]) -> MemoryResult<()> {
        self.source.read_bytes(address, buf)
    }

    fn write_bytes(&mut self, address: HostPtr, data: &[u8]) -> MemoryResult<()> {
        self.source.write_bytes(address, data)
    }
}

impl<S: MemorySource> Drop for LeafAllocator<S> {
    fn drop(&mut self) {
        if let Some(extent) = self.extent.take() {
            if let Err(error) = self.source.release(extent.address) {
                tracing::warn!("leaf: failed to release extent {:?}: {}", extent.address, error);
            }
        }
    }
}
