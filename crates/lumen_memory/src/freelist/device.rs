//! Device freelist: metadata kept in host memory, located by search.

use super::block::BlockArena;
use super::BlockRange;
use crate::address::{align_up, validate_alignment, Address, DeviceAddress};
use crate::allocator::{
    check_ceiling, growth_error, Allocator, AllocatorInfo, AllocatorKind, AllocatorStats,
};
use crate::config::FreelistConfig;
use crate::error::{MemoryError, MemoryResult};

/// Best-fit freelist over device memory.
///
/// Device memory cannot carry headers, so every block record lives in a
/// host-side arena and allocated blocks are additionally linked into a
/// resident list. `deallocate` scans that list for the block containing
/// the offset.
///
/// # Handle validation
///
/// The scan only accepts an offset equal to the start handed out for the
/// containing block. An offset that falls inside a live block without
/// matching its start fails with `InvalidHandle` and the block is left
/// alone. A foreign handle that happens to equal a live start in the same
/// memory object cannot be told apart and is the caller's responsibility.
///
/// Sizes and alignments are raised to `config.unit`. Extents are requested
/// from upstream sized `max(size, initial_extent_size)` rounded up to
/// `max_alignment`, and aligned to `max_alignment`.
pub struct DeviceFreelistAllocator<U>
where
    U: Allocator<Address = DeviceAddress>,
{
    upstream: U,
    config: FreelistConfig,
    arena: BlockArena<DeviceAddress>,
}

impl<U> DeviceFreelistAllocator<U>
where
    U: Allocator<Address = DeviceAddress>,
{
    /// Creates an empty freelist. No memory is requested until the first
    /// allocation.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a bad config (including a unit above
    /// `max_alignment`), `AlignmentTooLarge` if `config.max_alignment`
    /// exceeds the upstream ceiling.
    pub fn new(upstream: U, config: FreelistConfig) -> MemoryResult<Self> {
        config.validate()?;
        if config.unit > config.max_alignment {
            return Err(MemoryError::InvalidConfig(format!(
                "freelist.unit {} exceeds max_alignment {}",
                config.unit, config.max_alignment
            )));
        }
        check_ceiling(config.max_alignment, &upstream)?;
        Ok(Self {
            upstream,
            config,
            arena: BlockArena::new(config.unit),
        })
    }

    /// The construction settings.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &FreelistConfig {
        &self.config
    }

    /// Every block in address order.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockRange<DeviceAddress>> {
        self.arena.blocks()
    }

    /// Every free block.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<BlockRange<DeviceAddress>> {
        self.arena.free_blocks()
    }

    /// Returns every extent to upstream.
    ///
    /// Outstanding handles dangle afterwards.
    ///
    /// # Errors
    ///
    /// The first error reported by upstream; every extent is still attempted.
    pub fn release(&mut self) -> MemoryResult<()> {
        let mut result = Ok(());
        for extent in self.arena.take_extents() {
            if let Err(error) = self.upstream.deallocate(extent.base) {
                result = result.and(Err(error));
            }
        }
        result
    }

    fn grow(&mut self, size: u64) -> MemoryResult<()> {
        let request = align_up(
            size.max(self.config.initial_extent_size),
            self.config.max_alignment,
        )?;

        let base = self
            .upstream
            .allocate(request, self.config.max_alignment)
            .map_err(growth_error(request))?;
        self.arena.add_extent(base, request);

        tracing::debug!(
            "device freelist: new extent of {} bytes in memory {} at +{}",
            request,
            base.memory,
            base.offset
        );
        Ok(())
    }
}

impl<U> AllocatorInfo for DeviceFreelistAllocator<U>
where
    U: Allocator<Address = DeviceAddress>,
{
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::DeviceFreelist
    }

    fn max_alignment(&self) -> u64 {
        self.config.max_alignment
    }

    fn stats(&self) -> AllocatorStats {
        self.arena.stats()
    }

    fn upstream(&self) -> Option<&dyn AllocatorInfo> {
        Some(&self.upstream)
    }
}

impl<U> Allocator for DeviceFreelistAllocator<U>
where
    U: Allocator<Address = DeviceAddress>,
{
    type Address = DeviceAddress;

    fn allocate(&mut self, size: u64, alignment: u64) -> MemoryResult<DeviceAddress> {
        let alignment =
            validate_alignment(alignment, self.config.max_alignment)?.max(self.config.unit);
        let size = align_up(size.max(1), self.config.unit)?;

        let fit = match self.arena.best_fit(size, alignment, 0) {
            Some(fit) => fit,
            None => {
                self.grow(size)?;
                self.arena
                    .best_fit(size, alignment, 0)
                    .ok_or(MemoryError::OutOfMemory { requested: size })?
            }
        };

        let index = self.arena.claim(fit, size);
        self.arena.add_resident(index);
        Ok(self.arena.address_of(index))
    }

    fn deallocate(&mut self, address: DeviceAddress) -> MemoryResult<()> {
        let index = self
            .arena
            .find_resident(address.region(), address.offset)
            .ok_or_else(|| MemoryError::invalid_handle(address))?;

        if !self.arena.is_live(index, address.offset) {
            tracing::warn!(
                "device freelist: {:?} points inside a live block, not at its start",
                address
            );
            return Err(MemoryError::invalid_handle(address));
        }

        self.arena.remove_resident(index);
        self.arena.release(index);
        Ok(())
    }
}

impl<U> Drop for DeviceFreelistAllocator<U>
where
    U: Allocator<Address = DeviceAddress>,
{
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::warn!("device freelist: failed to release extents: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MemoryId;
    use crate::config::HeapConfig;
    use crate::leaf::LeafAllocator;
    use crate::source::DeviceHeap;

    fn freelist(extent: u64) -> DeviceFreelistAllocator<LeafAllocator<DeviceHeap>> {
        let leaf = LeafAllocator::new(DeviceHeap::new(HeapConfig::default()));
        DeviceFreelistAllocator::new(leaf, FreelistConfig::new(extent, 256)).unwrap()
    }

    #[test]
    fn test_sizes_round_to_unit() {
        let mut list = freelist(1024);
        let a = list.allocate(1, 1).unwrap();
        let b = list.allocate(1, 1).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16);
        assert_eq!(list.stats().bytes_in_use, 32);
    }

    #[test]
    fn test_interior_offset_is_rejected() {
        let mut list = freelist(1024);
        let a = list.allocate(256, 16).unwrap();
        let inside = DeviceAddress::new(a.memory, a.offset + 64);

        assert!(matches!(list.deallocate(inside), Err(MemoryError::InvalidHandle(_))));
        assert_eq!(list.stats().live_allocations, 1);
        list.deallocate(a).unwrap();
    }

    #[test]
    fn test_unknown_memory_is_rejected() {
        let mut list = freelist(1024);
        let _a = list.allocate(64, 16).unwrap();
        assert!(matches!(
            list.deallocate(DeviceAddress::new(MemoryId(999), 0)),
            Err(MemoryError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_freed_range_is_not_resident() {
        let mut list = freelist(1024);
        let a = list.allocate(64, 16).unwrap();
        list.deallocate(a).unwrap();
        assert!(matches!(list.deallocate(a), Err(MemoryError::InvalidHandle(_))));
    }

    #[test]
    fn test_unit_above_ceiling_is_rejected() {
        let leaf = LeafAllocator::new(DeviceHeap::new(HeapConfig::default()));
        let config = FreelistConfig {
            initial_extent_size: 1024,
            max_alignment: 64,
            unit: 256,
        };
        assert!(matches!(
            DeviceFreelistAllocator::new(leaf, config),
            Err(MemoryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_drop_returns_extent_to_heap() {
        let heap = DeviceHeap::new(HeapConfig::default());
        {
            let leaf = LeafAllocator::new(heap.clone());
            let mut list = DeviceFreelistAllocator::new(leaf, FreelistConfig::new(4096, 256)).unwrap();
            let _a = list.allocate(100, 64).unwrap();
            assert_eq!(heap.live_objects(), 1);
        }
        assert_eq!(heap.live_objects(), 0);
    }
}
