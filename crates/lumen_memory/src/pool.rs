//! # Pool Allocator
//!
//! Fixed-size block allocator for objects that are frequently allocated and freed.

use crate::address::{validate_alignment, Address, HostPtr};
use crate::allocator::{
    check_ceiling, growth_error, Allocator, AllocatorInfo, AllocatorKind, AllocatorStats,
    HostSpace,
};
use crate::config::PoolConfig;
use crate::error::{MemoryError, MemoryResult};

/// One upstream extent cut into equal slots.
#[derive(Clone, Debug)]
struct PoolChunk<A> {
    base: A,
    /// One flag per slot, set while the slot is handed out.
    live: Vec<bool>,
}

impl<A: Address> PoolChunk<A> {
    #[inline]
    fn slots(&self) -> u64 {
        self.live.len() as u64
    }

    /// Address of slot `slot`.
    #[inline]
    fn slot_address(&self, slot: usize, stride: u64) -> A {
        self.base.with_offset(self.base.offset() + slot as u64 * stride)
    }

    /// Index of the slot starting at `address`, if this chunk has one.
    fn slot_of(&self, address: A, stride: u64) -> Option<usize> {
        if address.region() != self.base.region() || address.offset() < self.base.offset() {
            return None;
        }
        let distance = address.offset() - self.base.offset();
        if distance % stride != 0 || distance / stride >= self.slots() {
            return None;
        }
        usize::try_from(distance / stride).ok()
    }
}

/// A free slot: chunk index and slot index within the chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SlotRef {
    chunk: usize,
    slot: usize,
}

/// A pool allocator for fixed-size blocks.
///
/// Every slot has the same size and alignment, fixed at construction. Slots
/// can be allocated and freed individually. When the free-slot stack runs
/// dry a new chunk is requested from upstream; the slot count per chunk
/// starts at 1 and doubles with every chunk. Chunks go back to upstream only
/// when the pool is released or dropped.
///
/// Every slot carries a live flag, so freeing a slot twice, or freeing one
/// that was never handed out, fails with `InvalidHandle`.
///
/// Works over host and device memory alike.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. Use one pool per thread or wrap it in a
/// [`SharedAllocator`](crate::shared::SharedAllocator).
///
/// # Example
///
/// ```rust,ignore
/// // Pool of 256-byte uniform blocks on top of a device freelist
/// let mut pool = PoolAllocator::new(freelist, PoolConfig::new(256, 256))?;
///
/// // Allocate - O(1) once a chunk exists
/// let slot = pool.allocate(256, 256)?;
///
/// // Free - O(1), no coalescing
/// pool.deallocate(slot)?;
/// ```
pub struct PoolAllocator<U: Allocator> {
    upstream: U,
    config: PoolConfig,
    /// Distance between slot starts.
    stride: u64,
    /// Free slots, popped from the back.
    free_list: Vec<SlotRef>,
    chunks: Vec<PoolChunk<U::Address>>,
    /// Slot count of the next chunk.
    next_chunk_slots: u64,
    /// Number of allocated slots.
    allocated_count: u64,
}

impl<U: Allocator> PoolAllocator<U> {
    /// Creates an empty pool. No memory is requested until the first
    /// allocation.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a bad config, `AlignmentTooLarge` if the block
    /// alignment exceeds the upstream ceiling.
    pub fn new(upstream: U, config: PoolConfig) -> MemoryResult<Self> {
        config.validate()?;
        check_ceiling(config.block_alignment, &upstream)?;
        let stride = crate::address::align_up(config.block_size, config.block_alignment)?;
        Ok(Self {
            upstream,
            config,
            stride,
            free_list: Vec::new(),
            chunks: Vec::new(),
            next_chunk_slots: 1,
            allocated_count: 0,
        })
    }

    /// Returns the fixed block size.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.config.block_size
    }

    /// Returns the total number of slots across all chunks.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.chunks.iter().map(PoolChunk::slots).sum()
    }

    /// Returns the number of currently allocated slots.
    #[inline]
    #[must_use]
    pub const fn allocated_count(&self) -> u64 {
        self.allocated_count
    }

    /// Returns the number of free slots.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Returns the number of chunks held from upstream.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Marks every slot free again.
    ///
    /// No memory goes back upstream. Outstanding handles must not be used.
    pub fn clear(&mut self) {
        self.free_list.clear();
        for (chunk, entry) in self.chunks.iter_mut().enumerate().rev() {
            entry.live.fill(false);
            self.free_list
                .extend((0..entry.live.len()).rev().map(|slot| SlotRef { chunk, slot }));
        }
        self.allocated_count = 0;
    }

    /// Returns every chunk to upstream.
    ///
    /// Outstanding handles dangle afterwards.
    ///
    /// # Errors
    ///
    /// The first error reported by upstream; every chunk is still attempted.
    pub fn release(&mut self) -> MemoryResult<()> {
        self.free_list.clear();
        self.allocated_count = 0;
        self.next_chunk_slots = 1;

        let mut result = Ok(());
        for chunk in std::mem::take(&mut self.chunks) {
            if let Err(error) = self.upstream.deallocate(chunk.base) {
                result = result.and(Err(error));
            }
        }
        result
    }

    /// Requests the next chunk and returns its first slot, not yet marked live.
    fn grow(&mut self) -> MemoryResult<SlotRef> {
        let slots = self.next_chunk_slots;
        let out_of_memory = MemoryError::OutOfMemory { requested: u64::MAX };
        let size = self
            .stride
            .checked_mul(slots)
            .ok_or_else(|| out_of_memory.clone())?;
        let count = usize::try_from(slots).map_err(|_| out_of_memory)?;

        let base = self
            .upstream
            .allocate(size, self.config.block_alignment)
            .map_err(growth_error(size))?;
        let chunk = self.chunks.len();
        self.chunks.push(PoolChunk {
            base,
            live: vec![false; count],
        });

        // Reverse so slots pop in address order.
        self.free_list
            .extend((1..count).rev().map(|slot| SlotRef { chunk, slot }));
        self.next_chunk_slots = slots.saturating_mul(2);

        tracing::debug!("pool: chunk {} with {} slots at {:?}", chunk + 1, slots, base);
        Ok(SlotRef { chunk, slot: 0 })
    }
}

impl<U: Allocator> AllocatorInfo for PoolAllocator<U> {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Pool
    }

    fn max_alignment(&self) -> u64 {
        self.config.block_alignment
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            live_allocations: self.allocated_count,
            bytes_in_use: self.allocated_count * self.stride,
            extents: self.chunks.len() as u64,
            extent_bytes: self.capacity() * self.stride,
        }
    }

    fn upstream(&self) -> Option<&dyn AllocatorInfo> {
        Some(&self.upstream)
    }
}

impl<U: Allocator> Allocator for PoolAllocator<U> {
    type Address = U::Address;

    /// Allocates one slot.
    ///
    /// This is a **O(1)** operation while free slots remain.
    fn allocate(&mut self, size: u64, alignment: u64) -> MemoryResult<U::Address> {
        validate_alignment(alignment, self.config.block_alignment)?;
        if size > self.config.block_size {
            return Err(MemoryError::SizeExceedsBlock {
                requested: size,
                block_size: self.config.block_size,
            });
        }

        let free = match self.free_list.pop() {
            Some(free) => free,
            None => self.grow()?,
        };
        let chunk = &mut self.chunks[free.chunk];
        chunk.live[free.slot] = true;
        self.allocated_count += 1;
        Ok(chunk.slot_address(free.slot, self.stride))
    }

    /// Returns a slot to the free stack.
    ///
    /// Finding the owning chunk walks the chunk list, which grows
    /// logarithmically with the slot count since chunk sizes double. The
    /// slot itself is checked and released in O(1).
    fn deallocate(&mut self, address: U::Address) -> MemoryResult<()> {
        let stride = self.stride;
        let found = self.chunks.iter().enumerate().find_map(|(chunk, entry)| {
            entry
                .slot_of(address, stride)
                .map(|slot| SlotRef { chunk, slot })
        });

        let Some(free) = found else {
            return Err(MemoryError::invalid_handle(address));
        };
        let live = &mut self.chunks[free.chunk].live[free.slot];
        if !*live {
            return Err(MemoryError::invalid_handle(address));
        }

        *live = false;
        self.free_list.push(free);
        self.allocated_count -= 1;
        Ok(())
    }
}

impl<U: Allocator + HostSpace> HostSpace for PoolAllocator<U> {
    fn read_bytes(&self, address: HostPtr, buf: &mut [u8]) -> MemoryResult<()> {
        self.upstream.read_bytes(address, buf)
    }

    fn write_bytes(&mut self, address: HostPtr, data: &[u8]) -> MemoryResult<()> {
        self.upstream.write_bytes(address, data)
    }
}

impl<U: Allocator> Drop for PoolAllocator<U> {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::warn!("pool: failed to release chunks: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DeviceAddress;
    use crate::config::{FreelistConfig, HeapConfig};
    use crate::freelist::DeviceFreelistAllocator;
    use crate::leaf::LeafAllocator;
    use crate::source::DeviceHeap;

    type Upstream = DeviceFreelistAllocator<LeafAllocator<DeviceHeap>>;

    fn upstream() -> Upstream {
        let leaf = LeafAllocator::new(DeviceHeap::new(HeapConfig::default()));
        DeviceFreelistAllocator::new(leaf, FreelistConfig::new(1 << 20, 256)).unwrap()
    }

    #[test]
    fn test_pool_allocate_free() {
        let mut pool = PoolAllocator::new(upstream(), PoolConfig::new(48, 16)).unwrap();

        let h1 = pool.allocate(48, 16).unwrap();
        assert_eq!(pool.allocated_count(), 1);
        assert_eq!(pool.chunk_count(), 1);

        pool.deallocate(h1).unwrap();
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_pool_chunks_double() {
        let mut pool = PoolAllocator::new(upstream(), PoolConfig::new(64, 64)).unwrap();
        let slots: Vec<DeviceAddress> = (0..7).map(|_| pool.allocate(64, 64).unwrap()).collect();

        // 1 + 2 + 4 slots
        assert_eq!(pool.chunk_count(), 3);
        assert_eq!(pool.capacity(), 7);
        assert_eq!(pool.free_count(), 0);

        // Slots within a chunk are handed out in address order.
        assert_eq!(slots[2].offset, slots[1].offset + 64);

        let _eighth = pool.allocate(64, 64).unwrap();
        assert_eq!(pool.chunk_count(), 4);
        assert_eq!(pool.capacity(), 15);
    }

    #[test]
    fn test_pool_reuse() {
        let mut pool = PoolAllocator::new(upstream(), PoolConfig::new(32, 16)).unwrap();

        let h1 = pool.allocate(32, 16).unwrap();
        pool.deallocate(h1).unwrap();

        let h2 = pool.allocate(32, 16).unwrap();
        assert_eq!(h1, h2); // Same slot reused
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_pool_rejects_oversized_and_overaligned() {
        let mut pool = PoolAllocator::new(upstream(), PoolConfig::new(32, 16)).unwrap();
        assert_eq!(
            pool.allocate(33, 16),
            Err(MemoryError::SizeExceedsBlock { requested: 33, block_size: 32 })
        );
        assert_eq!(
            pool.allocate(32, 32),
            Err(MemoryError::AlignmentTooLarge { requested: 32, max: 16 })
        );
    }

    #[test]
    fn test_pool_rejects_foreign_slot() {
        let mut pool = PoolAllocator::new(upstream(), PoolConfig::new(64, 64)).unwrap();
        let slot = pool.allocate(64, 64).unwrap();
        let misaligned = DeviceAddress::new(slot.memory, slot.offset + 8);
        assert!(matches!(pool.deallocate(misaligned), Err(MemoryError::InvalidHandle(_))));
        pool.deallocate(slot).unwrap();
    }

    #[test]
    fn test_pool_rejects_double_free() {
        let mut pool = PoolAllocator::new(upstream(), PoolConfig::new(64, 64)).unwrap();
        let a = pool.allocate(64, 64).unwrap();
        let _b = pool.allocate(64, 64).unwrap();

        pool.deallocate(a).unwrap();
        assert!(matches!(pool.deallocate(a), Err(MemoryError::InvalidHandle(_))));
        assert_eq!(pool.allocated_count(), 1);

        // The slot went back once, so the next two allocations differ.
        let x = pool.allocate(64, 64).unwrap();
        let y = pool.allocate(64, 64).unwrap();
        assert_ne!(x, y);
    }

    #[test]
    fn test_pool_rejects_never_allocated_slot() {
        let mut pool = PoolAllocator::new(upstream(), PoolConfig::new(64, 64)).unwrap();
        let _a = pool.allocate(64, 64).unwrap();
        let b = pool.allocate(64, 64).unwrap();

        // The second chunk holds two slots; the one after `b` was never handed out.
        let unused = DeviceAddress::new(b.memory, b.offset + 64);
        assert!(matches!(pool.deallocate(unused), Err(MemoryError::InvalidHandle(_))));
        assert_eq!(pool.allocated_count(), 2);

        let x = pool.allocate(64, 64).unwrap();
        let y = pool.allocate(64, 64).unwrap();
        assert_eq!(x, unused);
        assert_ne!(x, y);
    }

    #[test]
    fn test_pool_clear_and_release() {
        let mut pool = PoolAllocator::new(upstream(), PoolConfig::new(64, 64)).unwrap();
        for _ in 0..3 {
            pool.allocate(64, 64).unwrap();
        }
        pool.clear();
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(pool.free_count(), 3);

        // Cleared slots read as free again.
        let slot = pool.allocate(64, 64).unwrap();
        pool.deallocate(slot).unwrap();
        assert!(matches!(pool.deallocate(slot), Err(MemoryError::InvalidHandle(_))));

        pool.release().unwrap();
        assert_eq!(pool.chunk_count(), 0);
        assert_eq!(pool.upstream().map(|u| u.stats().live_allocations), Some(0));
    }
}
