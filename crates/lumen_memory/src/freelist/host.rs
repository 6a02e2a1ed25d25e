//! Host freelist: block headers embedded in the managed memory.

use super::block::BlockArena;
use super::BlockRange;
use crate::address::{align_up, validate_alignment, HostPtr};
use crate::allocator::{
    check_ceiling, growth_error, Allocator, AllocatorInfo, AllocatorKind, AllocatorStats,
    HostSpace,
};
use crate::config::FreelistConfig;
use crate::error::{MemoryError, MemoryResult};
use bytemuck::{Pod, Zeroable};

/// Written immediately before every user range.
///
/// ```text
/// +-------+-------+--------+---------------------+
/// | magic | block |  size  |      user data      |
/// +-------+-------+--------+---------------------+
///  u32     u32     u64     ^ handle
/// ```
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct BlockHeader {
    /// `HEADER_MAGIC` while the allocation is live, zero once freed.
    magic: u32,
    /// Index of the block record.
    block: u32,
    /// Rounded allocation size.
    size: u64,
}

const HEADER_LEN: usize = std::mem::size_of::<BlockHeader>();
const HEADER_SIZE: u64 = HEADER_LEN as u64;
const HEADER_MAGIC: u32 = 0x4C4D_4842;

/// Best-fit freelist over host memory.
///
/// The block record index of every allocation is stored in a header just
/// before the pointer handed out, so `deallocate` recovers its block by
/// stepping back one header. The header also carries a tag, which lets
/// `deallocate` reject pointers it never produced and double frees.
///
/// Sizes are rounded up to the header size. Extents are requested from
/// upstream sized at least `size + alignment + header`, and never less than
/// `initial_extent_size`.
pub struct HostFreelistAllocator<U>
where
    U: Allocator<Address = HostPtr> + HostSpace,
{
    upstream: U,
    config: FreelistConfig,
    arena: BlockArena<HostPtr>,
}

impl<U> HostFreelistAllocator<U>
where
    U: Allocator<Address = HostPtr> + HostSpace,
{
    /// Creates an empty freelist. No memory is requested until the first
    /// allocation.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a bad config, `AlignmentTooLarge` if
    /// `config.max_alignment` exceeds the upstream ceiling.
    pub fn new(upstream: U, config: FreelistConfig) -> MemoryResult<Self> {
        config.validate()?;
        check_ceiling(config.max_alignment, &upstream)?;
        Ok(Self {
            upstream,
            config,
            arena: BlockArena::new(HEADER_SIZE),
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
    pub fn blocks(&self) -> Vec<BlockRange<HostPtr>> {
        self.arena.blocks()
    }

    /// Every free block.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<BlockRange<HostPtr>> {
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

    fn grow(&mut self, size: u64, alignment: u64) -> MemoryResult<()> {
        let needed = size
            .checked_add(alignment)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or(MemoryError::OutOfMemory { requested: size })?;
        let request = align_up(needed.max(self.config.initial_extent_size), HEADER_SIZE)?;

        let base = self
            .upstream
            .allocate(request, self.config.max_alignment)
            .map_err(growth_error(request))?;
        self.arena.add_extent(base, request);

        tracing::debug!("host freelist: new extent of {} bytes at {:?}", request, base);
        Ok(())
    }

    fn header_address(address: HostPtr) -> MemoryResult<HostPtr> {
        address
            .get()
            .checked_sub(HEADER_SIZE)
            .map(HostPtr::new)
            .ok_or_else(|| MemoryError::invalid_handle(address))
    }
}

impl<U> AllocatorInfo for HostFreelistAllocator<U>
where
    U: Allocator<Address = HostPtr> + HostSpace,
{
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::HostFreelist
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

impl<U> Allocator for HostFreelistAllocator<U>
where
    U: Allocator<Address = HostPtr> + HostSpace,
{
    type Address = HostPtr;

    fn allocate(&mut self, size: u64, alignment: u64) -> MemoryResult<HostPtr> {
        let alignment = validate_alignment(alignment, self.config.max_alignment)?;
        let size = align_up(size.max(1), HEADER_SIZE)?;

        let fit = match self.arena.best_fit(size, alignment, HEADER_SIZE) {
            Some(fit) => fit,
            None => {
                self.grow(size, alignment)?;
                self.arena
                    .best_fit(size, alignment, HEADER_SIZE)
                    .ok_or(MemoryError::OutOfMemory { requested: size })?
            }
        };

        let header = BlockHeader {
            magic: HEADER_MAGIC,
            block: u32::try_from(fit.block)
                .map_err(|_| MemoryError::OutOfMemory { requested: size })?,
            size,
        };
        let index = self.arena.claim(fit, size);
        let address = self.arena.address_of(index);

        let header_at = HostPtr::new(fit.user_begin - HEADER_SIZE);
        if let Err(error) = self.upstream.write_bytes(header_at, bytemuck::bytes_of(&header)) {
            self.arena.release(index);
            return Err(error);
        }
        Ok(address)
    }

    fn deallocate(&mut self, address: HostPtr) -> MemoryResult<()> {
        let header_at = Self::header_address(address)?;
        let mut raw = [0u8; HEADER_LEN];
        self.upstream
            .read_bytes(header_at, &mut raw)
            .map_err(|_| MemoryError::invalid_handle(address))?;

        let header: BlockHeader = bytemuck::pod_read_unaligned(&raw);
        let index = header.block as usize;
        if header.magic != HEADER_MAGIC || !self.arena.is_live(index, address.get()) {
            return Err(MemoryError::invalid_handle(address));
        }
        tracing::trace!("host freelist: freeing {} bytes at {:?}", header.size, address);

        self.upstream
            .write_bytes(header_at, bytemuck::bytes_of(&BlockHeader::zeroed()))?;
        self.arena.release(index);
        Ok(())
    }
}

impl<U> HostSpace for HostFreelistAllocator<U>
where
    U: Allocator<Address = HostPtr> + HostSpace,
{
    fn read_bytes(&self, address: HostPtr, buf: &mut [u8]) -> MemoryResult<()> {
        self.upstream.read_bytes(address, buf)
    }

    fn write_bytes(&mut self, address: HostPtr, data: &[u8]) -> MemoryResult<()> {
        self.upstream.write_bytes(address, data)
    }
}

impl<U> Drop for HostFreelistAllocator<U>
where
    U: Allocator<Address = HostPtr> + HostSpace,
{
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::warn!("host freelist: failed to release extents: {}", error);
        }
    }
}
