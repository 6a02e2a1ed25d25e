//! # Monotonic Allocator
//!
//! A bump allocator for temporary allocations that are freed all at once.

use crate::address::{checked_align_up, validate_alignment, Address, HostPtr};
use crate::allocator::{
    check_ceiling, growth_error, Allocator, AllocatorInfo, AllocatorKind, AllocatorStats,
    HostSpace,
};
use crate::config::MonotonicConfig;
use crate::error::{MemoryError, MemoryResult};

#[derive(Clone, Copy, Debug)]
struct ArenaChunk<A> {
    base: A,
    size: u64,
}

impl<A: Address> ArenaChunk<A> {
    #[inline]
    fn end(&self) -> u64 {
        self.base.offset() + self.size
    }
}

/// A bump-pointer arena allocator.
///
/// Allocations are fast (just bump a cursor). When the current chunk is
/// full a new one is requested from upstream, at least
/// `max(chunk_size, size + max_alignment)` bytes, and `chunk_size` doubles.
/// Individual frees do nothing; memory comes back all at once through
/// [`reset`](Self::reset), which keeps the first chunk warm for reuse.
///
/// # Thread Safety
///
/// This arena is NOT thread-safe. Use one arena per thread.
///
/// # Example
///
/// ```rust,ignore
/// let mut scratch = MonotonicAllocator::new(host_arena, MonotonicConfig::new(64 * 1024, 64))?;
///
/// // Fast allocations
/// let vertices = scratch.allocate(4096, 16)?;
///
/// // End of frame: free everything, keep one chunk
/// scratch.reset()?;
/// ```
pub struct MonotonicAllocator<U: Allocator> {
    upstream: U,
    config: MonotonicConfig,
    chunks: Vec<ArenaChunk<U::Address>>,
    /// Current allocation offset inside the last chunk.
    cursor: u64,
    /// Minimum size of the next chunk.
    next_chunk_size: u64,
    /// Allocations since the last reset.
    allocations: u64,
    /// Bytes handed out since the last reset.
    used: u64,
}

impl<U: Allocator> MonotonicAllocator<U> {
    /// Creates an empty arena. No memory is requested until the first
    /// allocation.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a bad config, `AlignmentTooLarge` if
    /// `config.max_alignment` exceeds the upstream ceiling.
    pub fn new(upstream: U, config: MonotonicConfig) -> MemoryResult<Self> {
        config.validate()?;
        check_ceiling(config.max_alignment, &upstream)?;
        Ok(Self {
            upstream,
            config,
            chunks: Vec::new(),
            cursor: 0,
            next_chunk_size: config.initial_chunk_size,
            allocations: 0,
            used: 0,
        })
    }

    /// Returns the total size of all chunks in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    /// Returns the bytes handed out since the last reset.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.used
    }

    /// Returns the bytes left in the current chunk.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.chunks
            .last()
            .map_or(0, |chunk| chunk.end().saturating_sub(self.cursor))
    }

    /// Returns the number of chunks held from upstream.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Resets the arena, invalidating all previous allocations.
    ///
    /// Every chunk but the first goes back to upstream and the cursor
    /// rewinds to the start of the first chunk.
    ///
    /// # Errors
    ///
    /// The first error reported by upstream; every chunk is still attempted.
    pub fn reset(&mut self) -> MemoryResult<()> {
        let extra = if self.chunks.len() > 1 {
            self.chunks.split_off(1)
        } else {
            Vec::new()
        };

        let mut result = Ok(());
        for chunk in extra {
            if let Err(error) = self.upstream.deallocate(chunk.base) {
                result = result.and(Err(error));
            }
        }

        self.cursor = self.chunks.first().map_or(0, |chunk| chunk.base.offset());
        self.allocations = 0;
        self.used = 0;

        tracing::debug!("monotonic: reset, keeping {} bytes", self.capacity());
        result
    }

    /// Returns every chunk to upstream, including the first.
    ///
    /// The arena starts over afterwards: the next chunk is
    /// `initial_chunk_size` again.
    ///
    /// # Errors
    ///
    /// The first error reported by upstream; every chunk is still attempted.
    pub fn release(&mut self) -> MemoryResult<()> {
        let mut result = self.reset();
        if let Some(chunk) = self.chunks.pop() {
            if let Err(error) = self.upstream.deallocate(chunk.base) {
                result = result.and(Err(error));
            }
        }
        self.cursor = 0;
        self.next_chunk_size = self.config.initial_chunk_size;
        result
    }

    fn grow(&mut self, size: u64) -> MemoryResult<U::Address> {
        let request = size
            .checked_add(self.config.max_alignment)
            .ok_or(MemoryError::OutOfMemory { requested: size })?
            .max(self.next_chunk_size);

        let base = self
            .upstream
            .allocate(request, self.config.max_alignment)
            .map_err(growth_error(request))?;
        self.chunks.push(ArenaChunk { base, size: request });
        self.next_chunk_size = self.next_chunk_size.saturating_mul(2);

        tracing::debug!("monotonic: chunk {} of {} bytes at {:?}", self.chunks.len(), request, base);
        Ok(base)
    }
}

impl<U: Allocator> AllocatorInfo for MonotonicAllocator<U> {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Monotonic
    }

    fn max_alignment(&self) -> u64 {
        self.config.max_alignment
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            live_allocations: self.allocations,
            bytes_in_use: self.used,
            extents: self.chunks.len() as u64,
            extent_bytes: self.capacity(),
        }
    }

    fn upstream(&self) -> Option<&dyn AllocatorInfo> {
        Some(&self.upstream)
    }
}

impl<U: Allocator> Allocator for MonotonicAllocator<U> {
    type Address = U::Address;

    fn allocate(&mut self, size: u64, alignment: u64) -> MemoryResult<U::Address> {
        let alignment = validate_alignment(alignment, self.config.max_alignment)?;

        if let Some(chunk) = self.chunks.last() {
            let end = checked_align_up(self.cursor, alignment)
                .and_then(|begin| begin.checked_add(size).map(|end| (begin, end)));
            if let Some((begin, end)) = end {
                if end <= chunk.end() {
                    let address = chunk.base.with_offset(begin);
                    self.cursor = end;
                    self.allocations += 1;
                    self.used += size;
                    return Ok(address);
                }
            }
        }

        // Chunks are aligned to max_alignment, so the start fits any request.
        let base = self.grow(size)?;
        self.cursor = base.offset() + size;
        self.allocations += 1;
        self.used += size;
        Ok(base)
    }

    /// Does nothing: memory is reclaimed by [`MonotonicAllocator::reset`].
    fn deallocate(&mut self, _address: U::Address) -> MemoryResult<()> {
        Ok(())
    }
}

impl<U: Allocator + HostSpace> HostSpace for MonotonicAllocator<U> {
    fn read_bytes(&self, address: HostPtr, buf: &mut [u8]) -> MemoryResult<()> {
        self.upstream.read_bytes(address, buf)
    }

    fn write_bytes(&mut self, address: HostPtr, data: &[u8]) -> MemoryResult<()> {
        self.upstream.write_bytes(address, data)
    }
}

impl<U: Allocator> Drop for MonotonicAllocator<U> {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::warn!("monotonic: failed to release chunks: {}", error);
        }
    }
}
